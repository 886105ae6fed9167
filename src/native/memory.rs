use std::{os::unix::fs::MetadataExt, time::Duration};

use nix::unistd::{SysconfVar, sysconf};

/// Processes whose memory a watchdog adds up: every member of a process
/// group, optionally only those owned by one uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pub pgid: i32,
    pub uid: Option<u32>,
}

/// `(pgrp, rss_pages)` from the contents of `/proc/<pid>/stat`.
pub fn parse_stat(stat: &str) -> Option<(i32, u64)> {
    // comm may contain spaces and parentheses, fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let pgrp = fields.get(2)?.parse().ok()?;
    let rss_pages = fields.get(21)?.parse().ok()?;
    Some((pgrp, rss_pages))
}

fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => 4096,
    }
}

/// Sum of the resident sets of every tracked process, scanned from `/proc`.
pub fn group_resident_bytes(tracked: Tracked) -> u64 {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    let page_size = page_size();

    entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter(|entry| match tracked.uid {
            Some(uid) => entry.metadata().is_ok_and(|meta| meta.uid() == uid),
            None => true,
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .filter(|(pgrp, _)| *pgrp == tracked.pgid)
        .map(|(_, rss_pages)| rss_pages * page_size)
        .sum()
}

/// Resolves once the tracked processes together hold more than
/// `limit_bytes` resident.
pub async fn watch_memory(tracked: Tracked, limit_bytes: u64, poll_interval: Duration) -> u64 {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let rss = tokio::task::spawn_blocking(move || group_resident_bytes(tracked))
            .await
            .unwrap_or(0);
        if rss > limit_bytes {
            return rss;
        }
    }
}
