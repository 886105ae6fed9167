use std::sync::Arc;

use dashmap::DashSet;

/// Unprivileged uids handed out one per run, so concurrent programs cannot
/// signal each other and `RLIMIT_NPROC` counts only one run's processes.
/// The gid of a lease equals its uid.
#[derive(Debug, Clone)]
pub struct UidPool {
    base: u32,
    count: u32,
    leased: Arc<DashSet<u32>>,
}

impl UidPool {
    pub fn new(base: u32, count: u32) -> Self {
        Self {
            base,
            count,
            leased: Arc::new(DashSet::new()),
        }
    }

    pub fn lease(&self) -> Option<UidLease> {
        (self.base..self.base.saturating_add(self.count))
            .find(|uid| self.leased.insert(*uid))
            .map(|uid| UidLease {
                uid,
                leased: self.leased.clone(),
            })
    }
}

#[derive(Debug)]
pub struct UidLease {
    uid: u32,
    leased: Arc<DashSet<u32>>,
}

impl UidLease {
    pub fn uid(&self) -> u32 {
        self.uid
    }
}

impl Drop for UidLease {
    fn drop(&mut self) {
        self.leased.remove(&self.uid);
    }
}
