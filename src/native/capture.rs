use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    /// Lossy UTF-8, never longer than `limit` bytes.
    pub fn into_string(self, limit: usize) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if text.len() > limit {
            let mut end = limit;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        text
    }
}

/// Reads `reader` until EOF, keeping at most `limit` bytes.
///
/// The first byte past the limit marks the capture truncated and cancels
/// `overflow`. Reading also ends when `stop` is cancelled.
pub async fn capture<R>(
    mut reader: R,
    limit: usize,
    overflow: CancellationToken,
    stop: CancellationToken,
) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut buf = [0u8; 8192];

    loop {
        let read = tokio::select! {
            biased;
            read = reader.read(&mut buf) => read,
            _ = stop.cancelled() => break,
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                let room = limit - captured.bytes.len();
                if n > room {
                    captured.bytes.extend_from_slice(&buf[..room]);
                    captured.truncated = true;
                    overflow.cancel();
                    break;
                }
                captured.bytes.extend_from_slice(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Output pipe read failed: {}", e);
                break;
            }
        }
    }

    captured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_under_limit() {
        let overflow = CancellationToken::new();

        let captured = capture(
            &b"Hello, World!\n"[..],
            1024,
            overflow.clone(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(captured.bytes, b"Hello, World!\n");
        assert!(!captured.truncated);
        assert!(!overflow.is_cancelled());
    }

    #[tokio::test]
    async fn test_capture_exactly_at_limit() {
        let data = vec![b'a'; 64];

        let captured = capture(
            &data[..],
            64,
            CancellationToken::new(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(captured.bytes.len(), 64);
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn test_capture_over_limit_signals_overflow() {
        let data = vec![b'a'; 100_000];
        let overflow = CancellationToken::new();

        let captured = capture(&data[..], 1000, overflow.clone(), CancellationToken::new()).await;

        assert_eq!(captured.bytes.len(), 1000);
        assert!(captured.truncated);
        assert!(overflow.is_cancelled());
    }

    #[tokio::test]
    async fn test_capture_stops_on_request() {
        let (_writer, reader) = tokio::io::duplex(64);
        let stop = CancellationToken::new();
        stop.cancel();

        let captured = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            capture(reader, 1024, CancellationToken::new(), stop),
        )
        .await
        .expect("capture should return once stopped");

        assert!(captured.bytes.is_empty());
        assert!(!captured.truncated);
    }

    #[test]
    fn test_into_string_respects_char_boundaries() {
        let captured = Captured {
            bytes: "héllo".as_bytes().to_vec(),
            truncated: true,
        };

        // 'é' spans bytes 1..3, so a 2-byte cut falls back to 1.
        assert_eq!(captured.into_string(2), "h");
    }

    #[test]
    fn test_into_string_replacement_chars_stay_within_limit() {
        let captured = Captured {
            bytes: vec![0xff; 10],
            truncated: false,
        };

        let text = captured.into_string(10);

        assert!(text.len() <= 10);
        assert!(text.chars().all(|c| c == char::REPLACEMENT_CHARACTER));
    }
}
