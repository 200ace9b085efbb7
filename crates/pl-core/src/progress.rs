//! Worker status-line protocol.
//!
//! The worker writes newline-terminated lines to stdout:
//!
//! ```text
//! PROGRESS=<integer>
//! IMAGE=<hex>
//! <blank line>
//! ```
//!
//! A blank line or the end of the stream marks completion. Unknown lines are
//! skipped so newer workers can add status lines freely.

use futures::Stream;
use log::{debug, trace};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{ChannelError, ProtocolViolation};

const PROGRESS_PREFIX: &[u8] = b"PROGRESS=";
const IMAGE_PREFIX: &[u8] = b"IMAGE=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Progress(u32),
    Result(Vec<u8>),
    EndOfStream,
}

/// Parse one raw line. `Ok(None)` means the line is not part of the protocol.
pub fn parse_line(line: &[u8]) -> Result<Option<ProgressEvent>, ProtocolViolation> {
    let line = line.trim_ascii();

    if line.is_empty() {
        return Ok(Some(ProgressEvent::EndOfStream));
    }

    if let Some(value) = line.strip_prefix(PROGRESS_PREFIX) {
        let text = String::from_utf8_lossy(value);
        let parsed = text.trim().parse::<u32>();
        return match parsed {
            Ok(steps) => Ok(Some(ProgressEvent::Progress(steps))),
            Err(_) => Err(ProtocolViolation::InvalidProgress { value: text.into_owned() }),
        };
    }

    if let Some(payload) = line.strip_prefix(IMAGE_PREFIX) {
        return hex::decode(payload.trim_ascii())
            .map(|bytes| Some(ProgressEvent::Result(bytes)))
            .map_err(|source| ProtocolViolation::InvalidImage { source });
    }

    Ok(None)
}

/// Lazy, finite sequence of [`ProgressEvent`]s read from a worker's output.
///
/// Always finishes with exactly one [`ProgressEvent::EndOfStream`], after which
/// [`next_event`](Self::next_event) returns `None` forever. Protocol violations
/// are yielded as errors and reading continues; a read error is yielded once and
/// then the stream ends.
pub struct ProgressChannel<R> {
    reader: R,
    line: Vec<u8>,
    finished: bool,
    read_failed: bool,
}

impl<R: AsyncBufRead + Unpin> ProgressChannel<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            finished: false,
            read_failed: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next_event(&mut self) -> Option<Result<ProgressEvent, ChannelError>> {
        if self.finished {
            return None;
        }

        loop {
            if self.read_failed {
                return Some(Ok(self.finish()));
            }

            self.line.clear();
            let read = match self.reader.read_until(b'\n', &mut self.line).await {
                Ok(read) => read,
                Err(err) => {
                    self.read_failed = true;
                    return Some(Err(ChannelError::Read(err)));
                }
            };

            if read == 0 {
                debug!("Worker output closed");
                return Some(Ok(self.finish()));
            }

            trace!("Worker line: {}", String::from_utf8_lossy(&self.line).trim_end());

            match parse_line(&self.line) {
                Ok(Some(ProgressEvent::EndOfStream)) => {
                    debug!("Worker signalled completion");
                    return Some(Ok(self.finish()));
                }
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => continue,
                Err(violation) => return Some(Err(violation.into())),
            }
        }
    }

    /// Adapts the channel into a [`Stream`] with the same items.
    pub fn into_stream(self) -> impl Stream<Item = Result<ProgressEvent, ChannelError>> {
        futures::stream::unfold(self, |mut channel| async move {
            let item = channel.next_event().await?;
            Some((item, channel))
        })
    }

    fn finish(&mut self) -> ProgressEvent {
        self.finished = true;
        ProgressEvent::EndOfStream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, BufReader, ReadBuf};

    async fn collect(input: &[u8]) -> Vec<Result<ProgressEvent, String>> {
        let mut channel = ProgressChannel::new(input);
        let mut out = Vec::new();
        while let Some(item) = channel.next_event().await {
            out.push(item.map_err(|e| e.to_string()));
        }
        out
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_line(b"PROGRESS=3\n"), Ok(Some(ProgressEvent::Progress(3))));
        assert_eq!(parse_line(b"  PROGRESS=12  \r\n"), Ok(Some(ProgressEvent::Progress(12))));
    }

    #[test]
    fn test_parse_image() {
        assert_eq!(
            parse_line(b"IMAGE=89504e470d0a1a0a\n"),
            Ok(Some(ProgressEvent::Result(vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])))
        );
        assert_eq!(parse_line(b"IMAGE=FFfe"), Ok(Some(ProgressEvent::Result(vec![0xFF, 0xFE]))));
    }

    #[test]
    fn test_parse_blank_and_unknown() {
        assert_eq!(parse_line(b"\n"), Ok(Some(ProgressEvent::EndOfStream)));
        assert_eq!(parse_line(b"   \t"), Ok(Some(ProgressEvent::EndOfStream)));
        assert_eq!(parse_line(b"Loading model weights\n"), Ok(None));
        assert_eq!(parse_line(b"progress=3"), Ok(None));
        assert_eq!(parse_line(&[0xff, 0xfe, b'\n']), Ok(None));
    }

    #[test]
    fn test_parse_violations() {
        assert_eq!(
            parse_line(b"PROGRESS=abc"),
            Err(ProtocolViolation::InvalidProgress { value: "abc".into() })
        );
        for raw in ["-1", "99999999999"] {
            let line = format!("PROGRESS={raw}");
            let err = parse_line(line.as_bytes()).unwrap_err();
            assert_eq!(err, ProtocolViolation::InvalidProgress { value: raw.into() });
            assert_eq!(
                err.to_string(),
                format!("progress value `{raw}` is not a valid step count")
            );
        }
        assert!(matches!(
            parse_line(b"IMAGE=abc"),
            Err(ProtocolViolation::InvalidImage { source: hex::FromHexError::OddLength })
        ));
        assert!(matches!(
            parse_line(b"IMAGE=zz"),
            Err(ProtocolViolation::InvalidImage { .. })
        ));
    }

    #[tokio::test]
    async fn test_channel_stops_at_blank_line() {
        let events = collect(b"PROGRESS=3\nPROGRESS=7\nIMAGE=89504e470d0a1a0a\n\nPROGRESS=9\n").await;
        assert_eq!(
            events,
            vec![
                Ok(ProgressEvent::Progress(3)),
                Ok(ProgressEvent::Progress(7)),
                Ok(ProgressEvent::Result(vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])),
                Ok(ProgressEvent::EndOfStream),
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_closure_ends_stream() {
        let events = collect(b"step 1 of 2\nPROGRESS=1").await;
        assert_eq!(
            events,
            vec![Ok(ProgressEvent::Progress(1)), Ok(ProgressEvent::EndOfStream)]
        );
        assert_eq!(collect(b"").await, vec![Ok(ProgressEvent::EndOfStream)]);
    }

    #[tokio::test]
    async fn test_channel_continues_after_violation() {
        let events = collect(b"PROGRESS=abc\nPROGRESS=2\n").await;
        assert_eq!(events.len(), 3);
        assert!(events[0].is_err());
        assert_eq!(events[1], Ok(ProgressEvent::Progress(2)));
        assert_eq!(events[2], Ok(ProgressEvent::EndOfStream));
    }

    #[tokio::test]
    async fn test_channel_is_not_restartable() {
        let mut channel = ProgressChannel::new(&b"\n"[..]);
        assert!(matches!(channel.next_event().await, Some(Ok(ProgressEvent::EndOfStream))));
        assert!(channel.is_finished());
        assert!(channel.next_event().await.is_none());
        assert!(channel.next_event().await.is_none());
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker vanished")))
        }
    }

    #[tokio::test]
    async fn test_read_error_then_end() {
        let mut channel = ProgressChannel::new(BufReader::new(BrokenPipe));
        assert!(matches!(channel.next_event().await, Some(Err(ChannelError::Read(_)))));
        assert!(matches!(channel.next_event().await, Some(Ok(ProgressEvent::EndOfStream))));
        assert!(channel.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let events: Vec<_> = ProgressChannel::new(&b"PROGRESS=5\n"[..])
            .into_stream()
            .map(|item| item.map_err(|e| e.to_string()))
            .collect()
            .await;
        assert_eq!(
            events,
            vec![Ok(ProgressEvent::Progress(5)), Ok(ProgressEvent::EndOfStream)]
        );
    }
}
