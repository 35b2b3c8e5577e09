//! Length-prefixed framing.
//!
//! # Responsibilities
//! - Read exactly one header plus declared payload per frame
//! - Distinguish an idle peer (no frame started) from a stalled one (frame half-read)
//! - Report stream desynchronization instead of attempting to resume

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 4;

/// Offset of the payload length byte within the header.
pub const LENGTH_OFFSET: usize = 3;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Errors produced while reading a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream part-way through a frame.
    #[error("stream ended inside a frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    /// The peer stopped sending part-way through a frame.
    #[error("peer stalled inside a frame: expected {expected} bytes, received {received}")]
    Stalled { expected: usize, received: usize },

    /// Transport error part-way through a frame.
    #[error("I/O error inside a frame after {received} of {expected} bytes: {source}")]
    Interrupted {
        expected: usize,
        received: usize,
        #[source]
        source: io::Error,
    },

    /// Transport error between frames.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the byte boundary can no longer be trusted.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            FrameError::Truncated { .. } | FrameError::Stalled { .. } | FrameError::Interrupted { .. }
        )
    }
}

/// One header-plus-payload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: [u8; HEADER_SIZE],
    payload: Vec<u8>,
}

impl Frame {
    /// Split an encoded buffer into a frame.
    ///
    /// Trailing bytes beyond the declared payload length are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE,
                received: bytes.len(),
            });
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let expected = HEADER_SIZE + header[LENGTH_OFFSET] as usize;
        if bytes.len() < expected {
            return Err(FrameError::Truncated {
                expected,
                received: bytes.len(),
            });
        }
        Ok(Self {
            header,
            payload: bytes[HEADER_SIZE..expected].to_vec(),
        })
    }

    pub fn header(&self) -> &[u8; HEADER_SIZE] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Declared payload length.
    pub fn payload_len(&self) -> usize {
        self.header[LENGTH_OFFSET] as usize
    }

    /// Header and payload as one contiguous buffer, the form the codec expects.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Outcome of waiting for the next frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete frame arrived.
    Frame(Frame),
    /// No byte arrived within the read timeout. The stream is still aligned.
    Idle,
    /// The peer closed the stream cleanly between frames.
    Closed,
}

/// Reads frames from a byte stream with a bounded per-read timeout.
pub struct FrameReader<R> {
    inner: R,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        Self {
            inner,
            read_timeout,
        }
    }

    /// Wait for the next frame.
    ///
    /// A timeout before the first header byte is `Idle`. Once a frame has
    /// started, end-of-stream or a timeout is a desync error.
    pub async fn next_event(&mut self) -> Result<ReadEvent, FrameError> {
        let mut header = [0u8; HEADER_SIZE];
        let first = match timeout(self.read_timeout, self.inner.read(&mut header)).await {
            Err(_) => return Ok(ReadEvent::Idle),
            Ok(Ok(0)) => return Ok(ReadEvent::Closed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(FrameError::Io(e)),
        };
        self.fill(&mut header, first, 0, HEADER_SIZE).await?;

        let len = header[LENGTH_OFFSET] as usize;
        let mut payload = vec![0u8; len];
        if len > 0 {
            self.fill(&mut payload, 0, HEADER_SIZE, HEADER_SIZE + len)
                .await?;
        }

        Ok(ReadEvent::Frame(Frame { header, payload }))
    }

    async fn fill(
        &mut self,
        buf: &mut [u8],
        mut filled: usize,
        base: usize,
        expected: usize,
    ) -> Result<(), FrameError> {
        while filled < buf.len() {
            match timeout(self.read_timeout, self.inner.read(&mut buf[filled..])).await {
                Err(_) => {
                    return Err(FrameError::Stalled {
                        expected,
                        received: base + filled,
                    })
                }
                Ok(Ok(0)) => {
                    return Err(FrameError::Truncated {
                        expected,
                        received: base + filled,
                    })
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(source)) => {
                    return Err(FrameError::Interrupted {
                        expected,
                        received: base + filled,
                        source,
                    })
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    /// Reader that replays a fixed sequence of chunks and errors.
    struct Scripted(VecDeque<io::Result<Vec<u8>>>);

    impl AsyncRead for Scripted {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.0.pop_front() {
                Some(Ok(chunk)) => {
                    buf.put_slice(&chunk);
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    const SHORT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn reads_complete_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, SHORT);

        client.write_all(&[1, 16, 1, 2, b'{', b'}']).await.unwrap();

        match reader.next_event().await.unwrap() {
            ReadEvent::Frame(frame) => {
                assert_eq!(frame.header(), &[1, 16, 1, 2]);
                assert_eq!(frame.payload(), b"{}");
                assert_eq!(frame.to_bytes(), vec![1, 16, 1, 2, b'{', b'}']);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn header_split_across_writes() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, Duration::from_secs(2));

        let writer = tokio::spawn(async move {
            client.write_all(&[1, 16]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(&[1, 0]).await.unwrap();
            client
        });

        let event = reader.next_event().await.unwrap();
        assert_eq!(
            event,
            ReadEvent::Frame(Frame::from_bytes(&[1, 16, 1, 0]).unwrap())
        );
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn clean_close_between_frames() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, SHORT);
        drop(client);
        assert_eq!(reader.next_event().await.unwrap(), ReadEvent::Closed);
    }

    #[tokio::test]
    async fn idle_then_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, Duration::from_millis(50));

        assert_eq!(reader.next_event().await.unwrap(), ReadEvent::Idle);

        client.write_all(&[1, 16, 1, 0]).await.unwrap();
        assert!(matches!(
            reader.next_event().await.unwrap(),
            ReadEvent::Frame(_)
        ));
    }

    #[tokio::test]
    async fn partial_header_is_truncated() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, SHORT);

        client.write_all(&[1, 16]).await.unwrap();
        drop(client);

        let err = reader.next_event().await.unwrap_err();
        assert!(err.is_desync());
        assert!(matches!(
            err,
            FrameError::Truncated {
                expected: 4,
                received: 2
            }
        ));
    }

    #[tokio::test]
    async fn short_payload_stalls() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, Duration::from_millis(50));

        // Header announces 10 bytes, only 4 follow and the peer stays open.
        client.write_all(&[1, 16, 1, 10, 1, 2, 3, 4]).await.unwrap();

        let err = reader.next_event().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Stalled {
                expected: 14,
                received: 8
            }
        ));
        drop(client);
    }

    #[tokio::test]
    async fn error_inside_header_is_desync() {
        let script = VecDeque::from(vec![
            Ok(vec![1, 16]),
            Err(io::Error::new(io::ErrorKind::Other, "transient")),
            Ok(vec![1, 0]),
            Ok(vec![2, 16, 1, 0]),
        ]);
        let mut reader = FrameReader::new(Scripted(script), SHORT);

        let err = reader.next_event().await.unwrap_err();
        assert!(err.is_desync(), "unexpected error: {}", err);
        assert!(matches!(
            err,
            FrameError::Interrupted {
                expected: 4,
                received: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn error_inside_payload_is_desync() {
        let script = VecDeque::from(vec![
            Ok(vec![1, 16, 18, 4]),
            Ok(vec![b'{', b'}']),
            Err(io::Error::new(io::ErrorKind::Other, "transient")),
        ]);
        let mut reader = FrameReader::new(Scripted(script), SHORT);

        let err = reader.next_event().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Interrupted {
                expected: 8,
                received: 6,
                ..
            }
        ));
        assert!(err.is_desync());
    }

    #[tokio::test]
    async fn error_between_frames_is_not_desync() {
        let script = VecDeque::from(vec![
            Err(io::Error::new(io::ErrorKind::Other, "transient")),
            Ok(vec![1, 16, 1, 0]),
        ]);
        let mut reader = FrameReader::new(Scripted(script), SHORT);

        let err = reader.next_event().await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
        assert!(!err.is_desync());
        assert!(matches!(reader.next_event().await.unwrap(), ReadEvent::Frame(_)));
    }

    #[test]
    fn from_bytes_respects_declared_length() {
        let frame = Frame::from_bytes(&[0, 0, 0, 2, 9, 9, 7]).unwrap();
        assert_eq!(frame.payload_len(), 2);
        assert_eq!(frame.payload(), &[9, 9]);

        assert!(Frame::from_bytes(&[0, 0, 0, 3, 1]).is_err());
        assert!(Frame::from_bytes(&[0, 0]).is_err());
    }
}
