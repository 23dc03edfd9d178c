//! Framed codec for worker communication.
//!
//! Wire format: `[u32 big-endian length][length bytes of serialized envelope]`.
//!
//! The worker side reads through [`FrameReader`], which keeps partial-frame
//! progress in its own state so a read attempt can be abandoned (timeout,
//! shutdown) without losing bytes already pulled off the stream. Reads and
//! writes move at most `max_transfer` bytes per call.
//!
//! [`EnvelopeCodec`] is the same format as a `tokio_util` codec, for parents
//! written in Rust (and the tests) that prefer `FramedRead`/`FramedWrite`.

use std::io;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::pool::{BufferPool, PooledBuffer};
use super::protocol::Envelope;

pub const LENGTH_PREFIX_LEN: usize = 4;

/// Bytes moved per read/write call.
pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 1024;

/// Frames announcing more than this are rejected.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream closed part way through a frame.
    #[error("truncated frame: expected {expected} bytes, stream closed after {received}")]
    Truncated { expected: usize, received: usize },

    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    /// A write failed after part of the frame may have reached the stream.
    #[error("frame write failed after {written} of {len} bytes: {source}")]
    PartialWrite {
        written: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
}

fn prefix_for(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::TooLarge {
        len,
        max: u32::MAX as usize,
    })
}

/// Prepend the 4-byte big-endian length of `payload`.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    let prefix = prefix_for(payload.len())?;
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.put_u32(prefix);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// [`encode`] into a buffer taken from `pool`.
pub fn encode_pooled(payload: &[u8], pool: &Arc<BufferPool>) -> Result<PooledBuffer, FrameError> {
    let prefix = prefix_for(payload.len())?;
    let mut frame = pool.take(LENGTH_PREFIX_LEN + payload.len());
    frame[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix.to_be_bytes());
    frame[LENGTH_PREFIX_LEN..].copy_from_slice(payload);
    Ok(frame)
}

/// Write an encoded frame in chunks of at most `max_transfer` bytes,
/// flushing after each chunk.
///
/// A failure before any byte was accepted is [`FrameError::Io`] and leaves the
/// stream on a frame boundary. Any later failure is
/// [`FrameError::PartialWrite`]: the peer may hold part of this frame.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8], max_transfer: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let failed = |written: usize, source: io::Error| {
        if written == 0 {
            FrameError::Io(source)
        } else {
            FrameError::PartialWrite {
                written,
                len: frame.len(),
                source,
            }
        }
    };

    let mut written = 0;
    for chunk in frame.chunks(max_transfer.max(1)) {
        let mut pos = 0;
        while pos < chunk.len() {
            match writer.write(&chunk[pos..]).await {
                Ok(0) => return Err(failed(written, io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    pos += n;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(failed(written, e)),
            }
        }
        writer.flush().await.map_err(|e| failed(written, e))?;
    }
    Ok(())
}

/// Incremental frame decoder over an `AsyncRead`.
pub struct FrameReader<R> {
    inner: R,
    pool: Arc<BufferPool>,
    max_transfer: usize,
    max_frame_len: usize,
    header: [u8; LENGTH_PREFIX_LEN],
    header_filled: usize,
    body: Option<PooledBuffer>,
    body_filled: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, pool: Arc<BufferPool>) -> Self {
        Self {
            inner,
            pool,
            max_transfer: DEFAULT_MAX_TRANSFER_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            header: [0; LENGTH_PREFIX_LEN],
            header_filled: 0,
            body: None,
            body_filled: 0,
        }
    }

    pub fn with_limits(mut self, max_transfer: usize, max_frame_len: usize) -> Self {
        self.max_transfer = max_transfer.max(1);
        self.max_frame_len = max_frame_len;
        self
    }

    /// True when some bytes of the next frame have already been consumed.
    pub fn has_partial_frame(&self) -> bool {
        self.header_filled > 0 || self.body.is_some()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next complete frame payload.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
    /// A close after any byte of a frame was consumed is
    /// [`FrameError::Truncated`]; a partial frame is never returned.
    ///
    /// Cancel safe: dropping the future keeps progress for the next call.
    pub async fn read_frame(&mut self) -> Result<Option<PooledBuffer>, FrameError> {
        let result = self.read_frame_inner().await;
        if result.is_err() {
            self.reset();
        }
        result
    }

    async fn read_frame_inner(&mut self) -> Result<Option<PooledBuffer>, FrameError> {
        while self.body.is_none() && self.header_filled < LENGTH_PREFIX_LEN {
            let n = self
                .inner
                .read(&mut self.header[self.header_filled..])
                .await?;
            if n == 0 {
                if self.header_filled == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Truncated {
                    expected: LENGTH_PREFIX_LEN,
                    received: self.header_filled,
                });
            }
            self.header_filled += n;
        }

        if self.body.is_none() {
            let len = u32::from_be_bytes(self.header) as usize;
            if len > self.max_frame_len {
                return Err(FrameError::TooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }
            self.body = Some(self.pool.take(len));
            self.body_filled = 0;
        }

        let Self {
            inner,
            body,
            body_filled,
            max_transfer,
            ..
        } = self;

        if let Some(buf) = body.as_mut() {
            let len = buf.len();
            while *body_filled < len {
                let end = (*body_filled + *max_transfer).min(len);
                let n = inner.read(&mut buf[*body_filled..end]).await?;
                if n == 0 {
                    return Err(FrameError::Truncated {
                        expected: len,
                        received: *body_filled,
                    });
                }
                *body_filled += n;
            }
        }

        let frame = self.body.take();
        self.header_filled = 0;
        self.body_filled = 0;
        Ok(frame)
    }

    fn reset(&mut self) {
        self.header_filled = 0;
        self.body = None;
        self.body_filled = 0;
    }
}

/// Codec that frames envelopes with a length prefix and serializes them with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_LEN)
                .max_frame_length(DEFAULT_MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let envelope = Envelope::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = item
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::io::ReadBuf;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::bridge::protocol::{EnvelopeId, MessageType};

    async fn decode_all(bytes: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let pool = BufferPool::new();
        let mut reader = FrameReader::new(bytes, pool);
        reader.read_frame().await.map(|f| f.map(|f| f.to_vec()))
    }

    #[test]
    fn encode_prepends_big_endian_length() {
        let frame = encode(b"abc").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        let empty = encode(b"").unwrap();
        assert_eq!(&empty[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn encode_pooled_matches_encode() {
        let pool = BufferPool::new();
        let payload = vec![42u8; 3000];
        let pooled = encode_pooled(&payload, &pool).unwrap();
        assert_eq!(&pooled[..], &encode(&payload).unwrap()[..]);
    }

    #[test]
    fn ready_frame_prefix_is_serialized_length() {
        let envelope = Envelope::ready(EnvelopeId::new(0));
        let json = envelope.to_bytes().unwrap();
        let frame = encode(&json).unwrap();

        let announced = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(announced, json.len());
        assert_eq!(frame.len(), LENGTH_PREFIX_LEN + announced);
        assert_eq!(&frame[LENGTH_PREFIX_LEN..], br#"{"id":0,"type":"ready"}"#);
    }

    #[tokio::test]
    async fn framing_roundtrip() {
        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"x".to_vec(),
            vec![7u8; DEFAULT_MAX_TRANSFER_SIZE],
            (0..10_000u32).map(|i| (i % 251) as u8).collect(),
        ];
        for payload in payloads {
            let frame = encode(&payload).unwrap();
            let decoded = decode_all(&frame).await.unwrap().unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[tokio::test]
    async fn consecutive_frames_decode_in_order() {
        let mut wire = Vec::new();
        for body in [&b"one"[..], b"", b"three"] {
            wire.extend_from_slice(&encode(body).unwrap());
        }
        let mut reader = FrameReader::new(&wire[..], BufferPool::new());
        assert_eq!(reader.read_frame().await.unwrap().unwrap().to_vec(), b"one");
        assert!(reader.read_frame().await.unwrap().unwrap().is_empty());
        assert_eq!(reader.read_frame().await.unwrap().unwrap().to_vec(), b"three");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_close_is_end_of_stream() {
        assert!(decode_all(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut wire = 100u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[1u8; 40]);

        let pool = BufferPool::new();
        let mut reader = FrameReader::new(&wire[..], Arc::clone(&pool));
        match reader.read_frame().await {
            Err(FrameError::Truncated { expected, received }) => {
                assert_eq!(expected, 100);
                assert_eq!(received, 40);
            }
            other => panic!("expected truncated frame, got {:?}", other),
        }
        assert!(!reader.has_partial_frame());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn close_right_after_prefix_is_truncated() {
        let wire = 10u32.to_be_bytes();
        assert!(matches!(
            decode_all(&wire).await,
            Err(FrameError::Truncated {
                expected: 10,
                received: 0
            })
        ));
    }

    #[tokio::test]
    async fn truncated_prefix_is_an_error() {
        assert!(matches!(
            decode_all(&[0, 0]).await,
            Err(FrameError::Truncated {
                expected: 4,
                received: 2
            })
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let wire = 2048u32.to_be_bytes();
        let mut reader = FrameReader::new(&wire[..], BufferPool::new()).with_limits(1024, 1024);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TooLarge {
                len: 2048,
                max: 1024
            })
        ));
    }

    /// Reader that serves a fixed buffer and records the largest read request.
    struct ChunkedSource {
        data: Vec<u8>,
        pos: usize,
        largest_request: usize,
    }

    impl AsyncRead for ChunkedSource {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.largest_request = self.largest_request.max(buf.remaining());
            let n = buf.remaining().min(self.data.len() - self.pos);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn reads_are_chunked() {
        let payload = vec![3u8; 5000];
        let source = ChunkedSource {
            data: encode(&payload).unwrap().to_vec(),
            pos: 0,
            largest_request: 0,
        };
        let mut reader = FrameReader::new(source, BufferPool::new());
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.len(), 5000);
        drop(frame);
        assert!(reader.into_inner().largest_request <= DEFAULT_MAX_TRANSFER_SIZE);
    }

    /// Writer that records the size of every write call.
    #[derive(Default)]
    struct RecordingWriter {
        written: Vec<u8>,
        calls: Vec<usize>,
        flushes: usize,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.calls.push(buf.len());
            self.written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.flushes += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn writes_are_chunked_and_flushed() {
        let frame = encode(&vec![1u8; 2500]).unwrap();
        let mut writer = RecordingWriter::default();
        write_frame(&mut writer, &frame, DEFAULT_MAX_TRANSFER_SIZE)
            .await
            .unwrap();

        assert_eq!(writer.written, frame.to_vec());
        assert!(writer.calls.iter().all(|&n| n <= DEFAULT_MAX_TRANSFER_SIZE));
        assert_eq!(writer.flushes, 3);
    }

    /// Accepts `accept` bytes, fails once with `ErrorKind::Other`, then accepts everything.
    struct FlakyWriter {
        written: Vec<u8>,
        accept: usize,
        failed: bool,
    }

    impl FlakyWriter {
        fn new(accept: usize) -> Self {
            Self {
                written: Vec::new(),
                accept,
                failed: false,
            }
        }
    }

    impl AsyncWrite for FlakyWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if !self.failed && self.written.len() >= self.accept {
                self.failed = true;
                return Poll::Ready(Err(io::Error::other("device hiccup")));
            }
            let n = if self.failed {
                buf.len()
            } else {
                buf.len().min(self.accept - self.written.len())
            };
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failure_before_any_byte_is_plain_io() {
        let frame = encode(b"hello").unwrap();
        let mut writer = FlakyWriter::new(0);
        let err = write_frame(&mut writer, &frame, DEFAULT_MAX_TRANSFER_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
        assert!(writer.written.is_empty());
    }

    #[tokio::test]
    async fn failure_mid_frame_reports_partial_write() {
        let frame = encode(&vec![9u8; 90]).unwrap();
        let mut writer = FlakyWriter::new(10);
        match write_frame(&mut writer, &frame, DEFAULT_MAX_TRANSFER_SIZE).await {
            Err(FrameError::PartialWrite { written, len, .. }) => {
                assert_eq!(written, 10);
                assert_eq!(len, 94);
            }
            other => panic!("expected partial write, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn abandoned_read_keeps_partial_progress() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, BufferPool::new());

        let frame = encode(b"hello world").unwrap();
        tx.write_all(&frame[..6]).await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(20), reader.read_frame()).await;
        assert!(attempt.is_err(), "read should still be waiting");
        assert!(reader.has_partial_frame());

        tx.write_all(&frame[6..]).await.unwrap();
        let payload = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(&payload[..], b"hello world");
    }

    #[tokio::test]
    async fn envelope_codec_interoperates_with_frame_reader() {
        let (tx, rx) = tokio::io::duplex(4096);
        let mut sink = FramedWrite::new(tx, EnvelopeCodec::new());
        let mut reader = FrameReader::new(rx, BufferPool::new());

        let sent = Envelope::data(EnvelopeId::new(11), b"payload".to_vec());
        sink.send(sent.clone()).await.unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        let received = Envelope::from_slice(&frame).unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn envelope_codec_reads_pooled_frames() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut stream = FramedRead::new(rx, EnvelopeCodec::new());

        let pool = BufferPool::new();
        let json = Envelope::new(EnvelopeId::new(5), MessageType::Heartbeat)
            .to_bytes()
            .unwrap();
        let frame = encode_pooled(&json, &pool).unwrap();
        write_frame(&mut tx, &frame, DEFAULT_MAX_TRANSFER_SIZE)
            .await
            .unwrap();

        let envelope = stream.next().await.unwrap().unwrap();
        assert_eq!(envelope.kind, MessageType::Heartbeat);
        assert_eq!(envelope.id, EnvelopeId::new(5));
    }
}
