//! Line relay from subprocess pipes into the streamed HTTP response.
//!
//! Both relay loops write into one [`OutputSink`]. The sink is a bounded
//! channel with a single consumer, the response body, so whole lines are the
//! unit of writing: a stdout line and a stderr line can arrive in either order
//! but are never spliced together. Each line is handed to hyper as its own
//! frame and reaches the client as soon as it is read.

use axum::body::Body;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::{convert::Infallible, fmt};
use tokio::{io::AsyncRead, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::debug;

/// Frames buffered between the relay loops and the response body.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Which pipe a relay loop drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Creates the shared sink and the receiving half that becomes the response body.
pub fn output_channel(capacity: usize) -> (OutputSink, OutputReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutputSink { tx }, OutputReceiver { rx })
}

/// Write side of a streamed response. Cloned once per writer.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<Bytes>,
}

impl OutputSink {
    /// Sends `line` followed by a single `\n` as one frame.
    ///
    /// Returns `false` once the response has gone away.
    pub async fn write_line(&self, line: &[u8]) -> bool {
        let mut frame = BytesMut::with_capacity(line.len() + 1);
        frame.put_slice(line);
        frame.put_u8(b'\n');
        self.tx.send(frame.freeze()).await.is_ok()
    }

    /// Resolves when the response body has been dropped, which is how hyper
    /// reports a disconnected client.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Read side of a streamed response.
#[derive(Debug)]
pub struct OutputReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl OutputReceiver {
    /// The body ends once every [`OutputSink`] clone has been dropped.
    pub fn into_body(self) -> Body {
        Body::from_stream(ReceiverStream::new(self.rx).map(Ok::<_, Infallible>))
    }
}

/// Counters for one finished relay loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub lines: usize,
    pub bytes: usize,
}

/// Forwards `reader` to `sink` one line at a time until end of stream, a read
/// error, or the response going away.
///
/// Lines are split on `\n`; a `\r` before it is dropped, so every forwarded
/// line ends in exactly one `\n`. A final line without terminator is still
/// forwarded. Output is treated as bytes and need not be UTF-8.
pub async fn relay_lines<R>(reader: R, kind: StreamKind, sink: OutputSink) -> RelayStats
where
    R: AsyncRead + Unpin,
{
    let codec = AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec());
    let mut frames = FramedRead::new(reader, codec);
    let mut stats = RelayStats::default();

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = sink.closed() => {
                debug!(stream = %kind, "response closed, stopping relay");
                break;
            }
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(stream = %kind, "read error, stopping relay: {}", e);
                break;
            }
            None => break,
        };

        let line = frame.strip_suffix(b"\r").unwrap_or(&frame[..]);
        debug!(stream = %kind, "output: {}", String::from_utf8_lossy(line));
        if !sink.write_line(line).await {
            debug!(stream = %kind, "response closed while writing");
            break;
        }
        stats.lines += 1;
        stats.bytes += line.len() + 1;
    }

    stats
}
