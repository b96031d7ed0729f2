//! Indexing progress records emitted by the backend on stdout.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::stream::{FusedStream, Stream};
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

const MAX_RECORD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StartRecord {
    pub total_images: u64,
    pub total_batches: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchRecord {
    pub batch: u64,
    pub total_batches: u64,
    pub images_processed: u64,
    pub total_images: u64,
    pub elapsed: f64,
    pub images_per_sec: f64,
    pub indexed_total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompleteRecord {
    pub total_images: u64,
    pub new_images: u64,
    pub total_time: f64,
    pub images_per_sec: f64,
    pub ocr_extracted: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Start(StartRecord),
    Progress(BatchRecord),
    Complete(CompleteRecord),
}

impl ProgressEvent {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// Fraction of batches done, when the record carries enough to say.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Self::Start(_) => Some(0.0),
            Self::Progress(record) if record.total_batches > 0 => {
                Some((record.batch as f64 / record.total_batches as f64).min(1.0))
            }
            Self::Progress(_) => None,
            Self::Complete(_) => Some(1.0),
        }
    }
}

pub fn parse_record(line: &str) -> Option<ProgressEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<ProgressEvent>(line) {
        Ok(event) => Some(event),
        Err(error) => {
            tracing::trace!(%error, "skipping unrecognized output record");
            None
        }
    }
}

/// Lazily parses progress records out of a byte stream.
///
/// Ends after a `complete` record or at end of input; once ended it stays ended
/// until [`ProgressStream::next_pass`] rearms it for a later indexing run.
pub struct ProgressStream<R> {
    lines: FramedRead<R, LinesCodec>,
    done: bool,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> ProgressStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_RECORD_BYTES)),
            done: false,
            exhausted: false,
        }
    }

    /// Rearms a stream that ended on `complete`. False once input itself has ended.
    pub fn next_pass(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        self.done = false;
        true
    }
}

impl<R: AsyncRead + Unpin> Stream for ProgressStream<R> {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            match ready!(Pin::new(&mut this.lines).poll_next(cx)) {
                None => {
                    this.done = true;
                    this.exhausted = true;
                    return Poll::Ready(None);
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => continue,
                Some(Err(LinesCodecError::Io(error))) => {
                    tracing::warn!(%error, "progress stream read failed");
                    this.done = true;
                    this.exhausted = true;
                    return Poll::Ready(None);
                }
                Some(Ok(line)) => {
                    if let Some(event) = parse_record(&line) {
                        this.done = event.is_complete();
                        return Poll::Ready(Some(event));
                    }
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> FusedStream for ProgressStream<R> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

/// Progress events of one backend launch, handed out once.
#[derive(Debug)]
pub struct ProgressFeed {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressFeed {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<ProgressEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for ProgressFeed {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
