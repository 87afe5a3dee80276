use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::frame::{CaptureError, FrameContext, FrameSink};
use crate::record::CaptureRecord;
use crate::writer::{RecordWriteError, RecordWriter};

/// Records queued for the writer task before frames are rejected.
pub const CHANNEL_BUFFER: usize = 1024;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Structured [`FrameSink`]: turns each frame into a [`CaptureRecord`] and
/// hands it to a consumer over a bounded channel.
///
/// Delivery never waits. When the consumer falls behind and the channel is
/// full, the frame is rejected with [`CaptureError::QueueFull`]; the relay
/// ignores that and keeps moving bytes.
#[derive(Clone, Debug)]
pub struct RecordSink {
    tx: mpsc::Sender<CaptureRecord>,
}

impl RecordSink {
    /// A sink plus the receiving end for a custom consumer (a UI, a test).
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CaptureRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Sink whose records a background task writes to `output`. The task
    /// ends once every clone of the sink is gone.
    pub fn spawn_writer<W>(output: RecordWriter<W>) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, rx) = Self::channel(CHANNEL_BUFFER);
        let handle = tokio::spawn(drain_records(output, rx));
        (sink, handle)
    }
}

impl FrameSink for RecordSink {
    fn write_frame(&self, ctx: &FrameContext, data: &[&[u8]]) -> Result<(), CaptureError> {
        let record = CaptureRecord::from_frame(ctx, data);
        self.tx.try_send(record).map_err(|err| match err {
            TrySendError::Full(_) => CaptureError::QueueFull,
            TrySendError::Closed(_) => CaptureError::ConsumerClosed,
        })
    }
}

/// Write records until every sink is dropped. Written records are flushed
/// on the next tick and once more on exit; a record that fails to write is
/// logged and skipped.
async fn drain_records<W>(mut writer: RecordWriter<W>, mut rx: mpsc::Receiver<CaptureRecord>)
where
    W: AsyncWrite + Unpin,
{
    let mut ticker = time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut unflushed = false;

    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else { break };
                match writer.write(&record).await {
                    Ok(()) => unflushed = true,
                    Err(err) => {
                        tracing::warn!(session_id = record.id, %err, "capture record dropped");
                    }
                }
            }
            _ = ticker.tick(), if unflushed => {
                unflushed = flush(&mut writer).await.is_err();
            }
        }
    }

    if unflushed {
        let _ = flush(&mut writer).await;
    }
    tracing::debug!("capture writer stopped");
}

async fn flush<W: AsyncWrite + Unpin>(writer: &mut RecordWriter<W>) -> Result<(), RecordWriteError> {
    writer.flush().await.map_err(|err| {
        tracing::warn!(%err, "capture flush failed");
        err
    })
}
