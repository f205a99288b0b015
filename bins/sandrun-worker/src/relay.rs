//! Stream Relay - unidirectional copy with transcript capture
//!
//! Reads a source in fixed-size chunks until EOF or the first read error,
//! appends every chunk to its own transcript, and forwards it to an optional
//! sink. A failed forward is logged and draining continues: the upstream
//! process must never block on a full pipe because its peer went away.
//!
//! The transcript is owned by the relay and handed back when `run` returns,
//! so nobody can read it while the relay is still writing.

use crate::barrier::CompletionSignal;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub const CHUNK_SIZE: usize = 1024;

pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Relay<R> {
    label: &'static str,
    source: R,
    sink: Option<BoxedSink>,
    capture: bool,
}

/// What a finished relay hands back
#[derive(Debug, Default)]
pub struct RelayReport {
    pub transcript: Vec<u8>,
    pub bytes_read: u64,
    pub forward_failures: u64,
}

impl<R> Relay<R>
where
    R: AsyncRead + Unpin,
{
    /// Relay that keeps a transcript of everything it reads
    pub fn capturing(label: &'static str, source: R, sink: Option<BoxedSink>) -> Self {
        Self {
            label,
            source,
            sink,
            capture: true,
        }
    }

    /// Relay that only forwards; its report carries an empty transcript
    pub fn passthrough(label: &'static str, source: R, sink: BoxedSink) -> Self {
        Self {
            label,
            source,
            sink: Some(sink),
            capture: false,
        }
    }

    pub async fn run(self, signal: CompletionSignal) -> RelayReport {
        let Relay {
            label,
            mut source,
            mut sink,
            capture,
        } = self;

        let mut report = RelayReport::default();
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let read = match source.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(stream = label, error = %e, "Read failed, closing relay");
                    break;
                }
            };
            report.bytes_read += read as u64;

            if capture {
                report.transcript.extend_from_slice(&chunk[..read]);
            }

            if let Some(dest) = sink.as_mut() {
                if let Err(e) = forward(dest, &chunk[..read]).await {
                    report.forward_failures += 1;
                    if report.forward_failures == 1 {
                        warn!(stream = label, error = %e, "Forwarding failed, still draining source");
                    } else {
                        debug!(stream = label, error = %e, "Forwarding failed again");
                    }
                }
            }
        }

        drop(source);
        if let Some(mut dest) = sink.take() {
            if let Err(e) = dest.shutdown().await {
                debug!(stream = label, error = %e, "Sink shutdown failed");
            }
        }

        debug!(
            stream = label,
            bytes = report.bytes_read,
            forward_failures = report.forward_failures,
            "Relay drained"
        );
        signal.complete();
        report
    }
}

async fn forward(dest: &mut BoxedSink, data: &[u8]) -> std::io::Result<()> {
    dest.write_all(data).await?;
    dest.flush().await
}
