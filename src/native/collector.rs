use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::watch,
    task::JoinHandle,
};

use crate::{constants::READ_CHUNK_BYTES, core::domain::CapturedStream};

/// Drains a child's stdout and stderr concurrently into capped buffers.
///
/// Both readers run as their own tasks from the moment the process is
/// spawned, so a child blocked on one full pipe can never stall the other.
/// The collector owns those tasks; [`OutputCollector::finish`] joins them.
#[derive(Debug)]
pub struct OutputCollector {
    stdout: JoinHandle<CapturedStream>,
    stderr: JoinHandle<CapturedStream>,
    abandon: watch::Sender<bool>,
}

impl OutputCollector {
    pub fn attach<O, E>(stdout: O, stderr: E, cap: usize) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (abandon, abandoned) = watch::channel(false);

        Self {
            stdout: tokio::spawn(drain(stdout, cap, abandoned.clone(), "stdout")),
            stderr: tokio::spawn(drain(stderr, cap, abandoned, "stderr")),
            abandon,
        }
    }

    /// Waits for both streams to reach end-of-file.
    ///
    /// Streams still open after `linger` (a descendant that escaped the
    /// process group can hold a pipe open forever) are abandoned with
    /// whatever was captured so far.
    pub async fn finish(self, linger: Duration) -> (CapturedStream, CapturedStream) {
        let Self {
            stdout,
            stderr,
            abandon,
        } = self;

        let joined = async { tokio::join!(stdout, stderr) };
        tokio::pin!(joined);

        let (stdout, stderr) = tokio::select! {
            streams = &mut joined => streams,
            _ = tokio::time::sleep(linger) => {
                tracing::warn!(?linger, "output streams still open after exit, abandoning them");
                let _ = abandon.send(true);
                joined.await
            }
        };

        (
            stdout.unwrap_or_else(|e| {
                tracing::error!(error = %e, "stdout reader failed");
                CapturedStream::default()
            }),
            stderr.unwrap_or_else(|e| {
                tracing::error!(error = %e, "stderr reader failed");
                CapturedStream::default()
            }),
        )
    }
}

async fn drain<R>(
    mut reader: R,
    cap: usize,
    mut abandoned: watch::Receiver<bool>,
    stream: &'static str,
) -> CapturedStream
where
    R: AsyncRead + Unpin,
{
    let mut captured = CapturedStream::default();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => captured.append(&buf[..n], cap),
                Err(e) => {
                    tracing::warn!(stream, error = %e, "stream read failed");
                    break;
                }
            },
            _ = abandoned.wait_for(|abandoned| *abandoned) => break,
        }
    }

    tracing::debug!(
        stream,
        bytes = captured.bytes.len(),
        truncated = captured.truncated,
        "stream drained"
    );
    captured
}
