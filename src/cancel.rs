//! Pluggable interruption sources.
//!
//! The run owns a single [`CancellationToken`]. Each [`CancelSource`] is an
//! independent trigger for it; whichever fires first cancels the run.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::select_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Something that can ask the run to stop.
#[async_trait]
pub trait CancelSource: Send + Sync {
    /// Resolves when the source fires. Never resolving is valid.
    async fn wait(&self);

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Fires on Ctrl-C (SIGINT).
#[derive(Debug, Default, Clone, Copy)]
pub struct CtrlCSource;

#[async_trait]
impl CancelSource for CtrlCSource {
    async fn wait(&self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }

    fn name(&self) -> &'static str {
        "ctrl-c"
    }
}

/// Fires when a line equal to `sequence` is read from `reader` (stdin in
/// the binary). End of input leaves the source idle.
pub struct KeySequenceSource<R> {
    reader: Mutex<Option<BufReader<R>>>,
    sequence: String,
}

impl<R: AsyncRead + Unpin + Send> KeySequenceSource<R> {
    /// Watches `reader` for `sequence` (compared after trimming).
    pub fn new(reader: R, sequence: impl Into<String>) -> Self {
        Self {
            reader: Mutex::new(Some(BufReader::new(reader))),
            sequence: sequence.into(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> CancelSource for KeySequenceSource<R> {
    async fn wait(&self) {
        let mut guard = self.reader.lock().await;
        if let Some(reader) = guard.as_mut() {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) if line.trim() == self.sequence => return,
                    Ok(_) => {}
                }
            }
            guard.take();
        }
        drop(guard);
        std::future::pending::<()>().await;
    }

    fn name(&self) -> &'static str {
        "key sequence"
    }
}

/// Cancels `token` when the first of `sources` fires.
///
/// The returned task ends once the token is cancelled by any means.
#[must_use]
pub fn watch(sources: Vec<Arc<dyn CancelSource>>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if sources.is_empty() {
            return;
        }
        let waits = sources.iter().map(|source| {
            let source = Arc::clone(source);
            Box::pin(async move {
                source.wait().await;
                source.name()
            })
        });
        tokio::select! {
            () = token.cancelled() => {}
            (name, _, _) = select_all(waits) => {
                info!(source = name, "interruption requested, stopping");
                token.cancel();
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_sequence_cancels_token() {
        let input: &[u8] = b"hello\n  q  \nmore\n";
        let source: Arc<dyn CancelSource> = Arc::new(KeySequenceSource::new(input, "q"));
        let token = CancellationToken::new();
        watch(vec![source], token.clone()).await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_input_never_fires() {
        let input: &[u8] = b"nothing here\n";
        let source: Arc<dyn CancelSource> = Arc::new(KeySequenceSource::new(input, "q"));
        let token = CancellationToken::new();
        let handle = watch(vec![source], token.clone());

        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert!(!token.is_cancelled());
        token.cancel();
        handle.await.unwrap();
    }
}
