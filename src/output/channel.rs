use crate::model::{OutputConfig, ScanOutcome};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::sink::OutputSink;

/// Hands outcomes from scan tasks to a single blocking writer task.
#[derive(Clone)]
pub struct OutputChannel {
    inner: Arc<OutputInner>,
}

struct OutputInner {
    tx: Mutex<Option<mpsc::Sender<ScanOutcome>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OutputChannel {
    pub fn new(cfg: OutputConfig) -> anyhow::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<ScanOutcome>(1024);
        let handle = tokio::task::spawn_blocking(move || {
            let mut sink = OutputSink::new(cfg);
            while let Some(outcome) = rx.blocking_recv() {
                if let Err(err) = sink.write_outcome(&outcome) {
                    tracing::error!(error = %err, "failed to write scan outcome");
                }
            }
            sink.flush();
        });

        Ok(Self {
            inner: Arc::new(OutputInner {
                tx: Mutex::new(Some(tx)),
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub async fn emit(&self, outcome: ScanOutcome) -> anyhow::Result<()> {
        let guard = self.inner.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            anyhow::bail!("output worker not available; dropping scan outcome");
        };
        tx.send(outcome)
            .await
            .map_err(|err| anyhow::anyhow!("output worker not available: {err}"))
    }

    /// Closes the channel and waits until every queued outcome is written.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.inner.tx.lock().await.take();

        if let Some(handle) = self.inner.handle.lock().await.take() {
            handle
                .await
                .map_err(|err| anyhow::anyhow!("failed to join output worker: {err}"))?;
        }

        Ok(())
    }
}
