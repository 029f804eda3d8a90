use resilience::{with_retry, RetryConfig};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::{CdcBatch, CdcDispatcher, OffsetStore};
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Default)]
struct Progress {
    last_saved: Option<i64>,
    /// Position of a batch that failed and has not been handled since
    failed: Option<i64>,
}

/// Drains captured batches and hands them to the listener registry
///
/// Batches are processed strictly one at a time, in the order the capture
/// task sent them. The resume position is saved only after every listener
/// handled the batch. A failed batch is retried in place; once retries run
/// out the loop stops without saving, so the next start reads the slot from
/// the last saved position again (at-least-once).
pub struct CdcConsumer {
    dispatcher: Arc<CdcDispatcher>,
    offsets: Arc<dyn OffsetStore>,
    slot_name: String,
    retry: RetryConfig,
    progress: Mutex<Progress>,
}

impl CdcConsumer {
    pub fn new(
        dispatcher: Arc<CdcDispatcher>,
        offsets: Arc<dyn OffsetStore>,
        slot_name: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            offsets,
            slot_name: slot_name.into(),
            retry: RetryConfig::default(),
            progress: Mutex::new(Progress::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Position the capture task should resume after
    pub async fn resume_position(&self) -> ServiceResult<Option<i64>> {
        let position = self.offsets.read_offset(&self.slot_name).await?;
        self.progress.lock().await.last_saved = position;
        Ok(position)
    }

    /// Dispatch one batch and persist its position.
    ///
    /// Returns `false` when the batch was already handled before. After a
    /// failure only the same batch is accepted until it succeeds.
    pub async fn handle_batch(&self, batch: &CdcBatch) -> ServiceResult<bool> {
        let Some(position) = batch.last_position() else {
            return Ok(false);
        };

        let mut progress = self.progress.lock().await;
        if matches!(progress.last_saved, Some(saved) if position <= saved) {
            debug!(slot = %self.slot_name, position, "Skipping already handled CDC batch");
            return Ok(false);
        }
        if let Some(failed) = progress.failed {
            if position != failed {
                return Err(ServiceError::CdcBatchPending {
                    failed,
                    requested: position,
                });
            }
        }

        let listeners = match self.dispatcher.dispatch(batch).await {
            Ok(listeners) => listeners,
            Err(e) => {
                progress.failed = Some(position);
                return Err(e);
            }
        };
        if let Err(e) = self.offsets.save_offset(&self.slot_name, position).await {
            progress.failed = Some(position);
            return Err(e);
        }
        progress.last_saved = Some(position);
        progress.failed = None;

        debug!(
            slot = %self.slot_name,
            position,
            records = batch.records.len(),
            listeners,
            "CDC batch handled"
        );
        Ok(true)
    }

    /// Run until the capture side closes the channel.
    ///
    /// Fails when a batch still cannot be handled after the configured
    /// retries; nothing after it is consumed.
    pub async fn run(self: Arc<Self>, mut batches: mpsc::Receiver<CdcBatch>) -> anyhow::Result<()> {
        info!(slot = %self.slot_name, "Starting CDC consumer loop");

        if let Err(e) = self.resume_position().await {
            warn!(slot = %self.slot_name, "Failed to read CDC resume position: {}", e);
        }

        while let Some(batch) = batches.recv().await {
            let position = batch.last_position();
            if let Err(e) = with_retry(self.retry.clone(), || self.handle_batch(&batch)).await {
                error!(
                    slot = %self.slot_name,
                    position = ?position,
                    "Giving up on CDC batch: {}",
                    e
                );
                return Err(anyhow::anyhow!(
                    "CDC batch at position {:?} on slot {} could not be handled: {}",
                    position,
                    self.slot_name,
                    e.into_inner()
                ));
            }
        }

        info!(slot = %self.slot_name, "CDC batch channel closed, consumer stopping");
        Ok(())
    }
}
