//! Compensation for writes that span more than one store.
//!
//! Blob writes are not part of the catalog transaction. Each step that
//! succeeds registers how to undo itself; if a later step fails the
//! orchestrator runs the registered compensations newest-first. Once the
//! catalog commit succeeds the saga is committed and nothing is undone.

use crate::vault::storage::BlobStore;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Delete a blob written earlier in this item.
    RemoveBlob(String),
}

#[derive(Debug, Default)]
pub struct Saga {
    pending: Vec<Compensation>,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, compensation: Compensation) {
        self.pending.push(compensation);
    }

    pub fn pending(&self) -> &[Compensation] {
        &self.pending
    }

    /// The logical operation is durable; forget the compensations.
    pub fn commit(&mut self) {
        self.pending.clear();
    }

    /// Undo every registered step, newest first. Returns the compensations
    /// that could not be applied.
    pub async fn compensate(&mut self, blobs: &BlobStore) -> Vec<Compensation> {
        let mut failed = Vec::new();
        while let Some(step) = self.pending.pop() {
            match &step {
                Compensation::RemoveBlob(path) => match blobs.remove(path).await {
                    Ok(()) => info!(storage_path = %path, "compensated: removed blob"),
                    Err(e) => {
                        warn!(storage_path = %path, error = %e, "compensation failed, blob left orphaned");
                        failed.push(step.clone());
                    }
                },
            }
        }
        failed
    }
}
