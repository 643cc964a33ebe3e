use crate::{RecipientId, Result};
use serde::Serialize;
use std::sync::Arc;

/// A store that keeps state keyed by [`RecipientId`].
///
/// Called when `absorbed` was found to be the same peer as `surviving`. After
/// a successful call the store holds no state for `absorbed`; whatever it had
/// is either moved to `surviving` or deliberately superseded by what
/// `surviving` already holds.
pub trait RecipientMerger: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge_recipients(&self, surviving: RecipientId, absorbed: RecipientId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeFailure {
    pub store: &'static str,
    pub surviving: RecipientId,
    pub absorbed: RecipientId,
    pub message: String,
}

impl From<CascadeFailure> for crate::Error {
    fn from(failure: CascadeFailure) -> Self {
        crate::Error::Cascade {
            store: failure.store,
            surviving: failure.surviving,
            absorbed: failure.absorbed,
            message: failure.message,
        }
    }
}

/// Runs `merge_recipients` on every collaborator.
///
/// A failing collaborator does not stop the others; failures are returned so
/// the caller can report them. The address-level merge stands either way.
pub fn merge_all(
    mergers: &[Arc<dyn RecipientMerger>],
    surviving: RecipientId,
    absorbed: RecipientId,
) -> Vec<CascadeFailure> {
    let mut failures = Vec::new();
    for merger in mergers {
        if let Err(e) = merger.merge_recipients(surviving, absorbed) {
            tracing::warn!(
                "Failed to merge recipient {} into {} in {}: {}",
                absorbed,
                surviving,
                merger.name(),
                e
            );
            failures.push(CascadeFailure {
                store: merger.name(),
                surviving,
                absorbed,
                message: e.to_string(),
            });
        }
    }
    failures
}
