use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::CancelAction;

/// Cancellation state of a single run.
///
/// The first signal wins; later signals only re-fire the token.
#[derive(Debug, Default)]
pub struct RunCancellation {
    token: CancellationToken,
    action: OnceLock<CancelAction>,
}

impl RunCancellation {
    pub fn cancel(&self, action: CancelAction) {
        let _ = self.action.set(action);
        self.token.cancel();
    }

    /// The requested action, once a signal arrived.
    pub fn action(&self) -> Option<CancelAction> {
        self.action.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Cancellation handles for runs that are, or are about to be, running.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    runs: Mutex<HashMap<Uuid, Arc<RunCancellation>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<RunCancellation>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The run's handle, created on first use.
    pub fn handle(&self, run_id: Uuid) -> Arc<RunCancellation> {
        Arc::clone(self.runs().entry(run_id).or_default())
    }

    /// Signals a run. A signal for a run whose worker has not picked up
    /// its handle yet is kept until it does.
    pub fn signal(&self, run_id: Uuid, action: CancelAction) {
        self.handle(run_id).cancel(action);
    }

    pub fn release(&self, run_id: Uuid) {
        self.runs().remove(&run_id);
    }

    pub fn len(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs().is_empty()
    }
}
