use std::sync::Arc;

use crate::db::ProgressStore;
use crate::services::queue::AdmissionQueue;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ProgressStore>,
    pub queue: Arc<AdmissionQueue>,
    /// Global ping rate used for ETA estimates.
    pub pace_per_second: f64,
}

impl AppState {
    pub fn new(store: Arc<dyn ProgressStore>, queue: AdmissionQueue, pace_per_second: f64) -> Self {
        Self { store, queue: Arc::new(queue), pace_per_second }
    }
}
