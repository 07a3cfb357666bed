use std::sync::Arc;

use crate::scheduler::{ConfigStore, Scheduler};
use crate::storage::HistoryStore;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub history: HistoryStore,
    pub config: Arc<ConfigStore>,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        let history = scheduler.runner().history().clone();
        let config = scheduler.config().clone();
        Self {
            scheduler,
            history,
            config,
        }
    }
}
