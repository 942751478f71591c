use crate::analysis::MailService;

use std::sync::Arc;
use std::time::Instant;

/// Shared state for every handler.
pub struct ApiState {
    pub service: Arc<MailService>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(service: Arc<MailService>) -> Self {
        Self {
            service,
            started_at: Instant::now(),
        }
    }
}
