use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Exporter bookkeeping read by the system-health view.
#[derive(Debug, Clone, Default)]
pub struct TickStats {
    pub ticks_completed: u64,
    pub last_tick_at: Option<OffsetDateTime>,
    pub last_tick_duration_ms: Option<u64>,
}
