//! Cooperative cancellation shared between the orchestrator and client tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{FlError, Result};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.flag.store(true, Ordering::SeqCst); }

    pub fn is_cancelled(&self) -> bool { self.flag.load(Ordering::SeqCst) }

    /// `Err(Cancelled)` once the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(FlError::Cancelled);
        }
        Ok(())
    }
}
