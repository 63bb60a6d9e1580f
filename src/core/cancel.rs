//! Cooperative cancellation flag shared between a load task and its owner

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cheap-to-clone cancellation flag.
///
/// Loads check it before they start and between I/O chunks; there is no
/// hard kill of in-flight work.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-canceled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(Error::Canceled)` once cancellation has been requested
    pub fn check(&self) -> crate::core::types::Result<()> {
        if self.is_canceled() {
            Err(crate::core::error::Error::Canceled)
        } else {
            Ok(())
        }
    }
}
