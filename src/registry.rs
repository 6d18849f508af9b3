//! # Installed-pool registry.
//!
//! An explicit, caller-owned holder for "the installed pool": application
//! code that wires a pool up at startup can publish it here and fetch it
//! from request handlers later. Last writer wins; nothing in the supervision
//! core depends on this.

use std::sync::{Arc, Mutex};

use crate::office::OfficePool;

/// Caller-owned slot for one shared [`OfficePool`].
#[derive(Default)]
pub struct PoolRegistry {
    slot: Mutex<Option<Arc<OfficePool>>>,
}

impl PoolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `pool`, replacing any previously installed one.
    pub fn install(&self, pool: Arc<OfficePool>) {
        *self.lock() = Some(pool);
    }

    /// The installed pool, if any.
    pub fn installed(&self) -> Option<Arc<OfficePool>> {
        self.lock().clone()
    }

    /// Clears the slot; a later [`installed`](PoolRegistry::installed)
    /// returns `None`.
    pub fn clear(&self) {
        self.lock().take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<OfficePool>>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
