use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::request::RequestId;

/// One async mutex per request id. Operations on different requests never
/// wait on each other; the outer map lock is only held for the lookup.
#[derive(Clone, Default)]
pub struct RequestLocks {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

pub struct RequestGuard {
    _guard: OwnedMutexGuard<()>,
}

impl RequestLocks {
    pub async fn acquire(&self, request_id: &RequestId) -> RequestGuard {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop slots nobody holds or waits on.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(request_id.0.clone()).or_default().clone()
        };
        RequestGuard { _guard: slot.lock_owned().await }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
