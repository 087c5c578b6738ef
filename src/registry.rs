use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;
use transport::core_location::CoreLocation;

/// Index of a core's slot in the [SessionRegistry]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SessionHandle(usize);

struct CoreSlot {
    core: CoreLocation,
    /// the last transaction id handed out for this core, guarded by the lock that serializes
    ///  sessions
    last_transaction: Arc<tokio::sync::Mutex<u32>>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<CoreSlot>,
    by_core: FxHashMap<CoreLocation, SessionHandle>,
}

/// Serializes sessions per core. Each core gets a slot the first time it is used; a session
///  holds its core's [SessionGuard] for its whole lifetime, so sessions on the same core run one
///  after another while sessions on different cores run concurrently.
#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<Slots>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        Default::default()
    }

    pub fn handle(&self, core: CoreLocation) -> SessionHandle {
        let mut slots = self.lock_slots();
        if let Some(&handle) = slots.by_core.get(&core) {
            return handle;
        }

        let handle = SessionHandle(slots.slots.len());
        slots.slots.push(CoreSlot {
            core,
            last_transaction: Arc::new(tokio::sync::Mutex::new(0)),
        });
        slots.by_core.insert(core, handle);
        handle
    }

    pub fn core(&self, handle: SessionHandle) -> Option<CoreLocation> {
        self.lock_slots().slots.get(handle.0).map(|s| s.core)
    }

    pub fn num_cores(&self) -> usize {
        self.lock_slots().slots.len()
    }

    /// Waits until no other session runs on `core`, and returns a guard with a fresh
    ///  transaction id
    pub async fn acquire(&self, core: CoreLocation) -> SessionGuard {
        let handle = self.handle(core);
        let mutex = self.lock_slots().slots[handle.0].last_transaction.clone();

        let mut guard = mutex.lock_owned().await;
        *guard = guard.wrapping_add(1);
        let transaction_id = *guard;
        trace!("session on {} acquired with transaction id {}", core, transaction_id);

        SessionGuard {
            handle,
            core,
            transaction_id,
            _guard: guard,
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive use of a core for the duration of a session
pub struct SessionGuard {
    pub handle: SessionHandle,
    pub core: CoreLocation,
    pub transaction_id: u32,
    _guard: OwnedMutexGuard<u32>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    const A: CoreLocation = CoreLocation { x: 0, y: 0, p: 1 };
    const B: CoreLocation = CoreLocation { x: 1, y: 0, p: 1 };

    #[test]
    fn test_handles() {
        let registry = SessionRegistry::new();
        let a = registry.handle(A);
        let b = registry.handle(B);
        assert_ne!(a, b);
        assert_eq!(registry.handle(A), a);
        assert_eq!(registry.core(b), Some(B));
        assert_eq!(registry.num_cores(), 2);
    }

    #[tokio::test]
    async fn test_transaction_ids_per_core() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.acquire(A).await.transaction_id, 1);
        assert_eq!(registry.acquire(A).await.transaction_id, 2);
        assert_eq!(registry.acquire(B).await.transaction_id, 1);
    }

    #[tokio::test]
    async fn test_transaction_id_wraps() {
        let registry = SessionRegistry::new();
        let handle = registry.handle(A);
        let counter = registry.lock_slots().slots[handle.0].last_transaction.clone();
        *counter.lock().await = u32::MAX;
        assert_eq!(registry.acquire(A).await.transaction_id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_on_a_core_are_serialized() {
        let registry = Arc::new(SessionRegistry::new());

        let first = registry.acquire(A).await;
        // a different core is not blocked
        let other = registry.acquire(B).await;
        drop(other);

        let r = registry.clone();
        let second = tokio::spawn(async move { r.acquire(A).await.transaction_id });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());

        drop(first);
        assert_eq!(second.await.unwrap(), 2);
    }
}
