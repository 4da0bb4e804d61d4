use std::collections::HashSet;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Ids cancelled by callers before their request was dispatched.
///
/// The formation loop consumes marks at admission and again when it closes a
/// batch, so a request cancelled while `Queued` or `Admitted` never reaches
/// the executor. Cancellation of a request that is already running is handled
/// by the execution bridge instead.
#[derive(Default)]
pub(crate) struct CancelRegistry {
    ids: Mutex<HashSet<Uuid>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a cancellation request for `id`.
    pub async fn mark(&self, id: Uuid) {
        self.ids.lock().await.insert(id);
    }

    /// Consumes the mark for `id`, returning whether one was present.
    pub async fn take(&self, id: Uuid) -> bool {
        self.ids.lock().await.remove(&id)
    }

    /// Number of marks not yet consumed.
    #[allow(dead_code)]
    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_mark_is_consumed_exactly_once() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();

        assert!(!registry.take(id).await, "unmarked id should not report cancelled");
        registry.mark(id).await;
        assert!(registry.take(id).await);
        assert!(!registry.take(id).await, "a mark should only be taken once");
    }
}
