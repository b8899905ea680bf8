use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

type Slots = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// One async mutex per conversation id. Writers to different conversations
/// never contend. A slot lives only while someone holds or waits for it.
#[derive(Default)]
pub struct ConversationLocks {
    inner: Slots,
}

/// Exclusive section for one conversation. Dropping it releases the lock and
/// frees the slot when nobody else is queued on it.
pub struct ConversationGuard<'a> {
    slots: &'a Slots,
    conversation_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Waiters clone the slot under this same map lock, so the count is exact.
        if map
            .get(&self.conversation_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            map.remove(&self.conversation_id);
        }
    }
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, conversation_id: &str) -> ConversationGuard<'_> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let mut guard = ConversationGuard {
            slots: &self.inner,
            conversation_id: conversation_id.to_string(),
            guard: None,
        };
        guard.guard = Some(slot.lock_owned().await);
        guard
    }

    /// Conversations currently locked or waited on.
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_conversation_is_exclusive() {
        let locks = ConversationLocks::new();
        let _held = locks.lock("c1").await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock("c1")).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn different_conversations_do_not_contend() {
        let locks = ConversationLocks::new();
        let _a = locks.lock("c1").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("c2")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_removed() {
        let locks = ConversationLocks::new();
        for i in 0..10 {
            let _guard = locks.lock(&format!("c{i}")).await;
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn slot_survives_while_a_waiter_is_queued() {
        let locks = Arc::new(ConversationLocks::new());
        let first = locks.lock("c1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("c1").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(locks.active(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.active(), 0);
    }
}
