use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::types::CommandId;

static NEXT_COMMAND_ID: AtomicI64 = AtomicI64::new(1);

/// Allocates a process-wide unique command id.
pub fn next_command_id() -> CommandId {
    NEXT_COMMAND_ID.fetch_add(1, Ordering::SeqCst)
}

/// Outcome of a bounded wait on a command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(Option<i32>),
    TimedOut,
    Failed(String),
}

struct PendingCommand {
    semaphore: Arc<Semaphore>,
    result: Option<i32>,
}

/// Commands sent to forkers and still waiting for their reply.
pub struct PendingCommands {
    entries: Mutex<HashMap<CommandId, PendingCommand>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CommandId, PendingCommand>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a command id and its waiter.
    pub fn create(&self) -> CommandId {
        let cmd_id = next_command_id();
        self.lock().insert(
            cmd_id,
            PendingCommand {
                semaphore: Arc::new(Semaphore::new(0)),
                result: None,
            },
        );
        cmd_id
    }

    /// Stores a reply and releases its waiter. Returns `false` for ids
    /// that are not pending, which are dropped.
    pub fn complete(&self, cmd_id: CommandId, result: Option<i32>) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&cmd_id) {
            Some(pending) => {
                pending.result = result;
                pending.semaphore.add_permits(1);
                true
            }
            None => {
                debug!("Dropping reply to unknown command {}", cmd_id);
                false
            }
        }
    }

    /// Waits for the reply to a command. The entry is gone once this
    /// returns, whatever the outcome.
    pub async fn wait(&self, cmd_id: CommandId, timeout: Duration) -> WaitOutcome {
        let semaphore = match self.lock().get(&cmd_id) {
            Some(pending) => pending.semaphore.clone(),
            None => return WaitOutcome::Failed(format!("command {} is not pending", cmd_id)),
        };

        let waited = tokio::time::timeout(timeout, semaphore.acquire()).await;
        let entry = self.lock().remove(&cmd_id);

        match waited {
            Ok(Ok(permit)) => {
                permit.forget();
                WaitOutcome::Completed(entry.and_then(|pending| pending.result))
            }
            Ok(Err(e)) => WaitOutcome::Failed(e.to_string()),
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    pub fn discard(&self, cmd_id: CommandId) -> bool {
        self.lock().remove(&cmd_id).is_some()
    }

    pub fn contains(&self, cmd_id: CommandId) -> bool {
        self.lock().contains_key(&cmd_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for PendingCommands {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids_increase() {
        let first = next_command_id();
        let second = next_command_id();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_reply_before_wait() {
        let pending = PendingCommands::new();
        let cmd_id = pending.create();

        assert!(pending.complete(cmd_id, Some(0)));
        assert_eq!(
            pending.wait(cmd_id, Duration::from_millis(100)).await,
            WaitOutcome::Completed(Some(0))
        );
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_reply_without_result() {
        let pending = PendingCommands::new();
        let cmd_id = pending.create();
        pending.complete(cmd_id, None);

        assert_eq!(
            pending.wait(cmd_id, Duration::from_millis(100)).await,
            WaitOutcome::Completed(None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_purges_entry() {
        let pending = PendingCommands::new();
        let cmd_id = pending.create();

        assert_eq!(
            pending.wait(cmd_id, Duration::from_millis(1000)).await,
            WaitOutcome::TimedOut
        );
        assert!(!pending.contains(cmd_id));
        assert!(!pending.complete(cmd_id, Some(0)));
    }

    #[tokio::test]
    async fn test_reply_only_releases_its_waiter() {
        let pending = Arc::new(PendingCommands::new());
        let first = pending.create();
        let second = pending.create();
        assert_ne!(first, second);

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait(first, Duration::from_secs(5)).await })
        };

        pending.complete(second, Some(1));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        pending.complete(first, Some(0));
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Completed(Some(0)));
        assert_eq!(
            pending.wait(second, Duration::from_millis(100)).await,
            WaitOutcome::Completed(Some(1))
        );
    }

    #[tokio::test]
    async fn test_wait_on_unknown_command() {
        let pending = PendingCommands::new();
        assert!(matches!(
            pending.wait(-1, Duration::from_millis(10)).await,
            WaitOutcome::Failed(_)
        ));
    }
}
