//! [`CommandRegistry`] – free-form session commands, blocking or not.
//!
//! Every asynchronous command runs on its own thread over its own command
//! channel, so several commands may be in flight at once.  Only the map of
//! pending commands is locked, never the execution itself.
//!
//! # Lifecycle of an asynchronous command
//!
//! ```text
//! execute_async ──► Running ──► Done      ──► get_reply (consumes the id)
//!                      │
//!                      └─ abort ─► Aborted ──► get_reply returns Aborted
//! ```
//!
//! | Call | Unknown id |
//! |---|---|
//! | [`CommandRegistry::get_reply`] | [`BridgeError::UnknownId`] |
//! | [`CommandRegistry::is_done`] | `true` |
//! | [`CommandRegistry::abort`] | [`BridgeError::NotRunning`] |

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tangospec_session::{CommandChannel, Session};
use tangospec_types::BridgeError;
use tracing::{debug, info, warn};

use crate::history::CommandHistory;

/// Observable state of a pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Running,
    Done,
    Aborted,
}

struct PendingCommand {
    text: String,
    channel: Arc<dyn CommandChannel>,
    handle: Mutex<Option<JoinHandle<Result<String, BridgeError>>>>,
    aborted: AtomicBool,
}

impl PendingCommand {
    fn is_finished(&self) -> bool {
        self.handle.lock().as_ref().is_none_or(|h| h.is_finished())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CommandRegistry
// ─────────────────────────────────────────────────────────────────────────────

pub struct CommandRegistry {
    session: Arc<dyn Session>,
    history: Mutex<CommandHistory>,
    pending: Mutex<HashMap<u64, Arc<PendingCommand>>>,
    next_id: AtomicU64,
}

impl CommandRegistry {
    pub fn new(session: Arc<dyn Session>, history_max_len: usize) -> Self {
        Self {
            session,
            history: Mutex::new(CommandHistory::new(history_max_len)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `text` and wait for its reply.
    pub fn execute(&self, text: &str) -> Result<String, BridgeError> {
        self.history.lock().record(text);
        let channel = self.session.command_channel()?;
        debug!(cmd = text, "executing command");
        channel.execute(text)
    }

    /// Start `text` in the background and return its id at once.
    ///
    /// The history already contains `text` when the id is returned.
    pub fn execute_async(&self, text: &str) -> Result<u64, BridgeError> {
        self.history.lock().record(text);
        let channel = self.session.command_channel()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let runner = channel.clone();
        let cmd = text.to_string();
        let handle = thread::Builder::new()
            .name(format!("cmd-{id}"))
            .spawn(move || runner.execute(&cmd))
            .map_err(|e| BridgeError::Framework(format!("cannot start command thread: {e}")))?;

        self.pending.lock().insert(
            id,
            Arc::new(PendingCommand {
                text: text.to_string(),
                channel,
                handle: Mutex::new(Some(handle)),
                aborted: AtomicBool::new(false),
            }),
        );
        info!(cmd_id = id, cmd = text, "command started");
        Ok(id)
    }

    /// Block until command `id` finishes and return its reply.  Consumes
    /// the id.
    pub fn get_reply(&self, id: u64) -> Result<String, BridgeError> {
        let pending = self
            .pending
            .lock()
            .remove(&id)
            .ok_or(BridgeError::UnknownId(id))?;
        let handle = pending.handle.lock().take();
        let result = match handle.map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(BridgeError::TaskFailure(format!(
                "command '{}' panicked",
                pending.text
            ))),
            None => Err(BridgeError::UnknownId(id)),
        };
        debug!(cmd_id = id, ok = result.is_ok(), "command reply collected");
        result
    }

    /// `true` when command `id` has finished or the id is unknown.
    pub fn is_done(&self, id: u64) -> bool {
        self.pending
            .lock()
            .get(&id)
            .is_none_or(|p| p.is_finished())
    }

    /// `None` when the id is unknown.
    pub fn state(&self, id: u64) -> Option<CommandState> {
        let pending = self.pending.lock();
        let p = pending.get(&id)?;
        Some(if p.aborted.load(Ordering::SeqCst) {
            CommandState::Aborted
        } else if p.is_finished() {
            CommandState::Done
        } else {
            CommandState::Running
        })
    }

    /// Ask the session to abort command `id`.  Does not wait.
    pub fn abort(&self, id: u64) -> Result<(), BridgeError> {
        let pending = self
            .pending
            .lock()
            .get(&id)
            .cloned()
            .ok_or(BridgeError::NotRunning(id))?;
        pending.aborted.store(true, Ordering::SeqCst);
        info!(cmd_id = id, cmd = %pending.text, "aborting command");
        pending.channel.abort()
    }

    /// Abort every pending command and forget them.
    pub fn abort_all(&self) {
        let drained: Vec<(u64, Arc<PendingCommand>)> = self.pending.lock().drain().collect();
        for (id, pending) in drained {
            if !pending.is_finished() {
                if let Err(e) = pending.channel.abort() {
                    warn!(cmd_id = id, error = %e, "failed to abort command");
                }
            }
        }
    }

    /// Ids of every command not yet consumed, ascending.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().entries()
    }

    pub fn set_history_max_len(&self, max_len: usize) {
        self.history.lock().set_max_len(max_len);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tangospec_session::SimSession;

    fn registry() -> CommandRegistry {
        let sim = SimSession::builder("localhost:fourc").build().unwrap();
        CommandRegistry::new(sim, 100)
    }

    #[test]
    fn sync_execute_returns_reply_and_records_history() {
        let registry = registry();
        assert_eq!(registry.execute("p 42").unwrap(), "42");
        assert_eq!(registry.execute("p 42").unwrap(), "42");
        assert_eq!(registry.history(), vec!["p 42"]);
    }

    #[test]
    fn async_reply_is_consumed_once() {
        let registry = registry();
        let id = registry.execute_async("sleep 0.3").unwrap();
        assert_eq!(registry.history(), vec!["sleep 0.3"]);
        assert!(!registry.is_done(id));
        assert_eq!(registry.state(id), Some(CommandState::Running));

        assert_eq!(registry.get_reply(id).unwrap(), "");
        assert!(matches!(registry.get_reply(id), Err(BridgeError::UnknownId(i)) if i == id));
        assert!(registry.is_done(id));
        assert_eq!(registry.state(id), None);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let registry = registry();
        let a = registry.execute_async("p a").unwrap();
        let b = registry.execute_async("p b").unwrap();
        assert!(b > a);
        assert_eq!(registry.pending_ids(), vec![a, b]);
        assert_eq!(registry.get_reply(b).unwrap(), "b");
        assert_eq!(registry.get_reply(a).unwrap(), "a");
    }

    #[test]
    fn task_failure_surfaces_verbatim() {
        let registry = registry();
        let id = registry.execute_async("fail motor is locked").unwrap();
        assert_eq!(
            registry.get_reply(id),
            Err(BridgeError::TaskFailure("motor is locked".to_string()))
        );
    }

    #[test]
    fn abort_interrupts_running_command() {
        let registry = registry();
        let id = registry.execute_async("sleep 30").unwrap();
        registry.abort(id).unwrap();
        assert_eq!(registry.state(id), Some(CommandState::Aborted));
        assert!(matches!(registry.get_reply(id), Err(BridgeError::Aborted(_))));
    }

    #[test]
    fn abort_of_unknown_id_is_not_running() {
        let registry = registry();
        assert_eq!(registry.abort(99), Err(BridgeError::NotRunning(99)));
        assert!(matches!(registry.get_reply(99), Err(BridgeError::UnknownId(99))));
    }

    #[test]
    fn is_done_turns_true_when_finished() {
        let registry = registry();
        let id = registry.execute_async("p done").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !registry.is_done(id) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(registry.is_done(id));
        assert_eq!(registry.get_reply(id).unwrap(), "done");
    }

    #[test]
    fn abort_all_forgets_pending_commands() {
        let registry = registry();
        registry.execute_async("sleep 30").unwrap();
        registry.abort_all();
        assert!(registry.pending_ids().is_empty());
    }
}
