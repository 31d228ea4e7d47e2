//! Free-form command capability.

use tangospec_types::BridgeError;

/// A command channel into the session.
///
/// Each channel runs at most one command at a time.  Callers that need
/// concurrent commands open one channel per command.
pub trait CommandChannel: Send + Sync {
    /// Run `text` and block until the session replies.
    ///
    /// # Errors
    ///
    /// [`BridgeError::TaskFailure`] when the session raised, and
    /// [`BridgeError::Aborted`] when [`CommandChannel::abort`] interrupted
    /// the command.
    fn execute(&self, text: &str) -> Result<String, BridgeError>;

    /// Ask the session to abort the command running on this channel.
    ///
    /// Returns immediately; the running [`CommandChannel::execute`] observes
    /// the abort eventually.
    fn abort(&self) -> Result<(), BridgeError>;
}
