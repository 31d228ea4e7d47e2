//! Console output stream capability.

use tangospec_types::BridgeError;

use crate::subscription::Subscription;

/// One raw piece of console output.
///
/// The session sends numbers and text through the same channel; numbers are
/// reformatted by the consumer.  Integers and floats stay apart so `3` and
/// `3.0` render differently.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChunk {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl From<&str> for OutputChunk {
    fn from(s: &str) -> Self {
        OutputChunk::Text(s.to_string())
    }
}

pub type OutputCallback = Box<dyn Fn(OutputChunk) + Send + Sync>;

/// Handle onto the session's `output/tty` channel.
pub trait TtyProxy: Send + Sync {
    fn subscribe(&self, on_output: OutputCallback) -> Result<Subscription, BridgeError>;
}
