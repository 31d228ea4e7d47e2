//! [`StateSwitch`] – a device's State and Status, and its event outlet.
//!
//! Every change of State or Status is mirrored as a change event.  Events are
//! never pushed from the calling thread: they go through the device's own
//! [`Dispatcher`], started at init and shut down at delete.  While no
//! dispatcher runs, events are dropped.
//!
//! Session callbacks go through [`StateSwitch::submit`] too: the closure they
//! hand over runs on the drain thread, which is the only writer of state
//! originating from the session.

use std::sync::{Arc, mpsc};
use std::time::Duration;

use parking_lot::Mutex;
use tangospec_middleware::{DeviceServer, Dispatcher, Submitter};
use tangospec_types::{AttrQuality, BridgeError, DevState, WireValue};
use tracing::{debug, error};

pub const STATE_ATTR: &str = "State";
pub const STATUS_ATTR: &str = "Status";

struct Current {
    state: DevState,
    status: String,
}

pub struct StateSwitch {
    device: String,
    server: Arc<dyn DeviceServer>,
    current: Mutex<Current>,
    events: Mutex<Option<Dispatcher>>,
}

impl StateSwitch {
    pub fn new(device: &str, server: Arc<dyn DeviceServer>) -> Self {
        Self {
            device: device.to_string(),
            server,
            current: Mutex::new(Current {
                state: DevState::Unknown,
                status: "The device is in UNKNOWN state.".to_string(),
            }),
            events: Mutex::new(None),
        }
    }

    /// Start the device's dispatcher, replacing a running one.
    pub fn start_events(&self) -> Result<(), BridgeError> {
        let dispatcher = Dispatcher::start(&self.device)?;
        let previous = self.events.lock().replace(dispatcher);
        if let Some(previous) = previous {
            previous.shutdown();
        }
        Ok(())
    }

    /// Shut the dispatcher down; queued events are discarded.
    pub fn stop_events(&self) {
        let dispatcher = self.events.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown();
        }
    }

    pub fn submitter(&self) -> Option<Submitter> {
        self.events.lock().as_ref().map(Dispatcher::submitter)
    }

    /// Run `task` on the drain thread.  Returns `false` when no dispatcher
    /// is running and the task was dropped.
    pub fn submit(&self, task: impl FnOnce() -> Result<(), BridgeError> + Send + 'static) -> bool {
        match self.submitter() {
            Some(submitter) => submitter.submit(task),
            None => {
                debug!(device = %self.device, "no dispatcher running, callback dropped");
                false
            }
        }
    }

    /// Wait until everything submitted from this thread so far has run.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (tx, rx) = mpsc::channel();
        let queued = self.submit(move || {
            let _ = tx.send(());
            Ok(())
        });
        queued && rx.recv_timeout(timeout).is_ok()
    }

    pub fn state(&self) -> DevState {
        self.current.lock().state
    }

    pub fn status(&self) -> String {
        self.current.lock().status.clone()
    }

    /// Set the state and/or the status, pushing an event for each part given.
    ///
    /// Entering an alarm-like state is logged at error level, with the new
    /// status when there is one.
    pub fn switch_state(&self, state: Option<DevState>, status: Option<&str>) {
        if let Some(state) = state {
            self.current.lock().state = state;
            self.push(STATE_ATTR, WireValue::State(state), AttrQuality::Valid);
            if state.is_alarm_like() {
                match status {
                    Some(status) => {
                        error!(device = %self.device, %state, "State changed to {state}: {status}")
                    }
                    None => error!(device = %self.device, %state, "State changed to {state}"),
                }
            }
        }
        if let Some(status) = status {
            self.current.lock().status = status.to_string();
            self.push(STATUS_ATTR, WireValue::String(status.to_string()), AttrQuality::Valid);
        }
    }

    /// Shorthand for a state and status change together.
    pub fn switch(&self, state: DevState, status: &str) {
        self.switch_state(Some(state), Some(status));
    }

    /// Append a line to the current status.
    pub fn append_status(&self, state: DevState, line: &str) {
        let status = format!("{}\n{line}", self.status());
        self.switch(state, &status);
    }

    /// Queue a change event for `attr` on the dispatcher.
    pub fn push(&self, attr: &str, value: WireValue, quality: AttrQuality) {
        let Some(submitter) = self.submitter() else {
            debug!(device = %self.device, attr, "no dispatcher running, event dropped");
            return;
        };
        let server = self.server.clone();
        let device = self.device.clone();
        let attr = attr.to_string();
        submitter.submit(move || server.push_change_event(&device, &attr, value, quality));
    }

    pub fn read(&self, attr: &str) -> Option<WireValue> {
        if attr.eq_ignore_ascii_case(STATE_ATTR) {
            Some(WireValue::State(self.state()))
        } else if attr.eq_ignore_ascii_case(STATUS_ATTR) {
            Some(WireValue::String(self.status()))
        } else {
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tangospec_middleware::{Device, DeviceContext, LocalServer};
    use tangospec_store::MemoryPropertyStore;

    struct Bare(String);

    impl Device for Bare {
        fn name(&self) -> &str {
            &self.0
        }
        fn class(&self) -> &str {
            "Bare"
        }
        fn init(&self) {}
        fn delete(&self) {}
        fn attributes(&self) -> Vec<tangospec_middleware::AttrInfo> {
            Vec::new()
        }
        fn read_attribute(&self, name: &str) -> Result<WireValue, BridgeError> {
            Err(BridgeError::not_found("attribute", name))
        }
        fn write_attribute(&self, name: &str, _value: WireValue) -> Result<(), BridgeError> {
            Err(BridgeError::not_found("attribute", name))
        }
        fn commands(&self) -> Vec<&'static str> {
            Vec::new()
        }
        fn command(&self, name: &str, _arg: WireValue) -> Result<WireValue, BridgeError> {
            Err(BridgeError::not_found("command", name))
        }
    }

    fn server() -> Arc<LocalServer> {
        let server = LocalServer::new(Arc::new(MemoryPropertyStore::new()));
        server.register_class("Bare", |ctx: DeviceContext| -> Arc<dyn Device> {
            Arc::new(Bare(ctx.name))
        });
        server.create_device("Bare", "test/bare/1", None).unwrap();
        server.set_change_event("test/bare/1", STATE_ATTR, true);
        server.set_change_event("test/bare/1", STATUS_ATTR, true);
        server
    }

    #[test]
    fn starts_unknown() {
        let server = server();
        let switch = StateSwitch::new("test/bare/1", server.clone());
        assert_eq!(switch.state(), DevState::Unknown);
        assert_eq!(switch.read("state"), Some(WireValue::State(DevState::Unknown)));
        assert_eq!(switch.read("Output"), None);
        server.shutdown();
    }

    #[tokio::test]
    async fn state_then_status_events_in_order() {
        let server = server();
        let switch = StateSwitch::new("test/bare/1", server.clone());
        switch.start_events().unwrap();
        let mut sub = server.bus().subscribe_device("test/bare/1", None);

        switch.switch(DevState::Fault, "broken");
        let first = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.attribute, STATE_ATTR);
        assert_eq!(first.value, WireValue::State(DevState::Fault));
        assert_eq!(second.value, WireValue::String("broken".into()));
        assert_eq!(switch.status(), "broken");

        switch.stop_events();
        assert!(switch.submitter().is_none());
        server.shutdown();
    }

    #[test]
    fn status_only_keeps_state() {
        let server = server();
        let switch = StateSwitch::new("test/bare/1", server.clone());
        switch.switch(DevState::On, "ready");
        switch.switch_state(None, Some("still ready"));
        assert_eq!(switch.state(), DevState::On);
        switch.append_status(DevState::Fault, "and then not");
        assert_eq!(switch.status(), "still ready\nand then not");
        server.shutdown();
    }

    #[test]
    fn submitted_work_runs_on_the_drain_thread() {
        let server = server();
        let switch = Arc::new(StateSwitch::new("test/bare/1", server.clone()));
        assert!(!switch.submit(|| Ok(())));
        switch.start_events().unwrap();

        let (tx, rx) = mpsc::channel();
        let inner = switch.clone();
        assert!(switch.submit(move || {
            inner.switch(DevState::On, "ready");
            tx.send(std::thread::current().name().map(str::to_string)).ok();
            Ok(())
        }));
        assert!(switch.flush(Duration::from_secs(2)));
        let ran_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ran_on.as_deref(), Some("dispatch-test/bare/1"));
        assert_eq!(switch.state(), DevState::On);
        switch.stop_events();
        server.shutdown();
    }

    #[test]
    fn events_are_dropped_without_dispatcher() {
        let server = server();
        let switch = StateSwitch::new("test/bare/1", server.clone());
        let mut rx = server.bus().subscribe();
        switch.switch(DevState::On, "ready");
        assert!(rx.try_recv().is_err());
        server.shutdown();
    }
}
