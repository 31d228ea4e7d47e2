//! [`SimSession`] – in-process stand-in for a SPEC session.
//!
//! Implements every capability trait of this crate without a network
//! connection so the whole bridge can run in unit tests, CI and the demo
//! console.  Like a real session client it delivers callbacks on its own
//! thread, never on the caller's.
//!
//! # Stub behaviour
//!
//! | Element | Behaviour |
//! |---|---|
//! | Motor | `move_to` runs MoveStarted → Moving → Ready with an intermediate and a final position callback. |
//! | Counter | `count(t)` runs Counting → NotCounting; the value becomes `t` for timers and `1000 t` otherwise. |
//! | Variable | Created on first use with `null`; every write fires `update`. |
//! | Tty | Each command prints its reply, then a `N.SESSION> ` prompt and the newline echo. |
//! | Command | `sleep <s>` (abortable), `fail <msg>`, `p <text>`, `wa`, `mv <mne> <pos>`, `ct <s>`; anything else goes to the handler installed with [`SimSession::set_command_handler`]. |
//!
//! # Example
//!
//! ```rust
//! use tangospec_session::{Session, SimSession};
//!
//! let sim = SimSession::builder("localhost:fourc")
//!     .with_motor("tth", 0.0)
//!     .with_motor("th", 0.0)
//!     .build()
//!     .unwrap();
//!
//! let mut motors = sim.motor_mnemonics().unwrap();
//! motors.sort();
//! assert_eq!(motors, vec!["th".to_string(), "tth".to_string()]);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tangospec_types::BridgeError;
use tracing::{debug, warn};

use crate::address::SessionAddress;
use crate::command::CommandChannel;
use crate::counter::{CounterListener, CounterProxy, CounterState, CounterType};
use crate::motor::{MotorLimits, MotorListener, MotorProxy, MotorState};
use crate::session::{Session, SessionConnector};
use crate::subscription::Subscription;
use crate::tty::{OutputCallback, OutputChunk, TtyProxy};
use crate::variable::{UpdateCallback, VariableProxy};

/// Reply produced by a custom command handler.
pub type CommandHandler = dyn Fn(&str) -> Result<String, BridgeError> + Send + Sync;

const SLEEP_SLICE: Duration = Duration::from_millis(10);

// ─────────────────────────────────────────────────────────────────────────────
// Callback-delivery thread
// ─────────────────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce() + Send>;

struct EventLoop {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl EventLoop {
    fn start(name: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let spawned = thread::Builder::new()
            .name(format!("sim-{name}"))
            .spawn(move || {
                for job in rx {
                    job();
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, session = name, "failed to start simulated session thread");
        }
        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
        })
    }

    fn post(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.sender.lock().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    fn close(&self) {
        self.sender.lock().take();
    }
}

struct ListenerSet<L: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Arc<L>)>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSet<L> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        })
    }

    fn add(self: &Arc<Self>, listener: Arc<L>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(set) = weak.upgrade() {
                set.entries.lock().retain(|(i, _)| *i != id);
            }
        })
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.lock().iter().map(|(_, l)| l.clone()).collect()
    }
}

fn check_reachable(reachable: &AtomicBool, address: &SessionAddress) -> Result<(), BridgeError> {
    if reachable.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(BridgeError::connection(address.to_string(), "session unreachable"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Motor
// ─────────────────────────────────────────────────────────────────────────────

struct MotorData {
    dial: f64,
    sign: i64,
    offset: f64,
    limits: MotorLimits,
    state: MotorState,
    params: BTreeMap<String, Value>,
}

impl MotorData {
    fn user(&self) -> f64 {
        self.sign as f64 * self.dial + self.offset
    }

    fn set_user(&mut self, position: f64) {
        let sign = if self.sign == 0 { 1.0 } else { self.sign as f64 };
        self.dial = (position - self.offset) / sign;
    }
}

/// A simulated session motor.
pub struct SimMotor {
    mnemonic: String,
    address: SessionAddress,
    data: Arc<Mutex<MotorData>>,
    listeners: Arc<ListenerSet<dyn MotorListener>>,
    events: Arc<EventLoop>,
    reachable: Arc<AtomicBool>,
    position_reads: AtomicUsize,
    limits_reads: AtomicUsize,
}

impl SimMotor {
    fn new(
        mnemonic: &str,
        position: f64,
        address: SessionAddress,
        events: Arc<EventLoop>,
        reachable: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let mut params = BTreeMap::new();
        params.insert("acceleration".to_string(), Value::from(0.125));
        params.insert("backlash".to_string(), Value::from(0.0));
        Arc::new(Self {
            mnemonic: mnemonic.to_string(),
            address,
            data: Arc::new(Mutex::new(MotorData {
                dial: position,
                sign: 1,
                offset: 0.0,
                limits: MotorLimits {
                    low: -1000.0,
                    high: 1000.0,
                },
                state: MotorState::Ready,
                params,
            })),
            listeners: ListenerSet::new(),
            events,
            reachable,
            position_reads: AtomicUsize::new(0),
            limits_reads: AtomicUsize::new(0),
        })
    }

    /// Number of [`MotorProxy::position`] round trips served so far.
    pub fn position_reads(&self) -> usize {
        self.position_reads.load(Ordering::SeqCst)
    }

    /// Number of [`MotorProxy::limits`] round trips served so far.
    pub fn limits_reads(&self) -> usize {
        self.limits_reads.load(Ordering::SeqCst)
    }

    /// Force a state change as if the session reported it.
    pub fn fire_state(&self, state: MotorState) {
        let data = self.data.clone();
        let listeners = self.listeners.clone();
        self.events.post(move || {
            data.lock().state = state;
            for l in listeners.snapshot() {
                l.state_changed(state);
            }
        });
    }

    /// Change the software limits and fire `limits_changed`.
    pub fn set_limits(&self, low: f64, high: f64) {
        self.data.lock().limits = MotorLimits { low, high };
        let listeners = self.listeners.clone();
        self.events.post(move || {
            for l in listeners.snapshot() {
                l.limits_changed();
            }
        });
    }

    /// Move the motor from the session side (e.g. from the SPEC console).
    pub fn set_session_position(&self, position: f64) {
        let data = self.data.clone();
        let listeners = self.listeners.clone();
        self.events.post(move || {
            data.lock().set_user(position);
            for l in listeners.snapshot() {
                l.position_changed(position);
            }
        });
    }

    pub fn drop_connection(&self) {
        let listeners = self.listeners.clone();
        self.events.post(move || {
            for l in listeners.snapshot() {
                l.disconnected();
            }
        });
    }

    pub fn restore_connection(&self) {
        let listeners = self.listeners.clone();
        self.events.post(move || {
            for l in listeners.snapshot() {
                l.connected();
            }
        });
    }

    fn check(&self) -> Result<(), BridgeError> {
        check_reachable(&self.reachable, &self.address)
    }
}

impl MotorProxy for SimMotor {
    fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    fn position(&self) -> Result<f64, BridgeError> {
        self.check()?;
        self.position_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.lock().user())
    }

    fn dial_position(&self) -> Result<f64, BridgeError> {
        self.check()?;
        Ok(self.data.lock().dial)
    }

    fn move_to(&self, target: f64) -> Result<(), BridgeError> {
        self.check()?;
        let (start, limits) = {
            let data = self.data.lock();
            (data.user(), data.limits)
        };
        if !limits.contains(target) {
            return Err(BridgeError::InvalidValue(format!(
                "{target} outside limits [{}, {}] of motor {}",
                limits.low, limits.high, self.mnemonic
            )));
        }
        debug!(motor = %self.mnemonic, start, target, "simulated move");
        let data = self.data.clone();
        let listeners = self.listeners.clone();
        self.events.post(move || {
            for state in [MotorState::MoveStarted, MotorState::Moving] {
                data.lock().state = state;
                for l in listeners.snapshot() {
                    l.state_changed(state);
                }
            }
            for position in [(start + target) / 2.0, target] {
                data.lock().set_user(position);
                for l in listeners.snapshot() {
                    l.position_changed(position);
                }
            }
            data.lock().state = MotorState::Ready;
            for l in listeners.snapshot() {
                l.state_changed(MotorState::Ready);
            }
        });
        Ok(())
    }

    fn move_relative(&self, delta: f64) -> Result<(), BridgeError> {
        let current = self.data.lock().user();
        self.move_to(current + delta)
    }

    fn stop(&self) -> Result<(), BridgeError> {
        self.check()?;
        let data = self.data.clone();
        let listeners = self.listeners.clone();
        self.events.post(move || {
            let was_moving = {
                let mut d = data.lock();
                let moving = matches!(d.state, MotorState::MoveStarted | MotorState::Moving);
                if moving {
                    d.state = MotorState::Ready;
                }
                moving
            };
            if was_moving {
                for l in listeners.snapshot() {
                    l.state_changed(MotorState::Ready);
                }
            }
        });
        Ok(())
    }

    fn sign(&self) -> Result<i64, BridgeError> {
        self.check()?;
        Ok(self.data.lock().sign)
    }

    fn set_sign(&self, sign: i64) -> Result<(), BridgeError> {
        self.check()?;
        if sign != 1 && sign != -1 {
            return Err(BridgeError::InvalidValue(format!("motor sign must be 1 or -1, got {sign}")));
        }
        self.data.lock().sign = sign;
        Ok(())
    }

    fn offset(&self) -> Result<f64, BridgeError> {
        self.check()?;
        Ok(self.data.lock().offset)
    }

    fn set_offset(&self, offset: f64) -> Result<(), BridgeError> {
        self.check()?;
        self.data.lock().offset = offset;
        Ok(())
    }

    fn parameter(&self, name: &str) -> Result<Value, BridgeError> {
        self.check()?;
        let data = self.data.lock();
        match name {
            "high_lim_hit" => Ok(Value::from(data.user() >= data.limits.high)),
            "low_lim_hit" => Ok(Value::from(data.user() <= data.limits.low)),
            other => data
                .params
                .get(other)
                .cloned()
                .ok_or_else(|| BridgeError::not_found("motor parameter", other)),
        }
    }

    fn set_parameter(&self, name: &str, value: Value) -> Result<(), BridgeError> {
        self.check()?;
        self.data.lock().params.insert(name.to_string(), value);
        Ok(())
    }

    fn limits(&self) -> Result<MotorLimits, BridgeError> {
        self.check()?;
        self.limits_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.lock().limits)
    }

    fn state(&self) -> Result<MotorState, BridgeError> {
        self.check()?;
        Ok(self.data.lock().state)
    }

    fn subscribe(&self, listener: Arc<dyn MotorListener>) -> Result<Subscription, BridgeError> {
        self.check()?;
        let subscription = self.listeners.add(listener.clone());
        self.events.post(move || listener.connected());
        Ok(subscription)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Counter
// ─────────────────────────────────────────────────────────────────────────────

struct CounterData {
    value: f64,
    enabled: bool,
    counter_type: CounterType,
    state: CounterState,
}

/// A simulated session counter.
pub struct SimCounter {
    mnemonic: String,
    address: SessionAddress,
    data: Arc<Mutex<CounterData>>,
    listeners: Arc<ListenerSet<dyn CounterListener>>,
    events: Arc<EventLoop>,
    reachable: Arc<AtomicBool>,
}

impl SimCounter {
    fn new(
        mnemonic: &str,
        counter_type: CounterType,
        address: SessionAddress,
        events: Arc<EventLoop>,
        reachable: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mnemonic: mnemonic.to_string(),
            address,
            data: Arc::new(Mutex::new(CounterData {
                value: 0.0,
                enabled: true,
                counter_type,
                state: CounterState::NotCounting,
            })),
            listeners: ListenerSet::new(),
            events,
            reachable,
        })
    }

    pub fn fire_state(&self, state: CounterState) {
        let data = self.data.clone();
        let listeners = self.listeners.clone();
        self.events.post(move || {
            data.lock().state = state;
            for l in listeners.snapshot() {
                l.state_changed(state);
            }
        });
    }

    pub fn is_enabled(&self) -> bool {
        self.data.lock().enabled
    }

    fn check(&self) -> Result<(), BridgeError> {
        check_reachable(&self.reachable, &self.address)
    }
}

impl CounterProxy for SimCounter {
    fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    fn value(&self) -> Result<f64, BridgeError> {
        self.check()?;
        Ok(self.data.lock().value)
    }

    fn count(&self, seconds: f64) -> Result<(), BridgeError> {
        self.check()?;
        if seconds < 0.0 {
            return Err(BridgeError::InvalidValue(format!("negative count time {seconds}")));
        }
        let data = self.data.clone();
        let listeners = self.listeners.clone();
        self.events.post(move || {
            let (enabled, rate) = {
                let mut d = data.lock();
                d.state = CounterState::Counting;
                let rate = match d.counter_type {
                    CounterType::Timer => 1.0,
                    _ => 1000.0,
                };
                (d.enabled, rate)
            };
            for l in listeners.snapshot() {
                l.state_changed(CounterState::Counting);
            }
            if enabled {
                for value in [seconds * rate / 2.0, seconds * rate] {
                    data.lock().value = value;
                    for l in listeners.snapshot() {
                        l.value_changed(value);
                    }
                }
            }
            data.lock().state = CounterState::NotCounting;
            for l in listeners.snapshot() {
                l.state_changed(CounterState::NotCounting);
            }
        });
        Ok(())
    }

    fn stop(&self) -> Result<(), BridgeError> {
        self.check()?;
        let data = self.data.clone();
        let listeners = self.listeners.clone();
        self.events.post(move || {
            let was_counting = {
                let mut d = data.lock();
                let counting = d.state == CounterState::Counting;
                d.state = CounterState::NotCounting;
                counting
            };
            if was_counting {
                for l in listeners.snapshot() {
                    l.state_changed(CounterState::NotCounting);
                }
            }
        });
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), BridgeError> {
        self.check()?;
        self.data.lock().enabled = enabled;
        Ok(())
    }

    fn counter_type(&self) -> Result<CounterType, BridgeError> {
        self.check()?;
        Ok(self.data.lock().counter_type)
    }

    fn state(&self) -> Result<CounterState, BridgeError> {
        self.check()?;
        Ok(self.data.lock().state)
    }

    fn subscribe(&self, listener: Arc<dyn CounterListener>) -> Result<Subscription, BridgeError> {
        self.check()?;
        let subscription = self.listeners.add(listener.clone());
        self.events.post(move || listener.connected());
        Ok(subscription)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Variable and tty
// ─────────────────────────────────────────────────────────────────────────────

type UpdateFn = dyn Fn(Value) + Send + Sync;
type OutputFn = dyn Fn(OutputChunk) + Send + Sync;

struct SimVariable {
    name: String,
    address: SessionAddress,
    value: Mutex<Value>,
    listeners: Arc<ListenerSet<UpdateFn>>,
    events: Arc<EventLoop>,
    reachable: Arc<AtomicBool>,
}

impl SimVariable {
    fn store(&self, value: Value) {
        *self.value.lock() = value.clone();
        let listeners = self.listeners.clone();
        self.events.post(move || {
            for l in listeners.snapshot() {
                l(value.clone());
            }
        });
    }
}

impl VariableProxy for SimVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Result<Value, BridgeError> {
        check_reachable(&self.reachable, &self.address)?;
        Ok(self.value.lock().clone())
    }

    fn set_value(&self, value: Value) -> Result<(), BridgeError> {
        check_reachable(&self.reachable, &self.address)?;
        self.store(value);
        Ok(())
    }

    fn subscribe(&self, on_update: UpdateCallback) -> Result<Subscription, BridgeError> {
        check_reachable(&self.reachable, &self.address)?;
        Ok(self.listeners.add(Arc::from(on_update)))
    }
}

struct SimTty {
    listeners: Arc<ListenerSet<OutputFn>>,
    events: Arc<EventLoop>,
}

impl SimTty {
    fn emit(&self, chunk: OutputChunk) {
        let listeners = self.listeners.clone();
        self.events.post(move || {
            for l in listeners.snapshot() {
                l(chunk.clone());
            }
        });
    }
}

impl TtyProxy for SimTty {
    fn subscribe(&self, on_output: OutputCallback) -> Result<Subscription, BridgeError> {
        Ok(self.listeners.add(Arc::from(on_output)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct SimShared {
    address: SessionAddress,
    reachable: Arc<AtomicBool>,
    events: Arc<EventLoop>,
    motors: Mutex<BTreeMap<String, Arc<SimMotor>>>,
    counters: Mutex<BTreeMap<String, Arc<SimCounter>>>,
    variables: Mutex<BTreeMap<String, Arc<SimVariable>>>,
    tty: Arc<SimTty>,
    prompt_line: AtomicU64,
    handler: Mutex<Option<Arc<CommandHandler>>>,
}

impl SimShared {
    fn variable(&self, name: &str) -> Arc<SimVariable> {
        self.variables
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(SimVariable {
                    name: name.to_string(),
                    address: self.address.clone(),
                    value: Mutex::new(Value::Null),
                    listeners: ListenerSet::new(),
                    events: self.events.clone(),
                    reachable: self.reachable.clone(),
                })
            })
            .clone()
    }

    fn prompt(&self) {
        let line = self.prompt_line.fetch_add(1, Ordering::SeqCst) + 1;
        let session = self.address.session().to_uppercase();
        self.tty.emit(OutputChunk::Text(format!("\n{line}.{session}> ")));
        self.tty.emit(OutputChunk::Text("\n".to_string()));
    }
}

/// A simulated session.  Build with [`SimSession::builder`].
pub struct SimSession {
    shared: Arc<SimShared>,
}

impl SimSession {
    pub fn builder(address: &str) -> SimSessionBuilder {
        SimSessionBuilder {
            address: address.to_string(),
            motors: Vec::new(),
            counters: Vec::new(),
            variables: Vec::new(),
        }
    }

    /// Make the session (un)reachable; every round trip fails while
    /// unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn add_motor(&self, mnemonic: &str, position: f64) {
        let motor = SimMotor::new(
            mnemonic,
            position,
            self.shared.address.clone(),
            self.shared.events.clone(),
            self.shared.reachable.clone(),
        );
        self.shared.motors.lock().insert(mnemonic.to_string(), motor);
    }

    pub fn remove_motor(&self, mnemonic: &str) {
        self.shared.motors.lock().remove(mnemonic);
    }

    pub fn add_counter(&self, mnemonic: &str, counter_type: CounterType) {
        let counter = SimCounter::new(
            mnemonic,
            counter_type,
            self.shared.address.clone(),
            self.shared.events.clone(),
            self.shared.reachable.clone(),
        );
        self.shared.counters.lock().insert(mnemonic.to_string(), counter);
    }

    pub fn remove_counter(&self, mnemonic: &str) {
        self.shared.counters.lock().remove(mnemonic);
    }

    pub fn sim_motor(&self, mnemonic: &str) -> Option<Arc<SimMotor>> {
        self.shared.motors.lock().get(mnemonic).cloned()
    }

    pub fn sim_counter(&self, mnemonic: &str) -> Option<Arc<SimCounter>> {
        self.shared.counters.lock().get(mnemonic).cloned()
    }

    /// Change a variable from the session side; subscribers get `update`.
    pub fn set_variable(&self, name: &str, value: Value) {
        self.shared.variable(name).store(value);
    }

    pub fn variable_value(&self, name: &str) -> Option<Value> {
        self.shared
            .variables
            .lock()
            .get(name)
            .map(|v| v.value.lock().clone())
    }

    /// Push raw console output to tty subscribers.
    pub fn emit_output(&self, chunk: OutputChunk) {
        self.shared.tty.emit(chunk);
    }

    /// Route commands not understood by the built-ins to `handler`.
    pub fn set_command_handler(
        &self,
        handler: impl Fn(&str) -> Result<String, BridgeError> + Send + Sync + 'static,
    ) {
        *self.shared.handler.lock() = Some(Arc::new(handler));
    }

    /// Block until every callback posted so far has been delivered.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        self.shared.events.post(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv_timeout(Duration::from_secs(5));
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        self.shared.events.close();
    }
}

impl Session for SimSession {
    fn address(&self) -> &SessionAddress {
        &self.shared.address
    }

    fn motor_mnemonics(&self) -> Result<Vec<String>, BridgeError> {
        check_reachable(&self.shared.reachable, &self.shared.address)?;
        Ok(self.shared.motors.lock().keys().cloned().collect())
    }

    fn counter_mnemonics(&self) -> Result<Vec<String>, BridgeError> {
        check_reachable(&self.shared.reachable, &self.shared.address)?;
        Ok(self.shared.counters.lock().keys().cloned().collect())
    }

    fn motor(&self, mnemonic: &str) -> Result<Arc<dyn MotorProxy>, BridgeError> {
        check_reachable(&self.shared.reachable, &self.shared.address)?;
        match self.sim_motor(mnemonic) {
            Some(m) => Ok(m),
            None => Err(BridgeError::not_found("motor", mnemonic)),
        }
    }

    fn counter(&self, mnemonic: &str) -> Result<Arc<dyn CounterProxy>, BridgeError> {
        check_reachable(&self.shared.reachable, &self.shared.address)?;
        match self.sim_counter(mnemonic) {
            Some(c) => Ok(c),
            None => Err(BridgeError::not_found("counter", mnemonic)),
        }
    }

    fn variable(&self, name: &str) -> Result<Arc<dyn VariableProxy>, BridgeError> {
        check_reachable(&self.shared.reachable, &self.shared.address)?;
        Ok(self.shared.variable(name))
    }

    fn tty(&self) -> Result<Arc<dyn TtyProxy>, BridgeError> {
        check_reachable(&self.shared.reachable, &self.shared.address)?;
        Ok(self.shared.tty.clone())
    }

    fn command_channel(&self) -> Result<Arc<dyn CommandChannel>, BridgeError> {
        check_reachable(&self.shared.reachable, &self.shared.address)?;
        Ok(Arc::new(SimCommandChannel {
            shared: self.shared.clone(),
            aborted: AtomicBool::new(false),
        }))
    }
}

/// Builder for [`SimSession`].
pub struct SimSessionBuilder {
    address: String,
    motors: Vec<(String, f64)>,
    counters: Vec<(String, CounterType)>,
    variables: Vec<(String, Value)>,
}

impl SimSessionBuilder {
    pub fn with_motor(mut self, mnemonic: impl Into<String>, position: f64) -> Self {
        self.motors.push((mnemonic.into(), position));
        self
    }

    pub fn with_counter(mut self, mnemonic: impl Into<String>, counter_type: CounterType) -> Self {
        self.counters.push((mnemonic.into(), counter_type));
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.push((name.into(), value));
        self
    }

    /// # Errors
    ///
    /// [`BridgeError::InvalidAddress`] when the address is not `host:session`.
    pub fn build(self) -> Result<Arc<SimSession>, BridgeError> {
        let address = SessionAddress::parse(&self.address)?;
        let events = EventLoop::start(address.session());
        let shared = Arc::new(SimShared {
            address,
            reachable: Arc::new(AtomicBool::new(true)),
            tty: Arc::new(SimTty {
                listeners: ListenerSet::new(),
                events: events.clone(),
            }),
            events,
            motors: Mutex::new(BTreeMap::new()),
            counters: Mutex::new(BTreeMap::new()),
            variables: Mutex::new(BTreeMap::new()),
            prompt_line: AtomicU64::new(0),
            handler: Mutex::new(None),
        });
        let session = Arc::new(SimSession { shared });
        for (mnemonic, position) in self.motors {
            session.add_motor(&mnemonic, position);
        }
        for (mnemonic, counter_type) in self.counters {
            session.add_counter(&mnemonic, counter_type);
        }
        for (name, value) in self.variables {
            *session.shared.variable(&name).value.lock() = value;
        }
        Ok(session)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command channel
// ─────────────────────────────────────────────────────────────────────────────

struct SimCommandChannel {
    shared: Arc<SimShared>,
    aborted: AtomicBool,
}

impl SimCommandChannel {
    fn run(&self, text: &str) -> Result<String, BridgeError> {
        let handler = self.shared.handler.lock().clone();
        let mut words = text.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let rest: Vec<&str> = words.collect();
        match verb {
            "sleep" => {
                let seconds: f64 = rest
                    .first()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| BridgeError::TaskFailure(format!("sleep: invalid time in '{text}'")))?;
                let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
                while Instant::now() < deadline {
                    if self.aborted.load(Ordering::SeqCst) {
                        return Err(BridgeError::Aborted(text.to_string()));
                    }
                    thread::sleep(SLEEP_SLICE);
                }
                Ok(String::new())
            }
            "fail" => Err(BridgeError::TaskFailure(rest.join(" "))),
            "p" => Ok(rest.join(" ")),
            "wa" => {
                let motors = self.shared.motors.lock();
                let lines: Vec<String> = motors
                    .iter()
                    .map(|(name, m)| format!("{name} = {:.4}", m.data.lock().user()))
                    .collect();
                Ok(lines.join("\n"))
            }
            "mv" => {
                let (name, target) = match rest.as_slice() {
                    [name, target] => (*name, target.parse::<f64>().ok()),
                    _ => ("", None),
                };
                let target = target
                    .ok_or_else(|| BridgeError::TaskFailure(format!("Usage: mv motor position ('{text}')")))?;
                let motor = self
                    .shared
                    .motors
                    .lock()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BridgeError::not_found("motor", name))?;
                motor.move_to(target)?;
                Ok(String::new())
            }
            "ct" => {
                let seconds = rest.first().and_then(|s| s.parse().ok()).unwrap_or(1.0);
                let counters: Vec<Arc<SimCounter>> =
                    self.shared.counters.lock().values().cloned().collect();
                for counter in counters {
                    counter.count(seconds)?;
                }
                Ok(String::new())
            }
            _ => match handler {
                Some(handler) => handler(text),
                None => Err(BridgeError::TaskFailure(format!("Unrecognized command: {text}"))),
            },
        }
    }
}

impl CommandChannel for SimCommandChannel {
    fn execute(&self, text: &str) -> Result<String, BridgeError> {
        check_reachable(&self.shared.reachable, &self.shared.address)?;
        let result = self.run(text);
        match &result {
            Ok(reply) if !reply.is_empty() => {
                self.shared.tty.emit(OutputChunk::Text(format!("{reply}\n")));
            }
            Ok(_) => {}
            Err(e) => self.shared.tty.emit(OutputChunk::Text(format!("{e}\n"))),
        }
        self.shared.prompt();
        result
    }

    fn abort(&self) -> Result<(), BridgeError> {
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────────────────

/// Hands out registered [`SimSession`]s by address.
#[derive(Default)]
pub struct SimConnector {
    sessions: Mutex<BTreeMap<String, Arc<SimSession>>>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(self, session: Arc<SimSession>) -> Self {
        self.add(session);
        self
    }

    pub fn add(&self, session: Arc<SimSession>) {
        let key = session.shared.address.to_string();
        self.sessions.lock().insert(key, session);
    }
}

impl SessionConnector for SimConnector {
    fn connect(
        &self,
        address: &SessionAddress,
        timeout: Duration,
    ) -> Result<Arc<dyn Session>, BridgeError> {
        let session = self
            .sessions
            .lock()
            .get(&address.to_string())
            .cloned()
            .ok_or_else(|| BridgeError::connection(address.to_string(), "no such session"))?;
        if !session.shared.reachable.load(Ordering::SeqCst) {
            return Err(BridgeError::connection(
                address.to_string(),
                format!("timed out after {} ms", timeout.as_millis()),
            ));
        }
        Ok(session)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<MotorState>>,
        positions: Mutex<Vec<f64>>,
        connected: AtomicUsize,
    }

    impl MotorListener for Recorder {
        fn connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn position_changed(&self, position: f64) {
            self.positions.lock().push(position);
        }
        fn state_changed(&self, state: MotorState) {
            self.states.lock().push(state);
        }
    }

    fn fourc() -> Arc<SimSession> {
        SimSession::builder("localhost:fourc")
            .with_motor("tth", 0.0)
            .with_counter("sec", CounterType::Timer)
            .with_variable("myvar", json!({"x": 1}))
            .build()
            .unwrap()
    }

    #[test]
    fn motor_move_fires_state_sequence() {
        let sim = fourc();
        let motor = sim.motor("tth").unwrap();
        let rec = Arc::new(Recorder::default());
        let _sub = motor.subscribe(rec.clone()).unwrap();

        motor.move_to(10.0).unwrap();
        sim.flush();

        assert_eq!(rec.connected.load(Ordering::SeqCst), 1);
        assert_eq!(
            *rec.states.lock(),
            vec![MotorState::MoveStarted, MotorState::Moving, MotorState::Ready]
        );
        assert_eq!(*rec.positions.lock(), vec![5.0, 10.0]);
        assert_eq!(motor.position().unwrap(), 10.0);
    }

    #[test]
    fn move_outside_limits_is_rejected() {
        let sim = fourc();
        let motor = sim.motor("tth").unwrap();
        sim.sim_motor("tth").unwrap().set_limits(-5.0, 5.0);
        assert!(matches!(motor.move_to(6.0), Err(BridgeError::InvalidValue(_))));
    }

    #[test]
    fn dropped_subscription_stops_callbacks() {
        let sim = fourc();
        let motor = sim.motor("tth").unwrap();
        let rec = Arc::new(Recorder::default());
        let sub = motor.subscribe(rec.clone()).unwrap();
        drop(sub);

        motor.move_to(1.0).unwrap();
        sim.flush();
        assert!(rec.states.lock().is_empty());
    }

    #[test]
    fn unknown_elements_are_not_found() {
        let sim = fourc();
        assert!(matches!(sim.motor("chi"), Err(BridgeError::NotFound { .. })));
        assert!(matches!(sim.counter("det"), Err(BridgeError::NotFound { .. })));
    }

    #[test]
    fn unreachable_session_fails_round_trips() {
        let sim = fourc();
        sim.set_reachable(false);
        assert!(matches!(sim.motor_mnemonics(), Err(BridgeError::Connection { .. })));

        let connector = SimConnector::new().with_session(sim.clone());
        let address = SessionAddress::parse("localhost:fourc").unwrap();
        assert!(connector.connect(&address, Duration::from_millis(250)).is_err());

        sim.set_reachable(true);
        assert!(connector.connect(&address, Duration::from_millis(250)).is_ok());
    }

    #[test]
    fn variable_updates_reach_subscribers() {
        let sim = fourc();
        let var = sim.variable("myvar").unwrap();
        assert_eq!(var.value().unwrap(), json!({"x": 1}));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = var
            .subscribe(Box::new(move |v| s.lock().push(v)))
            .unwrap();
        sim.set_variable("myvar", json!(2));
        sim.flush();
        assert_eq!(*seen.lock(), vec![json!(2)]);
    }

    #[test]
    fn timer_counts_seconds() {
        let sim = fourc();
        let counter = sim.counter("sec").unwrap();
        counter.count(2.0).unwrap();
        sim.flush();
        assert_eq!(counter.value().unwrap(), 2.0);
        assert_eq!(counter.state().unwrap(), CounterState::NotCounting);
    }

    #[test]
    fn sleep_command_can_be_aborted() {
        let sim = fourc();
        let channel = sim.command_channel().unwrap();
        let runner = channel.clone();
        let handle = thread::spawn(move || runner.execute("sleep 30"));
        thread::sleep(Duration::from_millis(50));
        channel.abort().unwrap();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(BridgeError::Aborted(_))));
    }

    #[test]
    fn builtin_commands() {
        let sim = fourc();
        let channel = sim.command_channel().unwrap();
        assert_eq!(channel.execute("p hello world").unwrap(), "hello world");
        assert_eq!(channel.execute("wa").unwrap(), "tth = 0.0000");
        assert!(matches!(
            channel.execute("fail boom"),
            Err(BridgeError::TaskFailure(msg)) if msg == "boom"
        ));
        assert!(channel.execute("frobnicate").is_err());

        sim.set_command_handler(|text| Ok(text.to_uppercase()));
        assert_eq!(channel.execute("frobnicate").unwrap(), "FROBNICATE");
    }
}
