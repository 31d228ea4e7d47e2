//! [`MotorDevice`] – the `SpecMotor` device class.
//!
//! Mirrors one session motor.  The element is named by the `SpecMotor`
//! property: `host:session:mnemonic`, or a bare mnemonic belonging to the
//! session of the served `Spec` device.
//!
//! | Attribute | Access | Source |
//! |---|---|---|
//! | `Position` | rw, events | user position; quality `Changing` while moving |
//! | `DialPosition` | r | dial position |
//! | `Sign` | rw | ±1 |
//! | `Offset` | rw | user/dial offset |
//! | `AccelerationTime` | rw | parameter `acceleration` |
//! | `Backlash` | rw | parameter `backlash` |
//! | `StepSize` | rw, events | local, used by `StepUp`/`StepDown` |
//! | `LimitSwitches` | r | `[home, high, low]` |
//! | `PositionLimits` | r | `[low, high]` |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tangospec_middleware::{AttrInfo, Device, DeviceContext, DeviceServer};
use tangospec_session::{
    CONNECT_TIMEOUT, ElementAddress, MotorLimits, MotorListener, MotorProxy, MotorState,
    SessionConnector, Subscription,
};
use tangospec_types::{AttrQuality, BridgeError, DevState, WireType, WireValue};
use tracing::{debug, info, warn};

use crate::state::{STATE_ATTR, STATUS_ATTR, StateSwitch};
use crate::{MOTOR_CLASS, first_value, resolve_element};

/// Child property naming the mirrored motor.
pub const MOTOR_PROPERTY: &str = "SpecMotor";

const POSITION: &str = "Position";
const STEP_SIZE: &str = "StepSize";

// ─────────────────────────────────────────────────────────────────────────────
// Session callbacks
// ─────────────────────────────────────────────────────────────────────────────

/// Device-side reaction to motor callbacks.  Only ever runs on the drain
/// thread.
struct MotorCore {
    mnemonic: String,
    state: Arc<StateSwitch>,
    proxy: Arc<dyn MotorProxy>,
    limits: Arc<Mutex<Option<MotorLimits>>>,
    limits_pending: AtomicBool,
}

impl MotorCore {
    fn status_for(state: DevState) -> String {
        format!("Motor is now {state}")
    }

    fn connected(&self) {
        if self.state.state() != DevState::On {
            self.state.switch(DevState::On, &Self::status_for(DevState::On));
        }
    }

    fn disconnected(&self) {
        if self.state.state() != DevState::Off {
            self.state.switch(DevState::Off, &Self::status_for(DevState::Off));
        }
    }

    fn position_changed(&self, position: f64) {
        let quality = if self.state.state() == DevState::Moving {
            AttrQuality::Changing
        } else {
            AttrQuality::Valid
        };
        self.state.push(POSITION, WireValue::Double(position), quality);
    }

    fn state_changed(&self, spec_state: MotorState) {
        let old = self.state.state();
        let new = spec_state.dev_state();
        self.state.switch(new, &Self::status_for(new));

        // The last position event must carry the settled value.
        if old == DevState::Moving && new != DevState::Moving {
            match self.proxy.position() {
                Ok(position) => {
                    self.state
                        .push(POSITION, WireValue::Double(position), AttrQuality::Valid)
                }
                Err(e) => warn!(motor = %self.mnemonic, error = %e, "cannot re-read settled position"),
            }
        }
    }

    fn refresh_limits(&self) {
        // Cleared before the read: a change arriving meanwhile queues another refresh.
        self.limits_pending.store(false, Ordering::SeqCst);
        match self.proxy.limits() {
            Ok(limits) => {
                debug!(motor = %self.mnemonic, low = limits.low, high = limits.high, "limits updated");
                *self.limits.lock() = Some(limits);
            }
            Err(e) => warn!(motor = %self.mnemonic, error = %e, "failed to update limits"),
        }
    }
}

/// The listener handed to the session.  Every callback is marshalled onto
/// the device's dispatcher.
struct MotorEvents(Arc<MotorCore>);

impl MotorEvents {
    fn new(
        mnemonic: &str,
        state: Arc<StateSwitch>,
        proxy: Arc<dyn MotorProxy>,
        limits: Arc<Mutex<Option<MotorLimits>>>,
    ) -> Self {
        Self(Arc::new(MotorCore {
            mnemonic: mnemonic.to_string(),
            state,
            proxy,
            limits,
            limits_pending: AtomicBool::new(false),
        }))
    }

    fn marshal(&self, work: impl FnOnce(&MotorCore) + Send + 'static) -> bool {
        let core = self.0.clone();
        self.0.state.submit(move || {
            work(&core);
            Ok(())
        })
    }
}

impl MotorListener for MotorEvents {
    fn connected(&self) {
        self.marshal(MotorCore::connected);
    }

    fn disconnected(&self) {
        self.marshal(MotorCore::disconnected);
    }

    fn position_changed(&self, position: f64) {
        self.marshal(move |core| core.position_changed(position));
    }

    fn state_changed(&self, spec_state: MotorState) {
        self.marshal(move |core| core.state_changed(spec_state));
    }

    fn limits_changed(&self) {
        if self.0.limits_pending.swap(true, Ordering::SeqCst) {
            debug!(motor = %self.0.mnemonic, "limits refresh already queued");
            return;
        }
        if !self.marshal(MotorCore::refresh_limits) {
            self.0.limits_pending.store(false, Ordering::SeqCst);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MotorDevice
// ─────────────────────────────────────────────────────────────────────────────

struct MotorLink {
    address: ElementAddress,
    proxy: Arc<dyn MotorProxy>,
    _subscription: Subscription,
}

pub struct MotorDevice {
    name: String,
    server: Arc<dyn DeviceServer>,
    connector: Arc<dyn SessionConnector>,
    state: Arc<StateSwitch>,
    link: RwLock<Option<Arc<MotorLink>>>,
    limits: Arc<Mutex<Option<MotorLimits>>>,
    step_size: Mutex<f64>,
}

impl MotorDevice {
    pub fn new(ctx: DeviceContext, connector: Arc<dyn SessionConnector>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(StateSwitch::new(&ctx.name, ctx.server.clone())),
            name: ctx.name,
            server: ctx.server,
            connector,
            link: RwLock::new(None),
            limits: Arc::new(Mutex::new(None)),
            step_size: Mutex::new(1.0),
        })
    }

    /// The mirrored element, once connected.
    pub fn address(&self) -> Option<ElementAddress> {
        self.link.read().as_ref().map(|l| l.address.clone())
    }

    pub fn state(&self) -> DevState {
        self.state.state()
    }

    pub fn status(&self) -> String {
        self.state.status()
    }

    fn proxy(&self) -> Result<Arc<dyn MotorProxy>, BridgeError> {
        self.link
            .read()
            .as_ref()
            .map(|l| l.proxy.clone())
            .ok_or_else(|| BridgeError::NotConnected(self.name.clone()))
    }

    fn connect(&self) -> Result<MotorLink, String> {
        let property = first_value(self.server.as_ref(), &self.name, MOTOR_PROPERTY)
            .map_err(|e| format!("Error reading {MOTOR_PROPERTY} property: {e}"))?
            .ok_or_else(|| format!("Property {MOTOR_PROPERTY} is not set"))?;
        self.state.switch(DevState::Init, &format!("Pending connection to {property}"));

        let address = resolve_element(self.server.as_ref(), &property)
            .map_err(|e| format!("Invalid motor '{property}': {e}"))?;
        let mnemonic = address.mnemonic.clone();
        let session = self
            .connector
            .connect(&address.session, CONNECT_TIMEOUT)
            .map_err(|_| format!("Error connecting to Spec motor {mnemonic}"))?;
        let proxy = session
            .motor(&mnemonic)
            .map_err(|_| format!("Error creating Spec motor {mnemonic}"))?;

        match proxy.limits() {
            Ok(limits) => *self.limits.lock() = Some(limits),
            Err(e) => warn!(device = %self.name, error = %e, "motor limits unavailable"),
        }
        let listener = Arc::new(MotorEvents::new(
            &mnemonic,
            self.state.clone(),
            proxy.clone(),
            self.limits.clone(),
        ));
        let subscription = proxy
            .subscribe(listener)
            .map_err(|_| format!("Error connecting to Spec motor {mnemonic}"))?;
        Ok(MotorLink {
            address,
            proxy,
            _subscription: subscription,
        })
    }

    fn write_position(&self, target: f64) -> Result<(), BridgeError> {
        if let Some(limits) = *self.limits.lock() {
            if !limits.contains(target) {
                return Err(BridgeError::InvalidValue(format!(
                    "position {target} outside limits [{}, {}]",
                    limits.low, limits.high
                )));
            }
        }
        self.proxy()?.move_to(target)
    }

    fn parameter_f64(&self, name: &str) -> Result<f64, BridgeError> {
        let value = self.proxy()?.parameter(name)?;
        value
            .as_f64()
            .ok_or_else(|| BridgeError::InvalidValue(format!("parameter {name} is not a number: {value}")))
    }

    fn parameter_flag(proxy: &dyn MotorProxy, name: &str) -> Result<bool, BridgeError> {
        let value = proxy.parameter(name)?;
        Ok(match value {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => false,
        })
    }

    fn set_step_size(&self, step: f64) {
        *self.step_size.lock() = step;
        self.state.push(STEP_SIZE, WireValue::Double(step), AttrQuality::Valid);
    }
}

impl Device for MotorDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> &str {
        MOTOR_CLASS
    }

    fn init(&self) {
        if let Err(e) = self.state.start_events() {
            warn!(device = %self.name, error = %e, "cannot start event dispatcher");
        }
        for attr in [STATE_ATTR, STATUS_ATTR, POSITION, STEP_SIZE] {
            self.server.set_change_event(&self.name, attr, true);
        }
        *self.step_size.lock() = 1.0;

        match self.connect() {
            Ok(link) => {
                info!(device = %self.name, motor = %link.address, "motor bound");
                *self.link.write() = Some(Arc::new(link));
            }
            Err(status) => self.state.switch(DevState::Fault, &status),
        }
    }

    fn delete(&self) {
        self.link.write().take();
        self.limits.lock().take();
        self.state.stop_events();
        debug!(device = %self.name, "motor released");
    }

    fn attributes(&self) -> Vec<AttrInfo> {
        vec![
            AttrInfo::read_only(STATE_ATTR, WireType::State),
            AttrInfo::read_only(STATUS_ATTR, WireType::String),
            AttrInfo::read_write(POSITION, WireType::Double),
            AttrInfo::read_only("DialPosition", WireType::Double),
            AttrInfo::read_write("Sign", WireType::Long),
            AttrInfo::read_write("Offset", WireType::Double),
            AttrInfo::read_write("AccelerationTime", WireType::Double),
            AttrInfo::read_write("Backlash", WireType::Double),
            AttrInfo::read_write(STEP_SIZE, WireType::Double),
            AttrInfo::read_only("LimitSwitches", WireType::BooleanArray),
            AttrInfo::read_only("PositionLimits", WireType::DoubleArray),
        ]
    }

    fn read_attribute(&self, name: &str) -> Result<WireValue, BridgeError> {
        if let Some(value) = self.state.read(name) {
            return Ok(value);
        }
        match name {
            "Position" => Ok(WireValue::Double(self.proxy()?.position()?)),
            "DialPosition" => Ok(WireValue::Double(self.proxy()?.dial_position()?)),
            "Sign" => Ok(WireValue::Long(self.proxy()?.sign()?)),
            "Offset" => Ok(WireValue::Double(self.proxy()?.offset()?)),
            "AccelerationTime" => Ok(WireValue::Double(self.parameter_f64("acceleration")?)),
            "Backlash" => Ok(WireValue::Double(self.parameter_f64("backlash")?)),
            "StepSize" => Ok(WireValue::Double(*self.step_size.lock())),
            "LimitSwitches" => {
                let proxy = self.proxy()?;
                Ok(WireValue::BooleanArray(vec![
                    false,
                    Self::parameter_flag(proxy.as_ref(), "high_lim_hit")?,
                    Self::parameter_flag(proxy.as_ref(), "low_lim_hit")?,
                ]))
            }
            "PositionLimits" => {
                let limits = match *self.limits.lock() {
                    Some(limits) => limits,
                    None => self.proxy()?.limits()?,
                };
                Ok(WireValue::DoubleArray(vec![limits.low, limits.high]))
            }
            other => Err(BridgeError::not_found("attribute", other)),
        }
    }

    fn write_attribute(&self, name: &str, value: WireValue) -> Result<(), BridgeError> {
        match name {
            "Position" => self.write_position(value.as_f64()?),
            "Sign" => self.proxy()?.set_sign(value.as_i64()?),
            "Offset" => self.proxy()?.set_offset(value.as_f64()?),
            "AccelerationTime" => self
                .proxy()?
                .set_parameter("acceleration", Value::from(value.as_f64()?)),
            "Backlash" => self
                .proxy()?
                .set_parameter("backlash", Value::from(value.as_f64()?)),
            "StepSize" => {
                self.set_step_size(value.as_f64()?);
                Ok(())
            }
            other if self.attributes().iter().any(|a| a.name == other) => Err(
                BridgeError::InvalidValue(format!("attribute {other} is read-only")),
            ),
            other => Err(BridgeError::not_found("attribute", other)),
        }
    }

    fn commands(&self) -> Vec<&'static str> {
        vec!["Stop", "Abort", "Move", "MoveRelative", "StepUp", "StepDown"]
    }

    fn command(&self, name: &str, arg: WireValue) -> Result<WireValue, BridgeError> {
        match name {
            "Stop" | "Abort" => self.proxy()?.stop()?,
            "Move" => self.write_position(arg.as_f64()?)?,
            "MoveRelative" => self.proxy()?.move_relative(arg.as_f64()?)?,
            "StepUp" => {
                let step = *self.step_size.lock();
                self.proxy()?.move_relative(step)?
            }
            "StepDown" => {
                let step = *self.step_size.lock();
                self.proxy()?.move_relative(-step)?
            }
            other => return Err(BridgeError::not_found("command", other)),
        }
        Ok(WireValue::Void)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
