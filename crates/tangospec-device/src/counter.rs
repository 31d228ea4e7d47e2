//! [`CounterDevice`] – the `SpecCounter` device class.
//!
//! Mirrors one session counter, named by the `SpecCounter` property.  The
//! `Value` attribute carries quality `Changing` while the counter runs; the
//! transitions into and out of counting re-read the value so subscribers
//! always end on the settled count.

use std::sync::Arc;

use parking_lot::RwLock;
use tangospec_middleware::{AttrInfo, Device, DeviceContext, DeviceServer};
use tangospec_session::{
    CONNECT_TIMEOUT, CounterListener, CounterProxy, CounterState, CounterType, ElementAddress,
    SessionConnector, Subscription,
};
use tangospec_types::{AttrQuality, BridgeError, DevState, WireType, WireValue};
use tracing::{debug, info, warn};

use crate::state::{STATE_ATTR, STATUS_ATTR, StateSwitch};
use crate::{COUNTER_CLASS, first_value, resolve_element};

/// Child property naming the mirrored counter.
pub const COUNTER_PROPERTY: &str = "SpecCounter";

const VALUE: &str = "Value";

/// Device-side reaction to counter callbacks.  Only ever runs on the drain
/// thread.
struct CounterCore {
    mnemonic: String,
    state: Arc<StateSwitch>,
    proxy: Arc<dyn CounterProxy>,
}

impl CounterCore {
    fn type_name(&self) -> CounterType {
        self.proxy.counter_type().unwrap_or_default()
    }

    fn push_value(&self, quality: AttrQuality) {
        match self.proxy.value() {
            Ok(value) => self.state.push(VALUE, WireValue::Double(value), quality),
            Err(e) => warn!(counter = %self.mnemonic, error = %e, "cannot re-read counter value"),
        }
    }

    fn connected(&self) {
        if self.state.state() != DevState::On {
            let status = format!("Counter is now {} ({})", DevState::On, self.type_name());
            self.state.switch(DevState::On, &status);
        }
    }

    fn disconnected(&self) {
        if self.state.state() != DevState::Off {
            let status = format!("Counter is now {}", DevState::Off);
            self.state.switch(DevState::Off, &status);
        }
    }

    fn value_changed(&self, value: f64) {
        let quality = if self.state.state() == DevState::Running {
            AttrQuality::Changing
        } else {
            AttrQuality::Valid
        };
        self.state.push(VALUE, WireValue::Double(value), quality);
    }

    fn state_changed(&self, spec_state: CounterState) {
        let old = self.state.state();
        let new = spec_state.dev_state();
        let status = format!("Counter is now {new} ({})", self.type_name());
        self.state.switch(new, &status);

        match (old == DevState::Running, new == DevState::Running) {
            (false, true) => self.push_value(AttrQuality::Changing),
            (true, false) => self.push_value(AttrQuality::Valid),
            _ => {}
        }
    }
}

/// The listener handed to the session; forwards every callback to the
/// device's dispatcher.
struct CounterEvents(Arc<CounterCore>);

impl CounterEvents {
    fn marshal(&self, work: impl FnOnce(&CounterCore) + Send + 'static) {
        let core = self.0.clone();
        self.0.state.submit(move || {
            work(&core);
            Ok(())
        });
    }
}

impl CounterListener for CounterEvents {
    fn connected(&self) {
        self.marshal(CounterCore::connected);
    }

    fn disconnected(&self) {
        self.marshal(CounterCore::disconnected);
    }

    fn value_changed(&self, value: f64) {
        self.marshal(move |core| core.value_changed(value));
    }

    fn state_changed(&self, spec_state: CounterState) {
        self.marshal(move |core| core.state_changed(spec_state));
    }
}

struct CounterLink {
    address: ElementAddress,
    proxy: Arc<dyn CounterProxy>,
    _subscription: Subscription,
}

pub struct CounterDevice {
    name: String,
    server: Arc<dyn DeviceServer>,
    connector: Arc<dyn SessionConnector>,
    state: Arc<StateSwitch>,
    link: RwLock<Option<Arc<CounterLink>>>,
}

impl CounterDevice {
    pub fn new(ctx: DeviceContext, connector: Arc<dyn SessionConnector>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(StateSwitch::new(&ctx.name, ctx.server.clone())),
            name: ctx.name,
            server: ctx.server,
            connector,
            link: RwLock::new(None),
        })
    }

    pub fn address(&self) -> Option<ElementAddress> {
        self.link.read().as_ref().map(|l| l.address.clone())
    }

    pub fn state(&self) -> DevState {
        self.state.state()
    }

    pub fn status(&self) -> String {
        self.state.status()
    }

    fn proxy(&self) -> Result<Arc<dyn CounterProxy>, BridgeError> {
        self.link
            .read()
            .as_ref()
            .map(|l| l.proxy.clone())
            .ok_or_else(|| BridgeError::NotConnected(self.name.clone()))
    }

    fn connect(&self) -> Result<CounterLink, String> {
        let property = first_value(self.server.as_ref(), &self.name, COUNTER_PROPERTY)
            .map_err(|e| format!("Error reading {COUNTER_PROPERTY} property: {e}"))?
            .ok_or_else(|| format!("Property {COUNTER_PROPERTY} is not set"))?;
        self.state.switch(DevState::Init, &format!("Pending connection to {property}"));

        let address = resolve_element(self.server.as_ref(), &property)
            .map_err(|e| format!("Invalid counter '{property}': {e}"))?;
        let mnemonic = address.mnemonic.clone();
        let session = self
            .connector
            .connect(&address.session, CONNECT_TIMEOUT)
            .map_err(|_| format!("Error connecting to Spec counter {mnemonic}"))?;
        let proxy = session
            .counter(&mnemonic)
            .map_err(|_| format!("Error creating Spec counter {mnemonic}"))?;
        let listener = Arc::new(CounterEvents(Arc::new(CounterCore {
            mnemonic: mnemonic.clone(),
            state: self.state.clone(),
            proxy: proxy.clone(),
        })));
        let subscription = proxy
            .subscribe(listener)
            .map_err(|_| format!("Error connecting to Spec counter {mnemonic}"))?;
        Ok(CounterLink {
            address,
            proxy,
            _subscription: subscription,
        })
    }
}

impl Device for CounterDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> &str {
        COUNTER_CLASS
    }

    fn init(&self) {
        if let Err(e) = self.state.start_events() {
            warn!(device = %self.name, error = %e, "cannot start event dispatcher");
        }
        for attr in [STATE_ATTR, STATUS_ATTR, VALUE] {
            self.server.set_change_event(&self.name, attr, true);
        }
        match self.connect() {
            Ok(link) => {
                info!(device = %self.name, counter = %link.address, "counter bound");
                *self.link.write() = Some(Arc::new(link));
            }
            Err(status) => self.state.switch(DevState::Fault, &status),
        }
    }

    fn delete(&self) {
        self.link.write().take();
        self.state.stop_events();
        debug!(device = %self.name, "counter released");
    }

    fn attributes(&self) -> Vec<AttrInfo> {
        vec![
            AttrInfo::read_only(STATE_ATTR, WireType::State),
            AttrInfo::read_only(STATUS_ATTR, WireType::String),
            AttrInfo::read_only(VALUE, WireType::Double),
        ]
    }

    fn read_attribute(&self, name: &str) -> Result<WireValue, BridgeError> {
        if let Some(value) = self.state.read(name) {
            return Ok(value);
        }
        match name {
            "Value" => Ok(WireValue::Double(self.proxy()?.value()?)),
            other => Err(BridgeError::not_found("attribute", other)),
        }
    }

    fn write_attribute(&self, name: &str, _value: WireValue) -> Result<(), BridgeError> {
        if self.attributes().iter().any(|a| a.name == name) {
            return Err(BridgeError::InvalidValue(format!("attribute {name} is read-only")));
        }
        Err(BridgeError::not_found("attribute", name))
    }

    fn commands(&self) -> Vec<&'static str> {
        vec!["Count", "Stop", "SetEnabled"]
    }

    fn command(&self, name: &str, arg: WireValue) -> Result<WireValue, BridgeError> {
        match name {
            "Count" => self.proxy()?.count(arg.as_f64()?)?,
            "Stop" => self.proxy()?.stop()?,
            "SetEnabled" => self.proxy()?.set_enabled(arg.as_bool()?)?,
            other => return Err(BridgeError::not_found("command", other)),
        }
        Ok(WireValue::Void)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tangospec_middleware::LocalServer;
    use tangospec_session::{SimConnector, SimSession};
    use tangospec_store::{MemoryPropertyStore, PropertyStore};
    use tangospec_types::ChangeEvent;

    const DEV: &str = "id00/fourc_counter/sec";

    fn fixture() -> (Arc<LocalServer>, Arc<SimSession>) {
        let sim = SimSession::builder("localhost:fourc")
            .with_counter("sec", CounterType::Timer)
            .build()
            .unwrap();
        let store = Arc::new(MemoryPropertyStore::new());
        store
            .put_property(DEV, COUNTER_PROPERTY, &["localhost:fourc:sec".to_string()])
            .unwrap();
        let server = LocalServer::new(store);
        let connector: Arc<dyn SessionConnector> =
            Arc::new(SimConnector::new().with_session(sim.clone()));
        server.register_class(COUNTER_CLASS, move |ctx: DeviceContext| -> Arc<dyn Device> {
            CounterDevice::new(ctx, connector.clone())
        });
        server.create_device(COUNTER_CLASS, DEV, None).unwrap();
        (server, sim)
    }

    fn wait_for_on(server: &LocalServer) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.read_attribute(DEV, "State").unwrap() != WireValue::State(DevState::On) {
            assert!(Instant::now() < deadline, "counter never turned on");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    async fn next(sub: &mut tangospec_middleware::DeviceSubscriber) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn status_names_the_counter_type() {
        let (server, _sim) = fixture();
        wait_for_on(&server);
        assert_eq!(
            server.read_attribute(DEV, "Status").unwrap(),
            WireValue::String("Counter is now ON (Timer)".into())
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn counting_ends_on_a_valid_settled_value() {
        let (server, _sim) = fixture();
        wait_for_on(&server);
        let mut sub = server.bus().subscribe_device(DEV, Some(VALUE));

        server.command(DEV, "Count", WireValue::Double(2.0)).unwrap();

        // Entering Running re-reads the value with Changing quality.
        let first = next(&mut sub).await;
        assert_eq!(first.quality, AttrQuality::Changing);

        let mut last = first;
        while last.quality == AttrQuality::Changing {
            last = next(&mut sub).await;
        }
        assert_eq!(last.value, WireValue::Double(2.0));
        assert_eq!(server.read_attribute(DEV, "Value").unwrap(), WireValue::Double(2.0));
        server.shutdown();
    }

    #[tokio::test]
    async fn session_state_reports_drive_the_device_state() {
        let (server, sim) = fixture();
        wait_for_on(&server);
        let mut sub = server.bus().subscribe_device(DEV, Some(STATE_ATTR));
        let counter = sim.sim_counter("sec").unwrap();

        counter.fire_state(CounterState::Counting);
        while next(&mut sub).await.value != WireValue::State(DevState::Running) {}
        counter.fire_state(CounterState::NotCounting);
        assert_eq!(next(&mut sub).await.value, WireValue::State(DevState::On));
        assert_eq!(
            server.read_attribute(DEV, "Status").unwrap(),
            WireValue::String("Counter is now ON (Timer)".into())
        );
        server.shutdown();
    }

    #[test]
    fn set_enabled_reaches_the_session() {
        let (server, sim) = fixture();
        wait_for_on(&server);
        server
            .command(DEV, "SetEnabled", WireValue::Boolean(false))
            .unwrap();
        assert!(!sim.sim_counter("sec").unwrap().is_enabled());
        assert!(matches!(
            server.command(DEV, "SetEnabled", WireValue::Double(1.0)),
            Err(BridgeError::InvalidValue(_))
        ));
        assert!(matches!(
            server.write_attribute(DEV, "Value", WireValue::Double(1.0)),
            Err(BridgeError::InvalidValue(_))
        ));
        server.shutdown();
    }

    #[test]
    fn unknown_counter_faults() {
        let (server, _sim) = fixture();
        wait_for_on(&server);
        server
            .properties()
            .put_property(DEV, COUNTER_PROPERTY, &["localhost:fourc:nope".to_string()])
            .unwrap();
        server.reinit(DEV).unwrap();
        assert_eq!(
            server.read_attribute(DEV, "Status").unwrap(),
            WireValue::String("Error creating Spec counter nope".into())
        );
        server.shutdown();
    }
}
