//! [`SpecDevice`] – the `Spec` device class.
//!
//! One `Spec` device fronts one session.  It streams the session console
//! into `Output`, runs free-form commands, exposes session variables as
//! dynamic attributes and mirrors session motors and counters as
//! `SpecMotor`/`SpecCounter` child devices.
//!
//! # Properties
//!
//! | Property | Default | Meaning |
//! |---|---|---|
//! | `Spec` | `localhost:spec` | Session address, `host:session`. |
//! | `AutoDiscovery` | `false` | Run `Reconstruct` at the end of init. |
//! | `OutputBufferMaxLength` | `1000` | Entries kept in `Output`. |
//! | `HistoryMaxLength` | `100` | Entries kept in `History`. |
//! | `Motors` / `Counters` | – | `"<mnemonic> <device> <alias>"` per child, sorted. |
//! | `Variables` | – | `"<attr> <mnemonic> <type>"` per variable, sorted. |
//!
//! # Init
//!
//! ```text
//! Init "Initializing spec <addr>"
//!   ├─ bad address ─────────► Fault "Invalid spec '<addr>'. Must be in format <host>:<spec session>"
//!   ├─ connect / tty fails ─► Fault "Error connecting to Spec <addr> output"
//!   └─ On "Connected to spec <addr>"
//!        ├─ restore Variables (a failing one appends to the status, state Fault)
//!        ├─ restore Motors / Counters children
//!        └─ AutoDiscovery ─► Reconstruct
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tangospec_bridge::{
    CommandRegistry, InventoryTarget, OutputLineAssembler, VariableBindingTable, VariableSpec,
    reconcile,
};
use tangospec_middleware::{
    AttrInfo, Device, DeviceContext, DeviceServer, OnCreated, split_device_name,
};
use tangospec_session::{
    CONNECT_TIMEOUT, ElementAddress, OutputChunk, Session, SessionAddress, SessionConnector,
    Subscription,
};
use tangospec_store::PropertyStore;
use tangospec_types::{AttrQuality, BridgeError, DevState, ElementKind, WireType, WireValue};
use tracing::{debug, error, info, warn};

use crate::counter::COUNTER_PROPERTY;
use crate::motor::MOTOR_PROPERTY;
use crate::state::{STATE_ATTR, STATUS_ATTR, StateSwitch};
use crate::{COUNTER_CLASS, DEFAULT_SPEC, MOTOR_CLASS, SPEC_CLASS, SPEC_PROPERTY};

pub const OUTPUT_ATTR: &str = "Output";
pub const HISTORY_ATTR: &str = "History";
pub const MOTOR_LIST_ATTR: &str = "MotorList";
pub const COUNTER_LIST_ATTR: &str = "CounterList";
pub const VARIABLE_LIST_ATTR: &str = "VariableList";
pub const SPEC_MOTOR_LIST_ATTR: &str = "SpecMotorList";
pub const SPEC_COUNTER_LIST_ATTR: &str = "SpecCounterList";

const EVENT_ATTRS: [&str; 6] = [
    STATE_ATTR,
    STATUS_ATTR,
    OUTPUT_ATTR,
    MOTOR_LIST_ATTR,
    COUNTER_LIST_ATTR,
    VARIABLE_LIST_ATTR,
];

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// The `Spec` device properties.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecConfig {
    pub spec: String,
    pub auto_discovery: bool,
    pub output_buffer_max_length: usize,
    pub history_max_length: usize,
    pub motors: Vec<String>,
    pub counters: Vec<String>,
    pub variables: Vec<String>,
}

impl Default for SpecConfig {
    fn default() -> Self {
        Self {
            spec: DEFAULT_SPEC.to_string(),
            auto_discovery: false,
            output_buffer_max_length: 1000,
            history_max_length: 100,
            motors: Vec::new(),
            counters: Vec::new(),
            variables: Vec::new(),
        }
    }
}

impl SpecConfig {
    /// Read the properties of `device`; unset ones keep their default.
    pub fn load(store: &dyn PropertyStore, device: &str) -> Result<Self, BridgeError> {
        let props = store.device_properties(device)?;
        let get = |name: &str| -> Option<&Vec<String>> {
            props
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        };
        let scalar = |name: &str| get(name).and_then(|v| v.first()).map(|s| s.trim());

        let mut config = Self::default();
        if let Some(spec) = scalar(SPEC_PROPERTY).filter(|s| !s.is_empty()) {
            config.spec = spec.to_string();
        }
        if let Some(v) = scalar("AutoDiscovery") {
            config.auto_discovery = parse_bool("AutoDiscovery", v)?;
        }
        if let Some(v) = scalar("OutputBufferMaxLength") {
            config.output_buffer_max_length = parse_len("OutputBufferMaxLength", v)?;
        }
        if let Some(v) = scalar("HistoryMaxLength") {
            config.history_max_length = parse_len("HistoryMaxLength", v)?;
        }
        config.motors = get(MOTORS.persisted).cloned().unwrap_or_default();
        config.counters = get(COUNTERS.persisted).cloned().unwrap_or_default();
        config.variables = get("Variables").cloned().unwrap_or_default();
        Ok(config)
    }

    /// Write every property of `device`.
    pub fn save(&self, store: &dyn PropertyStore, device: &str) -> Result<(), BridgeError> {
        store.put_property(device, SPEC_PROPERTY, &[self.spec.clone()])?;
        store.put_property(device, "AutoDiscovery", &[self.auto_discovery.to_string()])?;
        store.put_property(
            device,
            "OutputBufferMaxLength",
            &[self.output_buffer_max_length.to_string()],
        )?;
        store.put_property(device, "HistoryMaxLength", &[self.history_max_length.to_string()])?;
        store.put_property(device, MOTORS.persisted, &self.motors)?;
        store.put_property(device, COUNTERS.persisted, &self.counters)?;
        store.put_property(device, "Variables", &self.variables)?;
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, BridgeError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(BridgeError::InvalidValue(format!("{name}: '{value}' is not a boolean"))),
    }
}

fn parse_len(name: &str, value: &str) -> Result<usize, BridgeError> {
    value
        .parse()
        .map_err(|_| BridgeError::InvalidValue(format!("{name}: '{value}' is not a length")))
}

/// One persisted child: `"<mnemonic> <device> <alias>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub mnemonic: String,
    pub device: String,
    pub alias: String,
}

impl ChildEntry {
    /// The alias defaults to the mnemonic when omitted.
    pub fn parse(s: &str) -> Result<Self, BridgeError> {
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            [mnemonic, device] => Ok(Self {
                mnemonic: mnemonic.to_string(),
                device: device.to_string(),
                alias: mnemonic.to_string(),
            }),
            [mnemonic, device, alias] => Ok(Self {
                mnemonic: mnemonic.to_string(),
                device: device.to_string(),
                alias: alias.to_string(),
            }),
            _ => Err(BridgeError::InvalidValue(format!(
                "'{s}' is not '<mnemonic> <device> [<alias>]'"
            ))),
        }
    }
}

impl fmt::Display for ChildEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.mnemonic, self.device, self.alias)
    }
}

/// Per-kind wiring of the child device classes.
struct ChildClass {
    kind: ElementKind,
    class: &'static str,
    property: &'static str,
    list_attr: &'static str,
    persisted: &'static str,
}

const MOTORS: ChildClass = ChildClass {
    kind: ElementKind::Motor,
    class: MOTOR_CLASS,
    property: MOTOR_PROPERTY,
    list_attr: MOTOR_LIST_ATTR,
    persisted: "Motors",
};

const COUNTERS: ChildClass = ChildClass {
    kind: ElementKind::Counter,
    class: COUNTER_CLASS,
    property: COUNTER_PROPERTY,
    list_attr: COUNTER_LIST_ATTR,
    persisted: "Counters",
};

fn child_class(kind: ElementKind) -> Result<&'static ChildClass, BridgeError> {
    match kind {
        ElementKind::Motor => Ok(&MOTORS),
        ElementKind::Counter => Ok(&COUNTERS),
        other => Err(BridgeError::InvalidValue(format!("{other} elements have no device class"))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SpecDevice
// ─────────────────────────────────────────────────────────────────────────────

/// Everything that only exists while the session is connected.
struct SessionLink {
    session: Arc<dyn Session>,
    commands: CommandRegistry,
    variables: VariableBindingTable,
    _tty: Subscription,
}

pub struct SpecDevice {
    name: String,
    server: Arc<dyn DeviceServer>,
    connector: Arc<dyn SessionConnector>,
    state: Arc<StateSwitch>,
    config: RwLock<SpecConfig>,
    output: Arc<Mutex<OutputLineAssembler>>,
    link: RwLock<Option<Arc<SessionLink>>>,
}

impl SpecDevice {
    pub fn new(ctx: DeviceContext, connector: Arc<dyn SessionConnector>) -> Arc<Self> {
        let config = SpecConfig::default();
        Arc::new(Self {
            state: Arc::new(StateSwitch::new(&ctx.name, ctx.server.clone())),
            output: Arc::new(Mutex::new(OutputLineAssembler::new(
                config.output_buffer_max_length,
            ))),
            config: RwLock::new(config),
            name: ctx.name,
            server: ctx.server,
            connector,
            link: RwLock::new(None),
        })
    }

    pub fn config(&self) -> SpecConfig {
        self.config.read().clone()
    }

    pub fn state(&self) -> DevState {
        self.state.state()
    }

    pub fn status(&self) -> String {
        self.state.status()
    }

    fn link(&self) -> Result<Arc<SessionLink>, BridgeError> {
        self.link
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotConnected(self.name.clone()))
    }

    // ── init ────────────────────────────────────────────────────────────────

    fn connect(&self, config: &SpecConfig) -> Result<SessionLink, String> {
        let address = SessionAddress::parse(&config.spec).map_err(|e| {
            error!(device = %self.name, spec = %config.spec, "Error parsing SPEC name");
            e.to_string()
        })?;
        debug!(device = %self.name, host = address.host(), session = address.session(), "using spec");

        let connect_failed = |e: BridgeError| {
            error!(device = %self.name, error = %e, "Error connecting to SPEC");
            format!("Error connecting to Spec {} output", config.spec)
        };
        let session = self
            .connector
            .connect(&address, CONNECT_TIMEOUT)
            .map_err(connect_failed)?;

        let output = self.output.clone();
        let state = self.state.clone();
        let tty = session
            .tty()
            .and_then(|tty| {
                tty.subscribe(Box::new(move |chunk: OutputChunk| {
                    let output = output.clone();
                    let events = state.clone();
                    state.submit(move || {
                        let appended = output.lock().push(chunk);
                        if let Some(text) = appended {
                            events.push(OUTPUT_ATTR, WireValue::String(text), AttrQuality::Valid);
                        }
                        Ok(())
                    });
                }))
            })
            .map_err(connect_failed)?;

        let submitter = self
            .state
            .submitter()
            .ok_or_else(|| "Event dispatcher is not running".to_string())?;
        Ok(SessionLink {
            commands: CommandRegistry::new(session.clone(), config.history_max_length),
            variables: VariableBindingTable::new(
                &self.name,
                self.server.clone(),
                session.clone(),
                submitter,
            ),
            session,
            _tty: tty,
        })
    }

    fn restore_variables(&self, link: &SessionLink, entries: &[String]) {
        for entry in entries {
            if let Err(e) = VariableSpec::parse(entry).and_then(|spec| link.variables.add(spec)) {
                error!(device = %self.name, variable = %entry, error = %e, "Error creating variable");
                self.state.append_status(
                    DevState::Fault,
                    &format!("Error adding variable '{entry}': {e}"),
                );
            }
        }
    }

    fn restore_children(&self, class: &ChildClass, session: &SessionAddress, entries: &[String]) {
        let existing = self.server.devices_of_class(class.class);
        for entry in entries {
            let child = match ChildEntry::parse(entry) {
                Ok(child) => child,
                Err(e) => {
                    warn!(device = %self.name, entry = %entry, error = %e, "skipping persisted child");
                    continue;
                }
            };
            if existing.iter().any(|d| d.eq_ignore_ascii_case(&child.device)) {
                continue;
            }
            if let Err(e) = self.create_child(class, session, &child) {
                warn!(device = %self.name, child = %child.device, error = %e, "cannot restore child");
            }
        }
    }

    // ── commands ────────────────────────────────────────────────────────────

    /// Connection-level failures fault the device; others only fail the call.
    fn command_failed(&self, e: BridgeError) -> BridgeError {
        if matches!(e, BridgeError::Connection { .. } | BridgeError::NotConnected(_)) {
            let status = format!("Spec {} error: {e}", self.config.read().spec);
            self.state.switch(DevState::Fault, &status);
        }
        e
    }

    fn execute(&self, text: &str) -> Result<String, BridgeError> {
        self.link()?
            .commands
            .execute(text)
            .map_err(|e| self.command_failed(e))
    }

    fn execute_async(&self, text: &str) -> Result<u64, BridgeError> {
        self.link()?
            .commands
            .execute_async(text)
            .map_err(|e| self.command_failed(e))
    }

    fn add_variable(&self, text: &str) -> Result<(), BridgeError> {
        info!(device = %self.name, variable = text, "Adding new variable");
        let link = self.link()?;
        let spec = VariableSpec::parse(text)?;
        let attr = spec.attr.clone();
        match link.variables.add(spec) {
            Ok(()) => {}
            Err(e @ BridgeError::DuplicateBinding(_)) => return Err(e),
            Err(e) => {
                self.state
                    .switch(DevState::Fault, &format!("Error adding variable '{attr}': {e}"));
                return Err(e);
            }
        }
        self.variables_changed(&link)
    }

    fn remove_variable(&self, attr: &str) -> Result<(), BridgeError> {
        info!(device = %self.name, variable = attr, "Removing variable");
        let link = self.link()?;
        link.variables.remove(attr)?;
        self.variables_changed(&link)
    }

    fn variables_changed(&self, link: &SessionLink) -> Result<(), BridgeError> {
        let persisted = link.variables.persisted();
        self.server
            .properties()
            .put_property(&self.name, "Variables", &persisted)?;
        self.config.write().variables = persisted;
        self.state.push(
            VARIABLE_LIST_ATTR,
            WireValue::StringArray(link.variables.names()),
            AttrQuality::Valid,
        );
        Ok(())
    }

    // ── children ────────────────────────────────────────────────────────────

    /// `(mnemonic, device)` of every child mirroring this device's session.
    fn mirrored(&self, class: &ChildClass) -> Vec<(String, String)> {
        let own = SessionAddress::parse(&self.config.read().spec).ok();
        let mut children = Vec::new();
        for device in self.server.devices_of_class(class.class) {
            let property = match crate::first_value(self.server.as_ref(), &device, class.property) {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(e) => {
                    warn!(device = %device, error = %e, "cannot read child property");
                    continue;
                }
            };
            match ElementAddress::resolve(&property, own.as_ref()) {
                Ok(address) if own.as_ref().is_none_or(|own| *own == address.session) => {
                    children.push((address.mnemonic, device));
                }
                Ok(_) => {}
                Err(e) => debug!(device = %device, error = %e, "child address unresolved"),
            }
        }
        children
    }

    fn child_list(&self, class: &ChildClass) -> Vec<String> {
        self.mirrored(class)
            .into_iter()
            .map(|(mnemonic, device)| format!("{mnemonic} {device}"))
            .collect()
    }

    /// `<domain>/<family>_<kind>/<mnemonic>` from this device's own name.
    fn default_child_name(&self, kind: ElementKind, mnemonic: &str) -> Result<String, BridgeError> {
        let (domain, family, _) = split_device_name(&self.name)?;
        Ok(format!("{domain}/{family}_{kind}/{mnemonic}"))
    }

    fn create_child(
        &self,
        class: &ChildClass,
        session: &SessionAddress,
        child: &ChildEntry,
    ) -> Result<(), BridgeError> {
        let store = self.server.properties();
        let property = class.property;
        let address = format!("{session}:{}", child.mnemonic);
        let alias = child.alias.clone();
        let on_created: OnCreated = Box::new(move |name: &str| {
            store.put_property(name, property, &[address])?;
            match store.get_alias(&alias) {
                Ok(Some(owner)) if !owner.eq_ignore_ascii_case(name) => warn!(
                    alias = %alias,
                    device = %owner,
                    "alias already associated with another device, alias will NOT be created"
                ),
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = store.put_alias(name, &alias) {
                        warn!(alias = %alias, error = %e, "cannot create alias");
                    }
                }
                Err(e) => warn!(alias = %alias, error = %e, "cannot look up alias"),
            }
            Ok(())
        });
        self.server
            .create_device(class.class, &child.device, Some(on_created))
    }

    /// `args` is `mnemonic [, device name [, alias]]`.
    fn add_child(&self, kind: ElementKind, args: Vec<String>) -> Result<(), BridgeError> {
        let class = child_class(kind)?;
        info!(device = %self.name, kind = %kind, args = ?args, "Adding new child");
        let (mnemonic, device, alias) = match args.as_slice() {
            [m] => (m.clone(), None, None),
            [m, d] => (m.clone(), Some(d.clone()), None),
            [m, d, a] => (m.clone(), Some(d.clone()), Some(a.clone())),
            _ => {
                return Err(BridgeError::InvalidValue(format!(
                    "expected {kind} name [, device name [, alias]], got {args:?}"
                )));
            }
        };
        let link = self.link()?;
        let inventory = match kind {
            ElementKind::Motor => link.session.motor_mnemonics()?,
            _ => link.session.counter_mnemonics()?,
        };
        if !inventory.contains(&mnemonic) {
            return Err(BridgeError::not_found(kind.as_str(), mnemonic));
        }
        if self.mirrored(class).iter().any(|(m, _)| *m == mnemonic) {
            return Err(BridgeError::DuplicateBinding(mnemonic));
        }

        let child = ChildEntry {
            device: match device {
                Some(d) => d,
                None => self.default_child_name(kind, &mnemonic)?,
            },
            alias: alias.unwrap_or_else(|| mnemonic.clone()),
            mnemonic,
        };
        self.create_child(class, link.session.address(), &child)?;
        self.persist_children(class, |entries| {
            entries.retain(|e| e.mnemonic != child.mnemonic);
            entries.push(child.clone());
        })?;
        self.push_child_list(class);
        Ok(())
    }

    fn remove_child(&self, kind: ElementKind, mnemonic: &str) -> Result<(), BridgeError> {
        let class = child_class(kind)?;
        info!(device = %self.name, kind = %kind, mnemonic, "Removing child");
        let device = self
            .mirrored(class)
            .into_iter()
            .find(|(m, _)| m == mnemonic)
            .map(|(_, d)| d)
            .ok_or_else(|| BridgeError::not_found(kind.as_str(), mnemonic))?;
        self.server.delete_device(class.class, &device)?;
        self.persist_children(class, |entries| entries.retain(|e| e.mnemonic != mnemonic))?;
        self.push_child_list(class);
        Ok(())
    }

    /// Rewrite the persisted child list of `class`, sorted.
    fn persist_children(
        &self,
        class: &ChildClass,
        update: impl FnOnce(&mut Vec<ChildEntry>),
    ) -> Result<(), BridgeError> {
        let store = self.server.properties();
        let mut entries: Vec<ChildEntry> = store
            .get_property(&self.name, class.persisted)?
            .unwrap_or_default()
            .iter()
            .filter_map(|s| ChildEntry::parse(s).ok())
            .collect();
        update(&mut entries);
        let mut persisted: Vec<String> = entries.iter().map(ChildEntry::to_string).collect();
        persisted.sort();
        persisted.dedup();
        store.put_property(&self.name, class.persisted, &persisted)?;
        let mut config = self.config.write();
        match class.kind {
            ElementKind::Motor => config.motors = persisted,
            _ => config.counters = persisted,
        }
        Ok(())
    }

    fn push_child_list(&self, class: &ChildClass) {
        self.state.push(
            class.list_attr,
            WireValue::StringArray(self.child_list(class)),
            AttrQuality::Valid,
        );
    }

    fn reconstruct(&self) -> Result<(), BridgeError> {
        info!(device = %self.name, "Reconstructing...");
        let report = reconcile(self)?;
        for (kind, mnemonic, e) in &report.failures {
            warn!(device = %self.name, kind = %kind, mnemonic = %mnemonic, error = %e, "reconstruct step failed");
        }
        Ok(())
    }
}

fn command_id(arg: &WireValue) -> Result<u64, BridgeError> {
    let id = arg.as_i64()?;
    u64::try_from(id).map_err(|_| BridgeError::InvalidValue(format!("invalid command id {id}")))
}

impl InventoryTarget for SpecDevice {
    fn session_inventory(&self, kind: ElementKind) -> Result<BTreeSet<String>, BridgeError> {
        let class = child_class(kind)?;
        let session = self.link()?.session.clone();
        let mnemonics = match class.kind {
            ElementKind::Motor => session.motor_mnemonics()?,
            _ => session.counter_mnemonics()?,
        };
        Ok(mnemonics.into_iter().collect())
    }

    fn mirrored_inventory(&self, kind: ElementKind) -> Result<BTreeSet<String>, BridgeError> {
        let class = child_class(kind)?;
        Ok(self.mirrored(class).into_iter().map(|(m, _)| m).collect())
    }

    fn create(&self, kind: ElementKind, mnemonic: &str) -> Result<(), BridgeError> {
        self.add_child(kind, vec![mnemonic.to_string()])
    }

    fn delete(&self, kind: ElementKind, mnemonic: &str) -> Result<(), BridgeError> {
        self.remove_child(kind, mnemonic)
    }
}

impl Device for SpecDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> &str {
        SPEC_CLASS
    }

    fn init(&self) {
        if let Err(e) = self.state.start_events() {
            warn!(device = %self.name, error = %e, "cannot start event dispatcher");
        }
        for attr in EVENT_ATTRS {
            self.server.set_change_event(&self.name, attr, true);
        }

        let config = match SpecConfig::load(self.server.properties().as_ref(), &self.name) {
            Ok(config) => config,
            Err(e) => {
                self.state
                    .switch(DevState::Fault, &format!("Error reading properties: {e}"));
                return;
            }
        };
        *self.config.write() = config.clone();
        {
            let mut output = self.output.lock();
            output.clear();
            output.set_max_len(config.output_buffer_max_length);
        }

        self.state
            .switch(DevState::Init, &format!("Initializing spec {}", config.spec));
        let link = match self.connect(&config) {
            Ok(link) => Arc::new(link),
            Err(status) => {
                self.state.switch(DevState::Fault, &status);
                return;
            }
        };
        *self.link.write() = Some(link.clone());
        self.state
            .switch(DevState::On, &format!("Connected to spec {}", config.spec));

        self.restore_variables(&link, &config.variables);
        let session = link.session.address().clone();
        for (class, entries) in [(&MOTORS, &config.motors), (&COUNTERS, &config.counters)] {
            self.restore_children(class, &session, entries);
            self.push_child_list(class);
        }

        if config.auto_discovery {
            if let Err(e) = self.reconstruct() {
                warn!(device = %self.name, error = %e, "auto discovery failed");
            }
        }
        info!(device = %self.name, spec = %config.spec, "spec device ready");
    }

    fn delete(&self) {
        let link = self.link.write().take();
        if let Some(link) = link {
            link.commands.abort_all();
        }
        self.state.stop_events();
        debug!(device = %self.name, "spec device released");
    }

    fn attributes(&self) -> Vec<AttrInfo> {
        vec![
            AttrInfo::read_only(STATE_ATTR, WireType::State),
            AttrInfo::read_only(STATUS_ATTR, WireType::String),
            AttrInfo::read_only(SPEC_MOTOR_LIST_ATTR, WireType::StringArray),
            AttrInfo::read_only(SPEC_COUNTER_LIST_ATTR, WireType::StringArray),
            AttrInfo::read_only(MOTOR_LIST_ATTR, WireType::StringArray),
            AttrInfo::read_only(COUNTER_LIST_ATTR, WireType::StringArray),
            AttrInfo::read_only(VARIABLE_LIST_ATTR, WireType::StringArray),
            AttrInfo::read_only(OUTPUT_ATTR, WireType::String),
            AttrInfo::read_only(HISTORY_ATTR, WireType::StringArray),
        ]
    }

    fn read_attribute(&self, name: &str) -> Result<WireValue, BridgeError> {
        if let Some(value) = self.state.read(name) {
            return Ok(value);
        }
        let value = match name {
            SPEC_MOTOR_LIST_ATTR => WireValue::StringArray(self.link()?.session.motor_mnemonics()?),
            SPEC_COUNTER_LIST_ATTR => {
                WireValue::StringArray(self.link()?.session.counter_mnemonics()?)
            }
            MOTOR_LIST_ATTR => WireValue::StringArray(self.child_list(&MOTORS)),
            COUNTER_LIST_ATTR => WireValue::StringArray(self.child_list(&COUNTERS)),
            VARIABLE_LIST_ATTR => WireValue::StringArray(
                self.link().map(|l| l.variables.names()).unwrap_or_default(),
            ),
            OUTPUT_ATTR => WireValue::String(self.output.lock().contents()),
            HISTORY_ATTR => {
                WireValue::StringArray(self.link().map(|l| l.commands.history()).unwrap_or_default())
            }
            other => return Err(BridgeError::not_found("attribute", other)),
        };
        Ok(value)
    }

    fn write_attribute(&self, name: &str, _value: WireValue) -> Result<(), BridgeError> {
        if self.attributes().iter().any(|a| a.name == name) {
            return Err(BridgeError::InvalidValue(format!("attribute {name} is read-only")));
        }
        Err(BridgeError::not_found("attribute", name))
    }

    fn commands(&self) -> Vec<&'static str> {
        vec![
            "ExecuteCmd",
            "ExecuteCmdA",
            "GetReply",
            "IsReplyArrived",
            "AbortCmd",
            "AddVariable",
            "RemoveVariable",
            "AddMotor",
            "RemoveMotor",
            "AddCounter",
            "RemoveCounter",
            "Reconstruct",
        ]
    }

    fn command(&self, name: &str, arg: WireValue) -> Result<WireValue, BridgeError> {
        match name {
            "ExecuteCmd" => Ok(WireValue::String(self.execute(arg.as_str()?)?)),
            "ExecuteCmdA" => {
                let id = self.execute_async(arg.as_str()?)?;
                i64::try_from(id)
                    .map(WireValue::Long)
                    .map_err(|_| BridgeError::Framework(format!("command id {id} overflows")))
            }
            "GetReply" => Ok(WireValue::String(
                self.link()?.commands.get_reply(command_id(&arg)?)?,
            )),
            "IsReplyArrived" => {
                let id = command_id(&arg)?;
                Ok(WireValue::Boolean(
                    self.link().map(|l| l.commands.is_done(id)).unwrap_or(true),
                ))
            }
            "AbortCmd" => {
                let id = command_id(&arg)?;
                self.link()?.commands.abort(id)?;
                Ok(WireValue::Void)
            }
            "AddVariable" => self.add_variable(arg.as_str()?).map(|_| WireValue::Void),
            "RemoveVariable" => self.remove_variable(arg.as_str()?).map(|_| WireValue::Void),
            "AddMotor" => self
                .add_child(ElementKind::Motor, arg.into_strings()?)
                .map(|_| WireValue::Void),
            "RemoveMotor" => self
                .remove_child(ElementKind::Motor, arg.as_str()?)
                .map(|_| WireValue::Void),
            "AddCounter" => self
                .add_child(ElementKind::Counter, arg.into_strings()?)
                .map(|_| WireValue::Void),
            "RemoveCounter" => self
                .remove_child(ElementKind::Counter, arg.as_str()?)
                .map(|_| WireValue::Void),
            "Reconstruct" => self.reconstruct().map(|_| WireValue::Void),
            other => Err(BridgeError::not_found("command", other)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
