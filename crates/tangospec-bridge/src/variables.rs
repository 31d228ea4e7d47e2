//! [`VariableBindingTable`] – session variables as dynamic attributes.
//!
//! Each binding ties one attribute of the owning device to one session
//! variable.  The binding's [`TypeTag`] picks its [`Codec`]:
//!
//! | Tag | Attribute type | Codec |
//! |---|---|---|
//! | `json` | string | [`Codec::Json`]: values travel as JSON text |
//! | `bool`, `long`, `double`, `string` | matching scalar | [`Codec::Passthrough`] |
//! | `bool[]`, `long[]`, `double[]`, `string[]` | matching sequence | [`Codec::Passthrough`] |
//! | anything else | string | [`Codec::StringCoercion`] |
//!
//! Sequence-typed bindings never emit change events.  All other bindings
//! forward the variable's `update` callback, through the device's
//! [`Submitter`], as a change event on the attribute.
//!
//! # Persisted form
//!
//! One string per binding, `"<attr> <mnemonic> <type>"`, sorted by attribute
//! name.  [`VariableSpec::parse`] also accepts the short forms `"<attr>"`
//! and `"<attr> <mnemonic>"` (type `json`).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tangospec_middleware::{AttrInfo, DeviceServer, DynamicAttribute, Submitter};
use tangospec_session::{Session, Subscription, UpdateCallback, VariableProxy};
use tangospec_types::{
    AttrAccess, AttrQuality, BridgeError, ElementKind, SessionElementHandle, WireType, WireValue,
};
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Type tags and codecs
// ─────────────────────────────────────────────────────────────────────────────

/// Declared type of a bound variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeTag {
    Json,
    Boolean,
    Long,
    Double,
    String,
    BooleanArray,
    LongArray,
    DoubleArray,
    StringArray,
    /// Unrecognised tag, kept verbatim for persistence.
    Other(String),
}

impl TypeTag {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "json" => TypeTag::Json,
            "bool" | "boolean" => TypeTag::Boolean,
            "long" | "int" => TypeTag::Long,
            "double" | "float" => TypeTag::Double,
            "string" | "str" => TypeTag::String,
            "bool[]" | "boolean[]" => TypeTag::BooleanArray,
            "long[]" | "int[]" => TypeTag::LongArray,
            "double[]" | "float[]" => TypeTag::DoubleArray,
            "string[]" | "str[]" => TypeTag::StringArray,
            _ => TypeTag::Other(s.to_string()),
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            TypeTag::Json => Codec::Json,
            TypeTag::Other(_) => Codec::StringCoercion,
            TypeTag::Boolean => Codec::Passthrough(WireType::Boolean),
            TypeTag::Long => Codec::Passthrough(WireType::Long),
            TypeTag::Double => Codec::Passthrough(WireType::Double),
            TypeTag::String => Codec::Passthrough(WireType::String),
            TypeTag::BooleanArray => Codec::Passthrough(WireType::BooleanArray),
            TypeTag::LongArray => Codec::Passthrough(WireType::LongArray),
            TypeTag::DoubleArray => Codec::Passthrough(WireType::DoubleArray),
            TypeTag::StringArray => Codec::Passthrough(WireType::StringArray),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeTag::Json => "json",
            TypeTag::Boolean => "bool",
            TypeTag::Long => "long",
            TypeTag::Double => "double",
            TypeTag::String => "string",
            TypeTag::BooleanArray => "bool[]",
            TypeTag::LongArray => "long[]",
            TypeTag::DoubleArray => "double[]",
            TypeTag::StringArray => "string[]",
            TypeTag::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// Conversion between session values and wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    Passthrough(WireType),
    StringCoercion,
}

impl Codec {
    pub fn wire_type(&self) -> WireType {
        match self {
            Codec::Json | Codec::StringCoercion => WireType::String,
            Codec::Passthrough(t) => *t,
        }
    }

    /// Whether attributes using this codec may emit change events.
    pub fn supports_events(&self) -> bool {
        !self.wire_type().is_sequence()
    }

    /// Session value → wire value (attribute read, change event).
    pub fn encode(&self, value: &Value) -> Result<WireValue, BridgeError> {
        match self {
            Codec::Json => serde_json::to_string(value)
                .map(WireValue::String)
                .map_err(|e| BridgeError::Codec(e.to_string())),
            Codec::StringCoercion => Ok(WireValue::String(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            Codec::Passthrough(t) => encode_passthrough(*t, value),
        }
    }

    /// Wire value → session value (attribute write).
    pub fn decode(&self, wire: WireValue) -> Result<Value, BridgeError> {
        match self {
            Codec::Json => {
                let text = wire.as_str()?;
                serde_json::from_str(text).map_err(|e| BridgeError::Codec(e.to_string()))
            }
            Codec::StringCoercion => match wire {
                WireValue::String(s) => Ok(Value::String(s)),
                other => Ok(Value::String(other.to_string())),
            },
            Codec::Passthrough(_) => decode_passthrough(wire),
        }
    }
}

fn mismatch(t: WireType, value: &Value) -> BridgeError {
    BridgeError::Codec(format!("cannot represent {value} as {t:?}"))
}

fn items<T>(
    t: WireType,
    value: &Value,
    f: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<T>, BridgeError> {
    value
        .as_array()
        .ok_or_else(|| mismatch(t, value))?
        .iter()
        .map(|v| f(v).ok_or_else(|| mismatch(t, value)))
        .collect()
}

fn encode_passthrough(t: WireType, value: &Value) -> Result<WireValue, BridgeError> {
    let err = || mismatch(t, value);
    Ok(match t {
        WireType::Boolean => WireValue::Boolean(value.as_bool().ok_or_else(err)?),
        WireType::Long => WireValue::Long(value.as_i64().ok_or_else(err)?),
        WireType::Double => WireValue::Double(value.as_f64().ok_or_else(err)?),
        WireType::String => WireValue::String(value.as_str().ok_or_else(err)?.to_string()),
        WireType::BooleanArray => WireValue::BooleanArray(items(t, value, Value::as_bool)?),
        WireType::LongArray => WireValue::LongArray(items(t, value, Value::as_i64)?),
        WireType::DoubleArray => WireValue::DoubleArray(items(t, value, Value::as_f64)?),
        WireType::StringArray => {
            WireValue::StringArray(items(t, value, |v| v.as_str().map(str::to_string))?)
        }
        WireType::State => return Err(err()),
    })
}

fn decode_passthrough(wire: WireValue) -> Result<Value, BridgeError> {
    Ok(match wire {
        WireValue::Boolean(b) => Value::from(b),
        WireValue::Long(v) => Value::from(v),
        WireValue::Double(v) => Value::from(v),
        WireValue::String(s) => Value::from(s),
        WireValue::BooleanArray(v) => Value::from(v),
        WireValue::LongArray(v) => Value::from(v),
        WireValue::DoubleArray(v) => Value::from(v),
        WireValue::StringArray(v) => Value::from(v),
        other => {
            return Err(BridgeError::Codec(format!("cannot write {other} to a variable")));
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// VariableSpec
// ─────────────────────────────────────────────────────────────────────────────

/// `"<attr> [<mnemonic> [<type>]]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    pub attr: String,
    pub mnemonic: String,
    pub type_tag: TypeTag,
}

impl VariableSpec {
    pub fn parse(s: &str) -> Result<Self, BridgeError> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        match parts.as_slice() {
            [attr] => Ok(Self::new(attr, attr, TypeTag::Json)),
            [attr, mnemonic] => Ok(Self::new(attr, mnemonic, TypeTag::Json)),
            [attr, mnemonic, tag] => Ok(Self::new(attr, mnemonic, TypeTag::parse(tag))),
            _ => Err(BridgeError::InvalidValue(format!(
                "invalid variable '{s}', expected <attr> [<mnemonic> [<type>]]"
            ))),
        }
    }

    pub fn new(attr: &str, mnemonic: &str, type_tag: TypeTag) -> Self {
        Self {
            attr: attr.to_string(),
            mnemonic: mnemonic.to_string(),
            type_tag,
        }
    }
}

impl fmt::Display for VariableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.attr, self.mnemonic, self.type_tag)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VariableBindingTable
// ─────────────────────────────────────────────────────────────────────────────

struct VariableAttr {
    proxy: Arc<dyn VariableProxy>,
    codec: Codec,
}

impl DynamicAttribute for VariableAttr {
    fn read(&self) -> Result<WireValue, BridgeError> {
        self.codec.encode(&self.proxy.value()?)
    }

    fn write(&self, value: WireValue) -> Result<(), BridgeError> {
        self.proxy.set_value(self.codec.decode(value)?)
    }
}

struct Binding {
    spec: VariableSpec,
    handle: SessionElementHandle,
    hooks: Arc<VariableAttr>,
    _subscription: Option<Subscription>,
}

/// The variables exposed by one device.
pub struct VariableBindingTable {
    device: String,
    server: Arc<dyn DeviceServer>,
    session: Arc<dyn Session>,
    submitter: Submitter,
    bindings: Mutex<BTreeMap<String, Binding>>,
}

impl VariableBindingTable {
    pub fn new(
        device: &str,
        server: Arc<dyn DeviceServer>,
        session: Arc<dyn Session>,
        submitter: Submitter,
    ) -> Self {
        Self {
            device: device.to_string(),
            server,
            session,
            submitter,
            bindings: Mutex::new(BTreeMap::new()),
        }
    }

    fn is_bound(&self, attr: &str) -> bool {
        self.bindings
            .lock()
            .keys()
            .any(|k| k.eq_ignore_ascii_case(attr))
    }

    /// Bind `spec.attr` to session variable `spec.mnemonic`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DuplicateBinding`] when the attribute is already bound.
    pub fn add(&self, spec: VariableSpec) -> Result<(), BridgeError> {
        if self.is_bound(&spec.attr) {
            return Err(BridgeError::DuplicateBinding(spec.attr));
        }
        let proxy = self.session.variable(&spec.mnemonic)?;
        let codec = spec.type_tag.codec();
        let hooks = Arc::new(VariableAttr {
            proxy: proxy.clone(),
            codec,
        });
        self.server.add_dynamic_attribute(
            &self.device,
            AttrInfo::new(spec.attr.clone(), codec.wire_type(), AttrAccess::ReadWrite),
            hooks.clone(),
        )?;

        let subscription = if codec.supports_events() {
            self.server.set_change_event(&self.device, &spec.attr, true);
            match proxy.subscribe(self.update_hook(&spec.attr, codec)) {
                Ok(sub) => Some(sub),
                Err(e) => {
                    self.rollback(&spec.attr);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let handle = SessionElementHandle::new(
            ElementKind::Variable,
            spec.mnemonic.clone(),
            self.session.address().to_string(),
        );
        let mut bindings = self.bindings.lock();
        if bindings.keys().any(|k| k.eq_ignore_ascii_case(&spec.attr)) {
            drop(bindings);
            self.rollback(&spec.attr);
            return Err(BridgeError::DuplicateBinding(spec.attr));
        }
        info!(device = %self.device, attr = %spec.attr, source = %handle, tag = %spec.type_tag, "variable bound");
        bindings.insert(
            spec.attr.clone(),
            Binding {
                spec,
                handle,
                hooks,
                _subscription: subscription,
            },
        );
        Ok(())
    }

    /// Unbind `attr`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotFound`] when the attribute is not bound.
    pub fn remove(&self, attr: &str) -> Result<(), BridgeError> {
        let removed = {
            let mut bindings = self.bindings.lock();
            let key = bindings
                .keys()
                .find(|k| k.eq_ignore_ascii_case(attr))
                .cloned()
                .ok_or_else(|| BridgeError::not_found("variable", attr))?;
            bindings.remove(&key)
        };
        if let Some(binding) = removed {
            self.rollback(&binding.spec.attr);
            info!(device = %self.device, attr = %binding.spec.attr, "variable unbound");
        }
        Ok(())
    }

    /// Blocking read through the session.  Callers serialise it with the
    /// device monitor.
    pub fn read(&self, attr: &str) -> Result<WireValue, BridgeError> {
        self.hooks(attr)?.read()
    }

    pub fn write(&self, attr: &str, value: WireValue) -> Result<(), BridgeError> {
        self.hooks(attr)?.write(value)
    }

    /// Bound attribute names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.bindings.lock().keys().cloned().collect()
    }

    pub fn handle(&self, attr: &str) -> Option<SessionElementHandle> {
        self.bindings
            .lock()
            .values()
            .find(|b| b.spec.attr.eq_ignore_ascii_case(attr))
            .map(|b| b.handle.clone())
    }

    /// Persisted form of every binding, sorted by attribute name.
    pub fn persisted(&self) -> Vec<String> {
        self.bindings
            .lock()
            .values()
            .map(|b| b.spec.to_string())
            .collect()
    }

    /// Unbind everything.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.bindings.lock());
        for binding in drained.into_values() {
            self.rollback(&binding.spec.attr);
        }
    }

    fn hooks(&self, attr: &str) -> Result<Arc<VariableAttr>, BridgeError> {
        self.bindings
            .lock()
            .values()
            .find(|b| b.spec.attr.eq_ignore_ascii_case(attr))
            .map(|b| b.hooks.clone())
            .ok_or_else(|| BridgeError::not_found("variable", attr))
    }

    fn rollback(&self, attr: &str) {
        self.server.set_change_event(&self.device, attr, false);
        if let Err(e) = self.server.remove_dynamic_attribute(&self.device, attr) {
            debug!(device = %self.device, attr, error = %e, "attribute already gone");
        }
    }

    fn update_hook(&self, attr: &str, codec: Codec) -> UpdateCallback {
        let submitter = self.submitter.clone();
        let server = self.server.clone();
        let device = self.device.clone();
        let attr = attr.to_string();
        Box::new(move |value: Value| {
            let wire = match codec.encode(&value) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(device = %device, attr = %attr, error = %e, "cannot encode variable update");
                    return;
                }
            };
            let server = server.clone();
            let device = device.clone();
            let attr = attr.clone();
            submitter.submit(move || {
                server.push_change_event(&device, &attr, wire, AttrQuality::Valid)
            });
        })
    }
}

impl Drop for VariableBindingTable {
    fn drop(&mut self) {
        self.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_parsing_defaults() {
        assert_eq!(
            VariableSpec::parse("myvar").unwrap(),
            VariableSpec::new("myvar", "myvar", TypeTag::Json)
        );
        assert_eq!(
            VariableSpec::parse("Energy  ENERGY").unwrap(),
            VariableSpec::new("Energy", "ENERGY", TypeTag::Json)
        );
        assert_eq!(
            VariableSpec::parse("Scans SCANS long[]").unwrap().type_tag,
            TypeTag::LongArray
        );
        assert!(VariableSpec::parse("").is_err());
        assert!(VariableSpec::parse("a b c d").is_err());
    }

    #[test]
    fn persisted_form_round_trips() {
        let spec = VariableSpec::new("A", "a", TypeTag::Other("matrix".into()));
        assert_eq!(spec.to_string(), "A a matrix");
        assert_eq!(VariableSpec::parse(&spec.to_string()).unwrap(), spec);
    }

    #[test]
    fn json_codec_round_trips_structures() {
        let codec = TypeTag::Json.codec();
        let wire = codec
            .encode(&json!({"x": 1, "y": [1, 2]}))
            .unwrap();
        assert_eq!(wire.wire_type(), Some(WireType::String));
        assert_eq!(codec.decode(wire).unwrap(), json!({"x": 1, "y": [1, 2]}));
        assert!(matches!(
            codec.decode(WireValue::String("{not json".into())),
            Err(BridgeError::Codec(_))
        ));
    }

    #[test]
    fn passthrough_checks_types() {
        let codec = TypeTag::Double.codec();
        assert_eq!(codec.encode(&json!(2.5)).unwrap(), WireValue::Double(2.5));
        assert!(codec.encode(&json!("x")).is_err());
        assert_eq!(codec.decode(WireValue::Double(1.0)).unwrap(), json!(1.0));

        let codec = TypeTag::LongArray.codec();
        assert_eq!(
            codec.encode(&json!([1, 2, 3])).unwrap(),
            WireValue::LongArray(vec![1, 2, 3])
        );
        assert!(!codec.supports_events());
    }

    #[test]
    fn unknown_tags_coerce_to_strings() {
        let codec = TypeTag::parse("matrix").codec();
        assert_eq!(codec, Codec::StringCoercion);
        assert_eq!(codec.encode(&json!("abc")).unwrap(), WireValue::String("abc".into()));
        assert_eq!(codec.encode(&json!(12)).unwrap(), WireValue::String("12".into()));
        assert_eq!(codec.decode(WireValue::String("12".into())).unwrap(), json!("12"));
        assert!(codec.supports_events());
    }

    // ── table against a live server ─────────────────────────────────────────

    use std::time::Duration;
    use tangospec_middleware::{Device, DeviceContext, Dispatcher, LocalServer};
    use tangospec_session::SimSession;
    use tangospec_store::MemoryPropertyStore;

    struct Host(String);

    impl Device for Host {
        fn name(&self) -> &str {
            &self.0
        }
        fn class(&self) -> &str {
            "Host"
        }
        fn init(&self) {}
        fn delete(&self) {}
        fn attributes(&self) -> Vec<AttrInfo> {
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

    struct Fixture {
        server: Arc<LocalServer>,
        sim: Arc<SimSession>,
        dispatcher: Dispatcher,
        table: VariableBindingTable,
    }

    fn fixture() -> Fixture {
        let server = LocalServer::new(Arc::new(MemoryPropertyStore::new()));
        server.register_class("Host", |ctx: DeviceContext| -> Arc<dyn Device> {
            Arc::new(Host(ctx.name))
        });
        server.create_device("Host", "test/host/1", None).unwrap();
        let sim = SimSession::builder("localhost:fourc")
            .with_variable("myvar", json!({"x": 1}))
            .build()
            .unwrap();
        let dispatcher = Dispatcher::start("vars").unwrap();
        let table = VariableBindingTable::new(
            "test/host/1",
            server.clone(),
            sim.clone(),
            dispatcher.submitter(),
        );
        Fixture {
            server,
            sim,
            dispatcher,
            table,
        }
    }

    #[test]
    fn add_read_write_remove() {
        let f = fixture();
        f.table.add(VariableSpec::parse("myvar").unwrap()).unwrap();
        assert!(matches!(
            f.table.add(VariableSpec::parse("MYVAR").unwrap()),
            Err(BridgeError::DuplicateBinding(_))
        ));

        let wire = f.server.read_attribute("test/host/1", "myvar").unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(wire.as_str().unwrap()).unwrap(),
            json!({"x": 1})
        );

        f.table
            .write("myvar", WireValue::String(r#"{"x": 2}"#.into()))
            .unwrap();
        assert_eq!(f.sim.variable_value("myvar"), Some(json!({"x": 2})));
        assert_eq!(f.table.persisted(), vec!["myvar myvar json"]);

        f.table.remove("myvar").unwrap();
        assert!(f.table.names().is_empty());
        assert!(f.table.persisted().is_empty());
        assert!(f.server.read_attribute("test/host/1", "myvar").is_err());
        assert!(matches!(f.table.remove("myvar"), Err(BridgeError::NotFound { .. })));
        f.server.shutdown();
    }

    #[tokio::test]
    async fn session_updates_become_change_events() {
        let f = fixture();
        let mut sub = f.server.bus().subscribe_device("test/host/1", Some("myvar"));
        f.table.add(VariableSpec::parse("myvar").unwrap()).unwrap();

        f.sim.set_variable("myvar", json!([1, 2]));
        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.value, WireValue::String("[1,2]".into()));
        f.dispatcher.shutdown();
        f.server.shutdown();
    }

    #[test]
    fn persisted_list_is_sorted_by_attribute() {
        let f = fixture();
        for spec in ["zeta myvar", "alpha myvar double", "Mid myvar"] {
            f.table.add(VariableSpec::parse(spec).unwrap()).unwrap();
        }
        assert_eq!(
            f.table.persisted(),
            vec!["Mid myvar json", "alpha myvar double", "zeta myvar json"]
        );
        f.table.clear();
        assert!(f.table.names().is_empty());
        f.server.shutdown();
    }
}
