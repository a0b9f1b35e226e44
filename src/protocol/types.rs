//! Identifiers, typed content values and static protocol schema tables.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use base64::Engine as _;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Agent address.
pub type Address = String;

/// Protocol identifier (`author/name:version`).
pub type ProtocolId = PublicId;

/// Connection identifier (`author/name:version`).
pub type ConnectionId = PublicId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid public id '{0}'. Expected 'author/name:version'.")]
pub struct PublicIdError(pub String);

/// Public identifier shared by protocols and connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicId {
    author: String,
    name: String,
    version: String,
}

fn public_id_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-zA-Z_][a-zA-Z0-9_]*)/([a-zA-Z_][a-zA-Z0-9_]*):(\d+\.\d+\.\d+|latest)$").ok()
    })
    .as_ref()
}

impl PublicId {
    /// Build from components known to be well formed.
    pub(crate) fn from_parts(author: &str, name: &str, version: &str) -> Self {
        Self {
            author: author.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// Author component.
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Package name component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version component.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl FromStr for PublicId {
    type Err = PublicIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = public_id_regex()
            .and_then(|re| re.captures(s.trim()))
            .ok_or_else(|| PublicIdError(s.to_string()))?;

        Ok(Self {
            author: caps[1].to_string(),
            name: caps[2].to_string(),
            version: caps[3].to_string(),
        })
    }
}

impl TryFrom<String> for PublicId {
    type Error = PublicIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PublicId> for String {
    fn from(id: PublicId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.author, self.name, self.version)
    }
}

/// Declared type of a message content field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    StrTuple,
    StrMap,
    /// Protocol-defined structured type.
    Custom(CustomKind),
}

impl FieldKind {
    /// Type name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Str => "str",
            FieldKind::Bytes => "bytes",
            FieldKind::StrTuple => "tuple[str]",
            FieldKind::StrMap => "dict[str, str]",
            FieldKind::Custom(kind) => kind.name(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured content type owned by a protocol.
pub trait CustomType: Serialize + DeserializeOwned {
    /// Name matched against `FieldKind::Custom`.
    const TYPE_NAME: &'static str;
}

/// A custom content type as declared in a schema: its name and a shape check
/// against the JSON form.
#[derive(Clone, Copy)]
pub struct CustomKind {
    name: &'static str,
    accepts: fn(&serde_json::Value) -> bool,
}

fn deserializes_as<T: CustomType>(json: &serde_json::Value) -> bool {
    !json.is_null() && T::deserialize(json).is_ok()
}

impl CustomKind {
    pub const fn of<T: CustomType>() -> Self {
        Self {
            name: T::TYPE_NAME,
            accepts: deserializes_as::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether `json` has the shape of this type.
    pub fn accepts(&self, json: &serde_json::Value) -> bool {
        (self.accepts)(json)
    }
}

// Type names are unique within a protocol, so they identify the kind.
impl PartialEq for CustomKind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for CustomKind {}

impl fmt::Debug for CustomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomKind({})", self.name)
    }
}

/// Value of a custom content type, kept in its JSON form.
///
/// Only built through [`Value::custom`] or a schema-checked decode, so the
/// data always has the shape of its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomValue {
    kind: CustomKind,
    data: serde_json::Value,
}

impl CustomValue {
    pub fn kind(&self) -> CustomKind {
        self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.name
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }
}

/// Typed content value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    StrTuple(Vec<String>),
    StrMap(BTreeMap<String, String>),
    Custom(CustomValue),
}

impl Value {
    /// Wrap a protocol custom type.
    pub fn custom<T: CustomType>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Value::Custom(CustomValue {
            kind: CustomKind::of::<T>(),
            data: serde_json::to_value(value)?,
        }))
    }

    /// The kind this value satisfies.
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Bool(_) => FieldKind::Bool,
            Value::Int(_) => FieldKind::Int,
            Value::Float(_) => FieldKind::Float,
            Value::Str(_) => FieldKind::Str,
            Value::Bytes(_) => FieldKind::Bytes,
            Value::StrTuple(_) => FieldKind::StrTuple,
            Value::StrMap(_) => FieldKind::StrMap,
            Value::Custom(c) => FieldKind::Custom(c.kind),
        }
    }

    /// JSON form used on the wire. Bytes are base64 encoded.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(x) => serde_json::Value::from(*x),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::StrTuple(items) => serde_json::Value::from(items.clone()),
            Value::StrMap(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
            ),
            Value::Custom(c) => c.data.clone(),
        }
    }

    /// Read a JSON value as the given kind. Returns `None` on a type mismatch.
    pub fn from_json(kind: FieldKind, json: &serde_json::Value) -> Option<Self> {
        match kind {
            FieldKind::Bool => json.as_bool().map(Value::Bool),
            FieldKind::Int => json.as_i64().map(Value::Int),
            // Integers are `int`, even where a float is declared.
            FieldKind::Float if json.is_f64() => json.as_f64().map(Value::Float),
            FieldKind::Float => None,
            FieldKind::Str => json.as_str().map(|s| Value::Str(s.to_string())),
            FieldKind::Bytes => {
                let encoded = json.as_str()?;
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .ok()
                    .map(Value::Bytes)
            }
            FieldKind::StrTuple => json
                .as_array()?
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Value::StrTuple),
            FieldKind::StrMap => json
                .as_object()?
                .iter()
                .map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(Value::StrMap),
            FieldKind::Custom(kind) => kind.accepts(json).then(|| {
                Value::Custom(CustomValue {
                    kind,
                    data: json.clone(),
                })
            }),
        }
    }
}

/// Name of a JSON value's type, for diagnostics.
pub fn json_type_name(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        serde_json::Value::Number(_) => "float",
        serde_json::Value::String(_) => "str",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "dict",
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StrTuple(v)
    }
}

impl From<BTreeMap<String, String>> for Value {
    fn from(v: BTreeMap<String, String>) -> Self {
        Value::StrMap(v)
    }
}

/// Message contents keyed by field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body(BTreeMap<String, Value>);

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Add a custom-typed field.
    pub fn with_custom<T: CustomType>(
        mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        self.0.insert(name.into(), Value::custom(value)?);
        Ok(self)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One content field of a performative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub optional: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            optional: false,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            optional: true,
        }
    }
}

/// A performative and the exact contents it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformativeSpec {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl PerformativeSpec {
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required(&self) -> impl Iterator<Item = &'static FieldSpec> {
        self.fields.iter().filter(|f| !f.optional)
    }
}

/// How a protocol's messages are laid out as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `{"performative", "dialogue_reference", "message_id", "target", "body"}`.
    Structured,
    /// `{"type": <performative>, ...contents}`; dialogue fields only when not default.
    TypeTagged,
}

/// Static schema of a protocol: its performatives and their contents.
#[derive(Debug, PartialEq, Eq)]
pub struct ProtocolSchema {
    pub author: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    pub encoding: Encoding,
    pub performatives: &'static [PerformativeSpec],
}

impl ProtocolSchema {
    pub fn protocol_id(&self) -> ProtocolId {
        PublicId::from_parts(self.author, self.name, self.version)
    }

    /// Look up a performative by name.
    pub fn performative(&'static self, name: &str) -> Option<&'static PerformativeSpec> {
        self.performatives.iter().find(|p| p.name == name)
    }

    /// Comma separated performative names.
    pub fn performative_names(&self) -> String {
        self.performatives
            .iter()
            .map(|p| p.name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ProtocolSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.author, self.name, self.version)
    }
}

/// Closed performative set of one protocol.
pub trait Performative: Copy + fmt::Debug + Send + Sync + 'static {
    /// Schema the performative belongs to.
    fn schema() -> &'static ProtocolSchema;

    /// Wire name of the performative.
    fn as_str(self) -> &'static str;
}
