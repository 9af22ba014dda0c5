//! The runtime values a fuzzed call carries.
//!
//! [`Value`] is a closed union over the argument kinds the mutator understands.
//! Anything else travels as [`Value::Unsupported`] (or [`Value::None`]) and is
//! passed through untouched. Structured objects are reached only through the
//! [`Object`] capability, never by reflection.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Why an object field could not be mutated. Always recovered by leaving the
/// object as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationFailure {
    #[error("object has no field `{0}`")]
    UnknownField(String),
    #[error("field `{field}` expects {expected}, got {found:?}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: ValueKind,
    },
    #[error("value {value} out of range for field `{field}`")]
    OutOfRange { field: String, value: String },
    #[error("field `{0}` is read-only")]
    ReadOnly(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    None,
    Bool,
    Int,
    Float,
    Complex,
    Text,
    Bytes,
    List,
    Tuple,
    Set,
    FrozenSet,
    Map,
    Object,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex { re: f64, im: f64 },
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Members in iteration order; kept free of duplicates.
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    /// Entries in insertion order.
    Map(Vec<(Value, Value)>),
    Object(ObjectValue),
    /// A value of a kind the mutator does not know, kept as its textual form.
    Unsupported(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Complex { .. } => ValueKind::Complex,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Tuple(_) => ValueKind::Tuple,
            Value::Set(_) => ValueKind::Set,
            Value::FrozenSet(_) => ValueKind::FrozenSet,
            Value::Map(_) => ValueKind::Map,
            Value::Object(_) => ValueKind::Object,
            Value::Unsupported(_) => ValueKind::Unsupported,
        }
    }

    /// Builds a set, dropping repeated members while keeping first occurrences.
    pub fn set_from(members: Vec<Value>) -> Value {
        Value::Set(dedup(members))
    }

    pub fn frozen_set_from(members: Vec<Value>) -> Value {
        Value::FrozenSet(dedup(members))
    }

    pub fn object<O: Object + 'static>(object: O) -> Value {
        Value::Object(ObjectValue::new(object))
    }
}

pub(crate) fn dedup(members: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(members.len());
    for member in members {
        if !out.contains(&member) {
            out.push(member);
        }
    }
    out
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

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// The capability a structured argument exposes to the mutator.
///
/// Implement it by hand, use [`Record`], or derive it with `#[derive(Object)]`
/// (feature `derive`) on a struct whose fields implement [`FieldValue`].
pub trait Object: Send + Sync {
    fn type_name(&self) -> &str;

    /// Names of the fields the mutator may replace, in a stable order.
    fn list_fields(&self) -> Vec<String>;

    fn get_field(&self, name: &str) -> Result<Value, MutationFailure>;

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), MutationFailure>;

    fn clone_object(&self) -> Box<dyn Object>;
}

/// An owned, clonable handle to an [`Object`].
pub struct ObjectValue(Box<dyn Object>);

impl ObjectValue {
    pub fn new<O: Object + 'static>(object: O) -> Self {
        Self(Box::new(object))
    }

    pub fn from_box(object: Box<dyn Object>) -> Self {
        Self(object)
    }

    pub fn as_object(&self) -> &dyn Object {
        self.0.as_ref()
    }

    pub fn as_object_mut(&mut self) -> &mut dyn Object {
        self.0.as_mut()
    }

    /// Reads every listed field. Fields that refuse to be read are skipped.
    pub fn snapshot(&self) -> Record {
        let fields = self
            .0
            .list_fields()
            .into_iter()
            .filter_map(|name| self.0.get_field(&name).ok().map(|v| (name, v)))
            .collect();
        Record {
            type_name: self.0.type_name().to_string(),
            fields,
        }
    }
}

impl Clone for ObjectValue {
    fn clone(&self) -> Self {
        Self(self.0.clone_object())
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        let mut s = f.debug_struct(&snapshot.type_name);
        for (name, value) in &snapshot.fields {
            s.field(name, value);
        }
        s.finish()
    }
}

// Objects cross the worker boundary as a record of their fields.
impl Serialize for ObjectValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ObjectValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Record::deserialize(deserializer).map(ObjectValue::new)
    }
}

/// A dynamic object: a type name and an ordered list of named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub type_name: String,
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.push((name.to_string(), value.into()));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl Object for Record {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn list_fields(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }

    fn get_field(&self, name: &str) -> Result<Value, MutationFailure> {
        self.field(name)
            .cloned()
            .ok_or_else(|| MutationFailure::UnknownField(name.to_string()))
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), MutationFailure> {
        let slot = self
            .fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| MutationFailure::UnknownField(name.to_string()))?;
        slot.1 = value;
        Ok(())
    }

    fn clone_object(&self) -> Box<dyn Object> {
        Box::new(self.clone())
    }
}

/// Conversion between a struct field and a [`Value`], used by `#[derive(Object)]`.
pub trait FieldValue: Sized {
    fn to_value(&self) -> Value;

    fn from_value(field: &str, value: Value) -> Result<Self, MutationFailure>;
}

fn mismatch(field: &str, expected: &'static str, found: &Value) -> MutationFailure {
    MutationFailure::TypeMismatch {
        field: field.to_string(),
        expected,
        found: found.kind(),
    }
}

impl FieldValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(_field: &str, value: Value) -> Result<Self, MutationFailure> {
        Ok(value)
    }
}

impl FieldValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(field: &str, value: Value) -> Result<Self, MutationFailure> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch(field, "bool", &other)),
        }
    }
}

macro_rules! int_field_value {
    ($($ty:ty),*) => {$(
        impl FieldValue for $ty {
            fn to_value(&self) -> Value {
                Value::Int(*self as i64)
            }

            fn from_value(field: &str, value: Value) -> Result<Self, MutationFailure> {
                match value {
                    Value::Int(i) => <$ty>::try_from(i).map_err(|_| MutationFailure::OutOfRange {
                        field: field.to_string(),
                        value: i.to_string(),
                    }),
                    other => Err(mismatch(field, stringify!($ty), &other)),
                }
            }
        }
    )*};
}

int_field_value!(i8, i16, i32, i64, u8, u16, u32);

impl FieldValue for f64 {
    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(field: &str, value: Value) -> Result<Self, MutationFailure> {
        match value {
            Value::Float(f) => Ok(f),
            other => Err(mismatch(field, "f64", &other)),
        }
    }
}

impl FieldValue for f32 {
    fn to_value(&self) -> Value {
        Value::Float(*self as f64)
    }

    fn from_value(field: &str, value: Value) -> Result<Self, MutationFailure> {
        match value {
            Value::Float(f) => Ok(f as f32),
            other => Err(mismatch(field, "f32", &other)),
        }
    }
}

impl FieldValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(field: &str, value: Value) -> Result<Self, MutationFailure> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(mismatch(field, "String", &other)),
        }
    }
}

impl FieldValue for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }

    fn from_value(field: &str, value: Value) -> Result<Self, MutationFailure> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(mismatch(field, "Vec<u8>", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn sets_drop_duplicates_in_order() {
        let set = Value::set_from(vec![1.into(), 2.into(), 1.into(), 3.into()]);
        assert_eq!(set, Value::Set(vec![1.into(), 2.into(), 3.into()]));
    }

    #[test]
    fn record_fields_can_be_replaced() {
        let mut record = Record::new("Point").with_field("x", 1).with_field("y", 2);
        record.set_field("y", Value::Int(5)).unwrap();
        assert_eq!(record.get_field("y").unwrap(), Value::Int(5));
        assert_matches!(
            record.set_field("z", Value::Int(0)),
            Err(MutationFailure::UnknownField(_))
        );
    }

    #[test]
    fn narrow_integer_fields_reject_out_of_range_values() {
        assert_eq!(u8::from_value("f", Value::Int(200)).unwrap(), 200);
        assert_matches!(
            u8::from_value("f", Value::Int(300)),
            Err(MutationFailure::OutOfRange { .. })
        );
        assert_matches!(
            u8::from_value("f", Value::Text("1".into())),
            Err(MutationFailure::TypeMismatch { .. })
        );
    }

    #[test]
    fn objects_travel_as_records() {
        let value = Value::object(Record::new("Cfg").with_field("depth", 3));
        let bytes = serde_cbor::to_vec(&value).unwrap();
        let back: Value = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(back, value);
        assert_eq!(back.kind(), ValueKind::Object);
    }
}
