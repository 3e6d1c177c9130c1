use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Result;

pub mod keys;

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Object(Options),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::String(s) => parse_switch(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Options> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

/// Interprets the usual textual spellings of an on/off switch.
pub fn parse_switch(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(<$conv>::from(value))
            }
        })*
    };
}

value_from! {
    bool => Bool as bool,
    i64 => Int as i64,
    i32 => Int as i64,
    u32 => Int as i64,
    f64 => Float as f64,
    f32 => Float as f64,
    String => String as String,
    Vec<Value> => List as Vec<Value>,
    Options => Object as Options,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

/// Ordered, string-keyed attribute bag describing one render.
///
/// Insertion order is preserved, and setting an existing key replaces the
/// value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    entries: Vec<(String, Value)>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON object into an options bag.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Builder-style variant of [`Options::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.position(key).map(|idx| &self.entries[idx].1)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(idx) => self.entries[idx].1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.position(key).map(|idx| self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn try_get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn try_get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or(default)
    }

    pub fn try_get_float(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(Value::as_float).unwrap_or(default)
    }

    pub fn try_get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn get_list(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_list)
    }

    pub fn get_object(&self, key: &str) -> Option<&Options> {
        self.get(key).and_then(Value::as_object)
    }

    /// Collects a list attribute of integers, skipping non-numeric entries.
    pub fn get_int_list(&self, key: &str) -> Vec<i64> {
        self.get_list(key)
            .map(|items| items.iter().filter_map(Value::as_int).collect())
            .unwrap_or_default()
    }

    pub fn get_float_list(&self, key: &str) -> Vec<f64> {
        self.get_list(key)
            .map(|items| items.iter().filter_map(Value::as_float).collect())
            .unwrap_or_default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

/// Adds or replaces an SDL constant in the `declare` list.
pub fn declare(opts: &mut Options, identifier: &str, value: impl Into<Value>) {
    let entry = Options::new()
        .with(keys::IDENTIFIER, identifier)
        .with(keys::VALUE, value);

    let mut declares = opts
        .get_list(keys::DECLARE)
        .map(<[Value]>::to_vec)
        .unwrap_or_default();
    let existing = declares.iter().position(|item| {
        item.as_object()
            .map(|obj| obj.try_get_str(keys::IDENTIFIER, "") == identifier)
            .unwrap_or(false)
    });
    match existing {
        Some(idx) => declares[idx] = Value::Object(entry),
        None => declares.push(Value::Object(entry)),
    }
    opts.set(keys::DECLARE, declares);
}

/// Looks up a declared constant by identifier.
pub fn declared<'a>(opts: &'a Options, identifier: &str) -> Option<&'a Value> {
    opts.get_list(keys::DECLARE)?
        .iter()
        .filter_map(Value::as_object)
        .find(|obj| obj.try_get_str(keys::IDENTIFIER, "") == identifier)
        .and_then(|obj| obj.get(keys::VALUE))
}

impl Serialize for Options {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Options {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OptionsVisitor;

        impl<'de> Visitor<'de> for OptionsVisitor {
            type Value = Options;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of option attributes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Options, A::Error> {
                let mut opts = Options::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    opts.set(key, value);
                }
                Ok(opts)
            }
        }

        deserializer.deserialize_map(OptionsVisitor)
    }
}
