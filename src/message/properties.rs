use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    String(String),
    Object(Value),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Long(_) => 3,
            Self::Float(_) => 4,
            Self::Double(_) => 5,
            Self::Byte(_) => 6,
            Self::Short(_) => 7,
            Self::String(_) => 8,
            Self::Object(_) => 9,
            Self::Bytes(_) => 10,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Byte(_) => "byte",
            Self::Short(_) => "short",
            Self::String(_) => "string",
            Self::Object(_) => "object",
            Self::Bytes(_) => "bytes",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PropertyError {
    NotFound {
        name: String,
    },
    InvalidValue {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "property '{name}' not found"),
            Self::InvalidValue {
                name,
                expected,
                actual,
            } => write!(
                f,
                "property '{name}' holds a {actual} value that cannot be read as {expected}"
            ),
        }
    }
}

impl std::error::Error for PropertyError {}

/// Typed, case-sensitive property bag carried by every envelope.
///
/// Reads follow the usual messaging conversion rules: narrower integers widen to
/// wider ones, and string values are parsed on demand. Anything else is reported as
/// [`PropertyError::InvalidValue`], which callers can tell apart from a missing key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties {
    entries: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.entries.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn set_bool(&mut self, name: impl Into<String>, value: bool) {
        self.set(name, PropertyValue::Bool(value));
    }

    pub fn set_int(&mut self, name: impl Into<String>, value: i32) {
        self.set(name, PropertyValue::Int(value));
    }

    pub fn set_long(&mut self, name: impl Into<String>, value: i64) {
        self.set(name, PropertyValue::Long(value));
    }

    pub fn set_float(&mut self, name: impl Into<String>, value: f32) {
        self.set(name, PropertyValue::Float(value));
    }

    pub fn set_double(&mut self, name: impl Into<String>, value: f64) {
        self.set(name, PropertyValue::Double(value));
    }

    pub fn set_byte(&mut self, name: impl Into<String>, value: i8) {
        self.set(name, PropertyValue::Byte(value));
    }

    pub fn set_short(&mut self, name: impl Into<String>, value: i16) {
        self.set(name, PropertyValue::Short(value));
    }

    pub fn set_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set(name, PropertyValue::String(value.into()));
    }

    pub fn set_object(&mut self, name: impl Into<String>, value: Value) {
        self.set(name, PropertyValue::Object(value));
    }

    pub fn set_bytes(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.set(name, PropertyValue::Bytes(value));
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Bool(value) => Ok(*value),
            PropertyValue::String(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(invalid(name, "bool", "string")),
            },
            other => Err(invalid(name, "bool", other.type_name())),
        }
    }

    pub fn get_byte(&self, name: &str) -> Result<i8, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Byte(value) => Ok(*value),
            PropertyValue::String(raw) => parse_string(name, raw, "byte"),
            other => Err(invalid(name, "byte", other.type_name())),
        }
    }

    pub fn get_short(&self, name: &str) -> Result<i16, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Byte(value) => Ok(i16::from(*value)),
            PropertyValue::Short(value) => Ok(*value),
            PropertyValue::String(raw) => parse_string(name, raw, "short"),
            other => Err(invalid(name, "short", other.type_name())),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<i32, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Byte(value) => Ok(i32::from(*value)),
            PropertyValue::Short(value) => Ok(i32::from(*value)),
            PropertyValue::Int(value) => Ok(*value),
            PropertyValue::String(raw) => parse_string(name, raw, "int"),
            other => Err(invalid(name, "int", other.type_name())),
        }
    }

    pub fn get_long(&self, name: &str) -> Result<i64, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Byte(value) => Ok(i64::from(*value)),
            PropertyValue::Short(value) => Ok(i64::from(*value)),
            PropertyValue::Int(value) => Ok(i64::from(*value)),
            PropertyValue::Long(value) => Ok(*value),
            PropertyValue::String(raw) => parse_string(name, raw, "long"),
            other => Err(invalid(name, "long", other.type_name())),
        }
    }

    pub fn get_float(&self, name: &str) -> Result<f32, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Float(value) => Ok(*value),
            PropertyValue::String(raw) => parse_string(name, raw, "float"),
            other => Err(invalid(name, "float", other.type_name())),
        }
    }

    pub fn get_double(&self, name: &str) -> Result<f64, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Float(value) => Ok(f64::from(*value)),
            PropertyValue::Double(value) => Ok(*value),
            PropertyValue::String(raw) => parse_string(name, raw, "double"),
            other => Err(invalid(name, "double", other.type_name())),
        }
    }

    pub fn get_string(&self, name: &str) -> Result<String, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Bool(value) => Ok(value.to_string()),
            PropertyValue::Int(value) => Ok(value.to_string()),
            PropertyValue::Long(value) => Ok(value.to_string()),
            PropertyValue::Float(value) => Ok(value.to_string()),
            PropertyValue::Double(value) => Ok(value.to_string()),
            PropertyValue::Byte(value) => Ok(value.to_string()),
            PropertyValue::Short(value) => Ok(value.to_string()),
            PropertyValue::String(value) => Ok(value.clone()),
            other => Err(invalid(name, "string", other.type_name())),
        }
    }

    pub fn get_object(&self, name: &str) -> Result<&Value, PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Object(value) => Ok(value),
            other => Err(invalid(name, "object", other.type_name())),
        }
    }

    pub fn get_bytes(&self, name: &str) -> Result<&[u8], PropertyError> {
        match self.lookup(name)? {
            PropertyValue::Bytes(value) => Ok(value),
            other => Err(invalid(name, "bytes", other.type_name())),
        }
    }

    fn lookup(&self, name: &str) -> Result<&PropertyValue, PropertyError> {
        self.entries.get(name).ok_or_else(|| PropertyError::NotFound {
            name: name.to_owned(),
        })
    }
}

impl FromIterator<(String, PropertyValue)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, PropertyValue)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn invalid(name: &str, expected: &'static str, actual: &'static str) -> PropertyError {
    PropertyError::InvalidValue {
        name: name.to_owned(),
        expected,
        actual,
    }
}

fn parse_string<T: std::str::FromStr>(
    name: &str,
    raw: &str,
    expected: &'static str,
) -> Result<T, PropertyError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| invalid(name, expected, "string"))
}
