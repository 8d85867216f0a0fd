//! Port type expressions.
//!
//! CWL type expressions come in several notations (`string[]`,
//! `{type: array, items: ...}`, `{type: {type: string[]}}`, `["null", T]`).
//! They are parsed into the closed [`PortSchema`] variant type at load time;
//! anything outside it is rejected there instead of deep inside a rewrite.
//! [`PortType`] keeps the notation a port was written in so that untouched
//! ports serialize back to the same value.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    String,
    Int,
    Long,
    Float,
    Double,
    Boolean,
    File,
}

impl Primitive {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::File => "File",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "int" => Some(Self::Int),
            "long" => Some(Self::Long),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            "boolean" => Some(Self::Boolean),
            "File" => Some(Self::File),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordField {
    pub name: String,
    pub schema: PortSchema,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordSchema {
    pub name: Option<String>,
    pub fields: Vec<RecordField>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, schema: PortSchema) -> Self {
        self.fields.push(RecordField {
            name: name.into(),
            schema,
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&RecordField> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Structural type of a task or pipeline port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortSchema {
    Scalar(Primitive),
    Directory,
    Array(Box<PortSchema>),
    Record(RecordSchema),
    Optional(Box<PortSchema>),
}

impl PortSchema {
    pub fn string() -> Self {
        Self::Scalar(Primitive::String)
    }

    pub fn string_array() -> Self {
        Self::array_of(Self::string())
    }

    pub fn directory() -> Self {
        Self::Directory
    }

    pub fn directory_array() -> Self {
        Self::array_of(Self::Directory)
    }

    pub fn record_array(record: RecordSchema) -> Self {
        Self::array_of(Self::Record(record))
    }

    pub fn array_of(items: PortSchema) -> Self {
        Self::Array(Box::new(items))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    pub fn items(&self) -> Option<&PortSchema> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// The record schema of a record-array, the shape a tile list has.
    pub fn as_record_array(&self) -> Option<&RecordSchema> {
        match self.items() {
            Some(Self::Record(record)) => Some(record),
            _ => None,
        }
    }

    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(name) => parse_type_name(name),
            Value::Object(map) => parse_type_mapping(map),
            Value::Array(members) => parse_union(members),
            other => Err(format!("unsupported type expression {other}")),
        }
    }

    /// Canonical notation, short form wherever CWL has one.
    pub fn to_value(&self) -> Value {
        if let Some(name) = self.short_name() {
            return Value::String(name);
        }
        match self {
            Self::Array(items) => json!({ "type": "array", "items": items.to_value() }),
            Self::Record(record) => record_to_value(record),
            Self::Optional(inner) => json!(["null", inner.to_value()]),
            Self::Scalar(_) | Self::Directory => Value::String(self.to_string()),
        }
    }

    fn short_name(&self) -> Option<String> {
        match self {
            Self::Scalar(primitive) => Some(primitive.as_str().to_string()),
            Self::Directory => Some("Directory".to_string()),
            Self::Array(items) => match items.as_ref() {
                Self::Optional(_) => None,
                other => other.short_name().map(|name| format!("{name}[]")),
            },
            Self::Optional(inner) => inner.short_name().map(|name| format!("{name}?")),
            Self::Record(_) => None,
        }
    }
}

impl fmt::Display for PortSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(primitive) => f.write_str(primitive.as_str()),
            Self::Directory => f.write_str("Directory"),
            Self::Array(items) => write!(f, "{items}[]"),
            Self::Record(record) => match &record.name {
                Some(name) => write!(f, "record {name}"),
                None => f.write_str("record"),
            },
            Self::Optional(inner) => write!(f, "{inner}?"),
        }
    }
}

fn parse_type_name(name: &str) -> Result<PortSchema, String> {
    if let Some(inner) = name.strip_suffix('?') {
        return Ok(PortSchema::Optional(Box::new(parse_type_name(inner)?)));
    }
    if let Some(inner) = name.strip_suffix("[]") {
        return Ok(PortSchema::array_of(parse_type_name(inner)?));
    }
    if name == "Directory" {
        return Ok(PortSchema::Directory);
    }
    Primitive::from_name(name)
        .map(PortSchema::Scalar)
        .ok_or_else(|| format!("unknown type '{name}'"))
}

fn parse_type_mapping(map: &Map<String, Value>) -> Result<PortSchema, String> {
    let Some(kind) = map.get("type") else {
        return Err("type mapping has no 'type' key".to_string());
    };

    match kind.as_str() {
        Some("array") => {
            let items = map
                .get("items")
                .ok_or_else(|| "array type has no 'items'".to_string())?;
            Ok(PortSchema::array_of(PortSchema::parse(items)?))
        }
        Some("record") => parse_record(map).map(PortSchema::Record),
        Some("enum") => Err("enum types are not supported".to_string()),
        _ => PortSchema::parse(kind),
    }
}

fn parse_record(map: &Map<String, Value>) -> Result<RecordSchema, String> {
    let name = map.get("name").and_then(Value::as_str).map(str::to_string);
    let mut fields = Vec::new();

    match map.get("fields") {
        None => {}
        Some(Value::Array(entries)) => {
            for entry in entries {
                let field_name = entry
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "record field has no name".to_string())?;
                let field_type = entry
                    .get("type")
                    .ok_or_else(|| format!("record field '{field_name}' has no type"))?;
                fields.push(RecordField {
                    name: field_name.to_string(),
                    schema: PortSchema::parse(field_type)?,
                });
            }
        }
        Some(Value::Object(entries)) => {
            for (field_name, field_type) in entries {
                fields.push(RecordField {
                    name: field_name.clone(),
                    schema: PortSchema::parse(field_type)?,
                });
            }
        }
        Some(other) => return Err(format!("record fields must be a list, got {other}")),
    }

    Ok(RecordSchema { name, fields })
}

fn parse_union(members: &[Value]) -> Result<PortSchema, String> {
    let non_null: Vec<&Value> = members
        .iter()
        .filter(|member| member.as_str() != Some("null"))
        .collect();

    match non_null.as_slice() {
        [single] if members.len() == 2 => {
            Ok(PortSchema::Optional(Box::new(PortSchema::parse(single)?)))
        }
        _ => Err(format!(
            "union types other than [\"null\", T] are not supported ({} members)",
            members.len()
        )),
    }
}

fn record_to_value(record: &RecordSchema) -> Value {
    let mut map = Map::new();
    map.insert("type".to_string(), Value::String("record".to_string()));
    if let Some(name) = &record.name {
        map.insert("name".to_string(), Value::String(name.clone()));
    }
    let fields = record
        .fields
        .iter()
        .map(|field| json!({ "name": field.name, "type": field.schema.to_value() }))
        .collect();
    map.insert("fields".to_string(), Value::Array(fields));
    Value::Object(map)
}

/// A port's parsed schema together with the notation it was declared in.
#[derive(Clone, Debug, PartialEq)]
pub struct PortType {
    schema: PortSchema,
    notation: Value,
}

impl PortType {
    pub fn new(schema: PortSchema) -> Self {
        Self {
            notation: schema.to_value(),
            schema,
        }
    }

    pub fn parse(notation: Value) -> Result<Self, String> {
        let schema = PortSchema::parse(&notation)?;
        Ok(Self { schema, notation })
    }

    pub fn schema(&self) -> &PortSchema {
        &self.schema
    }

    pub fn notation(&self) -> &Value {
        &self.notation
    }
}

impl From<PortSchema> for PortType {
    fn from(schema: PortSchema) -> Self {
        Self::new(schema)
    }
}

impl Serialize for PortType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.notation.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PortType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let notation = Value::deserialize(deserializer)?;
        Self::parse(notation).map_err(D::Error::custom)
    }
}
