//! Records, their layouts, and the property images carried on the wire.

use crate::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Long(_) => Some(ValueKind::Long),
            Value::Double(_) => Some(ValueKind::Double),
            Value::String(_) => Some(ValueKind::String),
            Value::Bytes(_) => Some(ValueKind::Bytes),
        }
    }

    /// Orders values of the same kind; integers compare across widths and
    /// `Null` sorts first. Mismatched kinds are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Long(b)) => Some(i64::from(*a).cmp(b)),
            (Value::Long(a), Value::Int(b)) => Some(a.cmp(&i64::from(*b))),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Long,
    Double,
    String,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub primary_key: bool,
}

/// Shape of a record type as one side of the session knows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLayout {
    type_name: String,
    properties: Vec<PropertyDescriptor>,
}

impl RecordLayout {
    pub fn builder(type_name: impl Into<String>) -> RecordLayoutBuilder {
        RecordLayoutBuilder {
            type_name: type_name.into(),
            properties: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|property| property.name == name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn primary_key(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter().filter(|property| property.primary_key)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.property(name)
            .map(|property| property.primary_key)
            .unwrap_or(false)
    }

    pub fn equal_layouts(&self, other: &RecordLayout) -> bool {
        self == other
    }
}

pub struct RecordLayoutBuilder {
    type_name: String,
    properties: Vec<PropertyDescriptor>,
}

impl RecordLayoutBuilder {
    pub fn key(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.push(name.into(), kind, true)
    }

    pub fn property(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.push(name.into(), kind, false)
    }

    fn push(mut self, name: String, kind: ValueKind, primary_key: bool) -> Self {
        self.properties.push(PropertyDescriptor {
            name,
            kind,
            primary_key,
        });
        self
    }

    pub fn build(self) -> Result<RecordLayout> {
        if self.type_name.is_empty() {
            return Err(RepositoryError::illegal_state("record type needs a name"));
        }
        if !self.properties.iter().any(|property| property.primary_key) {
            return Err(RepositoryError::illegal_state(format!(
                "record type {} has no primary key",
                self.type_name
            )));
        }
        let mut seen = BTreeSet::new();
        for property in &self.properties {
            if !seen.insert(property.name.as_str()) {
                return Err(RepositoryError::illegal_state(format!(
                    "record type {} declares {} twice",
                    self.type_name, property.name
                )));
            }
        }
        Ok(RecordLayout {
            type_name: self.type_name,
            properties: self.properties,
        })
    }
}

/// Property values of one record as carried across a pipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordImage {
    pub values: BTreeMap<String, Value>,
}

impl RecordImage {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    layout: Arc<RecordLayout>,
    values: BTreeMap<String, Value>,
    dirty: BTreeSet<String>,
}

impl Record {
    pub fn new(layout: Arc<RecordLayout>) -> Self {
        Self {
            layout,
            values: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    pub fn type_name(&self) -> &str {
        self.layout.type_name()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let Some(property) = self.layout.property(name) else {
            return Err(RepositoryError::illegal_state(format!(
                "{} has no property {name}",
                self.layout.type_name()
            )));
        };
        let value = value.into();
        if let Some(kind) = value.kind() {
            if kind != property.kind {
                return Err(RepositoryError::illegal_state(format!(
                    "property {name} expects {:?}, got {kind:?}",
                    property.kind
                )));
            }
        }
        self.values.insert(name.to_string(), value);
        self.dirty.insert(name.to_string());
        Ok(())
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        match self.get(name) {
            Some(Value::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Long(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(Value::Double(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name)
    }

    pub fn dirty_properties(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    pub fn mark_all_clean(&mut self) {
        self.dirty.clear();
    }

    pub fn primary_key(&self) -> Result<Vec<Value>> {
        self.layout
            .primary_key()
            .map(|property| {
                self.values.get(&property.name).cloned().ok_or_else(|| {
                    RepositoryError::illegal_state(format!(
                        "primary key property {} of {} is not set",
                        property.name,
                        self.layout.type_name()
                    ))
                })
            })
            .collect()
    }

    /// Every value this record holds.
    pub fn image(&self) -> RecordImage {
        self.image_where(|_| true)
    }

    pub fn image_where<F>(&self, mut include: F) -> RecordImage
    where
        F: FnMut(&str) -> bool,
    {
        RecordImage {
            values: self
                .values
                .iter()
                .filter(|(name, _)| include(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }

    /// Overwrites the properties present in `image` that this layout knows,
    /// leaving the rest untouched, and marks the record clean.
    pub fn load_image(&mut self, image: RecordImage) {
        for (name, value) in image.values {
            if self.layout.has_property(&name) {
                self.values.insert(name, value);
            }
        }
        self.dirty.clear();
    }

    pub fn from_image(layout: Arc<RecordLayout>, image: RecordImage) -> Self {
        let mut record = Record::new(layout);
        record.load_image(image);
        record
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.type_name() == other.type_name() && self.values == other.values
    }
}
