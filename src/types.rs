//! # Host Data-Model Contract
//!
//! Minimal view of the host's dynamic type system. The host constructs and
//! converts its own rich runtime-described types; this endpoint only ever
//! needs a type's name (topic and service compatibility is name equality)
//! and the JSON rendering of a value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A runtime-described message or service type, identified by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicType {
    name: String,
}

impl DynamicType {
    /// Create a type with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The type name used for wire-level compatibility checks
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A dynamically typed value: a type name plus its JSON rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicValue {
    type_name: String,
    data: Value,
}

impl DynamicValue {
    /// Create a value of the named type from its JSON rendering
    pub fn new(type_name: impl Into<String>, data: Value) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }

    /// The name of this value's type
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The JSON rendering of this value
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Consume the value, returning its JSON rendering
    pub fn into_data(self) -> Value {
        self.data
    }

    /// Look up a top-level field of a struct-like value
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}
