use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::processor::StageArgs;
use crate::source::SourceDescriptor;
use crate::{Error, Result};

/// Name under which the source descriptor is published before any stage runs.
pub const SOURCE_OUTPUT: &str = "source";

/// Outputs published so far in one pipeline run, by name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedOutputSet {
    values: BTreeMap<String, Value>,
}

impl NamedOutputSet {
    pub fn new(source: &SourceDescriptor) -> Result<Self> {
        let mut values = BTreeMap::new();
        values.insert(SOURCE_OUTPUT.to_string(), serde_json::to_value(source)?);
        Ok(Self { values })
    }

    pub fn publish(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// The published value for `name`, or `name` itself as a literal.
    pub fn resolve(&self, name: &str) -> Value {
        self.values
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::String(name.to_string()))
    }

    pub fn resolve_all(&self, names: &[String]) -> StageArgs {
        StageArgs::new(names.iter().map(|n| self.resolve(n)).collect())
    }

    /// Decodes a published output into a native type.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| Error::MissingOutput(name.to_string()))?;
        Ok(T::deserialize(value)?)
    }

    pub fn source(&self) -> Result<SourceDescriptor> {
        self.get_as(SOURCE_OUTPUT)
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.values
    }
}
