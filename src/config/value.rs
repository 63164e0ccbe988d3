//! A configuration value kept in its canonical string form.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::error;

use super::metadata::{parse_bool, parse_duration, ItemType, Registry};
use super::ConfigError;

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValue {
    pub name: String,
    pub value: String,
    item_type: Option<ItemType>,
}

impl ConfigValue {
    /// Validate `value` against the item's type.
    pub fn new(registry: &Registry, name: &str, value: &str) -> Result<Self, ConfigError> {
        let item = registry
            .get(name)
            .ok_or_else(|| ConfigError::UnknownItem(name.to_string()))?;
        item.item_type
            .validate(value)
            .map_err(|reason| ConfigError::Validation {
                name: name.to_string(),
                reason,
            })?;
        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
            item_type: Some(item.item_type),
        })
    }

    /// Keep `value` without validation. Used for defaults and stored data.
    pub fn unchecked(registry: &Registry, name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            item_type: registry.item_type(name),
        }
    }

    pub fn item_type(&self) -> Option<ItemType> {
        self.item_type
    }

    /// Parse through the item type; unknown items and unparsable values
    /// give the type's zero value.
    pub fn typed(&self) -> Value {
        let Some(t) = self.item_type else {
            error!("config item {} is not registered", self.name);
            return Value::Null;
        };
        match t.parse(&self.value) {
            Ok(v) => v,
            Err(e) => {
                error!("config item {} holds an invalid value: {}", self.name, e);
                t.zero()
            }
        }
    }

    pub fn get_string(&self) -> String {
        self.value.clone()
    }

    pub fn get_password(&self) -> String {
        self.value.clone()
    }

    pub fn get_int(&self) -> i32 {
        self.typed().as_i64().and_then(|v| i32::try_from(v).ok()).unwrap_or(0)
    }

    pub fn get_int64(&self) -> i64 {
        self.typed().as_i64().unwrap_or(0)
    }

    pub fn get_float64(&self) -> f64 {
        self.typed().as_f64().unwrap_or(0.0)
    }

    pub fn get_bool(&self) -> bool {
        match self.item_type {
            Some(_) => self.typed().as_bool().unwrap_or(false),
            None => {
                error!("config item {} is not registered", self.name);
                parse_bool(&self.value).unwrap_or(false)
            }
        }
    }

    pub fn get_duration(&self) -> Duration {
        match parse_duration(&self.value) {
            Ok(d) => d,
            Err(e) => {
                error!("config item {} is not a duration: {}", self.name, e);
                Duration::ZERO
            }
        }
    }

    pub fn get_map(&self) -> Map<String, Value> {
        match self.typed() {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    pub fn get_string_to_string_map(&self) -> HashMap<String, String> {
        self.get_map()
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect()
    }
}

/// Canonical string form of a JSON value received over the API.
pub fn raw_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
