//! Item schema: every configuration key the service knows, its type, scope,
//! default and environment binding.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use super::items;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Loaded from the environment at boot and read-only afterwards.
    System,
    /// Changeable through the configuration API.
    User,
}

pub const AUTH_MODES: &[&str] = &["db_auth", "ldap_auth", "uaa_auth", "http_auth", "oidc_auth"];
pub const PROJECT_CREATION_RESTRICTIONS: &[&str] = &["adminonly", "everyone"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    String,
    NonEmptyString,
    Int,
    Int64,
    Float64,
    Bool,
    Port,
    Duration,
    Password,
    Map,
    StringToStringMap,
    LdapScope,
    ProjectCreationRestriction,
    AuthMode,
    Quota,
}

impl ItemType {
    /// Check a raw string without keeping the parsed value.
    pub fn validate(self, raw: &str) -> Result<(), String> {
        self.parse(raw).map(|_| ())
    }

    /// Parse a raw string into its typed JSON form.
    pub fn parse(self, raw: &str) -> Result<Value, String> {
        match self {
            ItemType::String | ItemType::Password => Ok(Value::String(raw.to_string())),
            ItemType::NonEmptyString => {
                if raw.trim().is_empty() {
                    Err("value can not be empty".into())
                } else {
                    Ok(Value::String(raw.to_string()))
                }
            }
            ItemType::Int => raw
                .trim()
                .parse::<i32>()
                .map(Value::from)
                .map_err(|e| format!("{raw:?} is not an int: {e}")),
            ItemType::Int64 => parse_i64(raw).map(Value::from),
            ItemType::Float64 => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .ok_or_else(|| format!("{raw:?} is not a float")),
            ItemType::Bool => parse_bool(raw).map(Value::Bool),
            ItemType::Port => {
                let port = parse_i64(raw)?;
                if (1..=65535).contains(&port) {
                    Ok(Value::from(port))
                } else {
                    Err(format!("port {port} is out of range [1, 65535]"))
                }
            }
            ItemType::Duration => parse_duration(raw).map(|_| Value::String(raw.trim().to_string())),
            ItemType::Map => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Ok(Value::Object(map)),
                Ok(_) => Err(format!("{raw:?} is not a JSON object")),
                Err(e) => Err(format!("{raw:?} is not a JSON object: {e}")),
            },
            ItemType::StringToStringMap => {
                if raw.trim().is_empty() {
                    return Ok(json!({}));
                }
                serde_json::from_str::<BTreeMap<String, String>>(raw)
                    .map(|m| json!(m))
                    .map_err(|e| format!("{raw:?} is not a string map: {e}"))
            }
            ItemType::LdapScope => {
                let scope = parse_i64(raw)?;
                if (0..=2).contains(&scope) {
                    Ok(Value::from(scope))
                } else {
                    Err(format!("ldap scope must be 0, 1 or 2, got {scope}"))
                }
            }
            ItemType::ProjectCreationRestriction => one_of(raw, PROJECT_CREATION_RESTRICTIONS),
            ItemType::AuthMode => one_of(raw, AUTH_MODES),
            ItemType::Quota => {
                let quota = parse_i64(raw)?;
                if quota == -1 || quota > 0 {
                    Ok(Value::from(quota))
                } else {
                    Err(format!("quota must be -1 or positive, got {quota}"))
                }
            }
        }
    }

    /// Value handed out when a stored string does not parse.
    pub fn zero(self) -> Value {
        match self {
            ItemType::Int | ItemType::Int64 | ItemType::Port | ItemType::LdapScope | ItemType::Quota => json!(0),
            ItemType::Float64 => json!(0.0),
            ItemType::Bool => json!(false),
            ItemType::Map | ItemType::StringToStringMap => json!({}),
            _ => json!(""),
        }
    }
}

fn parse_i64(raw: &str) -> Result<i64, String> {
    raw.trim()
        .parse::<i64>()
        .map_err(|e| format!("{raw:?} is not an integer: {e}"))
}

fn one_of(raw: &str, allowed: &[&str]) -> Result<Value, String> {
    if allowed.contains(&raw) {
        Ok(Value::String(raw.to_string()))
    } else {
        Err(format!("{raw:?} is not one of {}", allowed.join(", ")))
    }
}

/// Boolean spellings accepted by the environment and the API.
pub fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(format!("{other:?} is not a bool")),
    }
}

/// Parse durations like `90s`, `1h30m` or `250ms`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("{raw:?} is not a duration: {e}"))
}

#[derive(Debug, Clone)]
pub struct Item {
    pub name: &'static str,
    pub scope: Scope,
    pub group: &'static str,
    pub env_key: Option<&'static str>,
    pub default_value: &'static str,
    pub item_type: ItemType,
    pub editable: bool,
    pub description: &'static str,
}

/// Immutable item table, looked up by name.
#[derive(Debug)]
pub struct Registry {
    items: HashMap<&'static str, Item>,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    pub fn new(list: Vec<Item>) -> Self {
        Self {
            items: list.into_iter().map(|item| (item.name, item)).collect(),
        }
    }

    /// The process-wide registry over the built-in item list.
    pub fn global() -> Arc<Registry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Registry::new(items::all()))))
    }

    pub fn get(&self, name: &str) -> Option<&Item> {
        self.items.get(name)
    }

    pub fn item_type(&self, name: &str) -> Option<ItemType> {
        self.get(name).map(|item| item.item_type)
    }

    pub fn is_password(&self, name: &str) -> bool {
        self.item_type(name) == Some(ItemType::Password)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn in_scope(&self, scope: Scope) -> impl Iterator<Item = &Item> {
        self.items.values().filter(move |item| item.scope == scope)
    }

    pub fn in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Item> {
        self.items.values().filter(move |item| item.group == group)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
