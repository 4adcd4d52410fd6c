use graphcore::{NodeError, StateUpdate, Value};
use std::collections::BTreeMap;

pub(crate) type Config = BTreeMap<String, Value>;

pub(crate) fn string(config: &Config, key: &str) -> Result<Option<String>, NodeError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(invalid(key, "a string", other)),
    }
}

pub(crate) fn string_or(config: &Config, key: &str, default: &str) -> Result<String, NodeError> {
    Ok(string(config, key)?.unwrap_or_else(|| default.to_string()))
}

pub(crate) fn non_negative(config: &Config, key: &str) -> Result<Option<u64>, NodeError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_i64() {
            Some(n) if n >= 0 => Ok(Some(n as u64)),
            _ => Err(invalid(key, "a non-negative integer", value)),
        },
    }
}

/// Optional object of field name to value, used as a state update
pub(crate) fn fields(config: &Config, key: &str) -> Result<StateUpdate, NodeError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(StateUpdate::new()),
        Some(Value::Object(map)) => Ok(StateUpdate::from(map.clone())),
        Some(other) => Err(invalid(key, "an object", other)),
    }
}

fn invalid(key: &str, expected: &str, actual: &Value) -> NodeError {
    NodeError::Configuration(format!(
        "'{}' must be {}, got {}",
        key,
        expected,
        actual.kind()
    ))
}
