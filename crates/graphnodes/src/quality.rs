use crate::config::{self, Config};
use async_trait::async_trait;
use chrono::Utc;
use graphcore::{NodeError, NodeHandler, StateUpdate, Value, WorkflowState};
use graphruntime::{HandlerFactory, HandlerMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Checks that a state field holds at least `min_items` entries.
///
/// Appends a record to `quality_checks` and sets `next_action` to the pass or
/// fail route, so a condition node can branch on the outcome.
pub struct QualityCheckHandler {
    check: String,
    field: String,
    min_items: usize,
    pass_route: String,
    fail_route: String,
}

impl QualityCheckHandler {
    pub fn new(check: impl Into<String>, field: impl Into<String>, min_items: usize) -> Self {
        Self {
            check: check.into(),
            field: field.into(),
            min_items,
            pass_route: "pass".to_string(),
            fail_route: "fail".to_string(),
        }
    }

    pub fn with_routes(mut self, pass: impl Into<String>, fail: impl Into<String>) -> Self {
        self.pass_route = pass.into();
        self.fail_route = fail.into();
        self
    }
}

fn item_count(value: Option<Value>) -> usize {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Array(items)) => items.len(),
        Some(Value::Object(map)) => map.len(),
        Some(Value::String(s)) => usize::from(!s.is_empty()),
        Some(_) => 1,
    }
}

#[async_trait]
impl NodeHandler for QualityCheckHandler {
    fn handler_type(&self) -> &str {
        "quality.check"
    }

    async fn handle(&self, state: Arc<WorkflowState>) -> Result<StateUpdate, NodeError> {
        let count = item_count(state.field(&self.field));
        let passed = count >= self.min_items;
        if !passed {
            tracing::warn!(
                "Quality check '{}' failed: {} has {} of {} required item(s)",
                self.check,
                self.field,
                count,
                self.min_items
            );
        }

        let mut record = BTreeMap::new();
        record.insert("check".to_string(), Value::from(self.check.as_str()));
        record.insert("field".to_string(), Value::from(self.field.as_str()));
        record.insert("count".to_string(), Value::from(count as i64));
        record.insert("passed".to_string(), Value::from(passed));
        record.insert("timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));

        let route = if passed {
            &self.pass_route
        } else {
            &self.fail_route
        };
        Ok(StateUpdate::new()
            .with("quality_checks", Value::Object(record))
            .with("next_action", route.as_str()))
    }
}

pub struct QualityCheckHandlerFactory;

impl HandlerFactory for QualityCheckHandlerFactory {
    fn handler_type(&self) -> &str {
        "quality.check"
    }

    fn create(&self, config: &Config) -> Result<Arc<dyn NodeHandler>, NodeError> {
        let field = config::string_or(config, "field", "results")?;
        let check = config::string(config, "name")?.unwrap_or_else(|| field.clone());
        let min_items = config::non_negative(config, "min_items")?.unwrap_or(1) as usize;
        let handler = QualityCheckHandler::new(check, field, min_items).with_routes(
            config::string_or(config, "pass_route", "pass")?,
            config::string_or(config, "fail_route", "fail")?,
        );
        Ok(Arc::new(handler))
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Require a minimum number of items in a state field".to_string(),
            category: "quality".to_string(),
        }
    }
}
