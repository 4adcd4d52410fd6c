use crate::{StateError, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub type InstanceId = Uuid;

/// Fields folded with `Operator::Append` when a node result is applied
pub const SEQUENCE_FIELDS: &[&str] = &[
    "tasks",
    "completed_tasks",
    "failed_tasks",
    "results",
    "files_created",
    "files_modified",
    "debate_results",
    "quality_checks",
    "errors",
];

/// Fields folded with `Operator::Merge` when a node result is applied
pub const MAPPING_FIELDS: &[&str] = &["user_context", "agent_assignments", "agent_outputs"];

/// Rule used to fold an update value into the current value of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Replace the value
    Override,
    /// Extend the sequence with an array, or push any other value
    Append,
    /// Shallow key union, the update wins on conflicts
    Merge,
    /// Numeric add
    Increment,
}

impl Operator {
    /// The reducer a field uses when a node result is folded into state.
    pub fn for_field(field: &str) -> Operator {
        if SEQUENCE_FIELDS.contains(&field) {
            Operator::Append
        } else if MAPPING_FIELDS.contains(&field) {
            Operator::Merge
        } else {
            Operator::Override
        }
    }

    /// Combine `current` (absent or null when the field was never written) with `incoming`.
    pub fn apply(
        self,
        field: &str,
        current: Option<Value>,
        incoming: Value,
    ) -> Result<Value, StateError> {
        let current = current.filter(|v| !v.is_null());
        match self {
            Operator::Override => Ok(incoming),
            Operator::Append => {
                let mut items = match current {
                    None => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(other) => return Err(mismatch(field, "array", &other)),
                };
                match incoming {
                    Value::Array(more) => items.extend(more),
                    single => items.push(single),
                }
                Ok(Value::Array(items))
            }
            Operator::Merge => {
                let mut map = match current {
                    None => BTreeMap::new(),
                    Some(Value::Object(map)) => map,
                    Some(other) => return Err(mismatch(field, "object", &other)),
                };
                match incoming {
                    Value::Object(more) => map.extend(more),
                    other => return Err(mismatch(field, "object", &other)),
                }
                Ok(Value::Object(map))
            }
            Operator::Increment => {
                let base = match current {
                    None => 0.0,
                    Some(Value::Number(n)) => n,
                    Some(other) => return Err(mismatch(field, "number", &other)),
                };
                let delta = incoming
                    .as_f64()
                    .ok_or_else(|| mismatch(field, "number", &incoming))?;
                Ok(Value::Number(base + delta))
            }
        }
    }
}

fn mismatch(field: &str, expected: &str, actual: &Value) -> StateError {
    StateError::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        actual: actual.kind().to_string(),
    }
}

/// Error entry accumulated in `WorkflowState::errors`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub node: String,
    #[serde(alias = "error")]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("node".to_string(), Value::from(self.node.as_str()));
        map.insert("message".to_string(), Value::from(self.message.as_str()));
        map.insert("timestamp".to_string(), Value::from(self.timestamp.to_rfc3339()));
        Value::Object(map)
    }
}

/// Shared state that flows through every node of one instance.
///
/// Every field is addressable by name through [`WorkflowState::field`] and
/// [`WorkflowState::set_field`]; names that are not typed fields live in
/// `extensions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    // Identity
    pub instance_id: InstanceId,
    pub template_id: String,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub current_node: String,

    // Input
    pub user_request: String,
    pub user_context: BTreeMap<String, Value>,

    // Task bookkeeping
    pub tasks: Vec<Value>,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,

    // Per-node outputs
    pub agent_assignments: BTreeMap<String, Value>,
    pub agent_outputs: BTreeMap<String, Value>,

    // Results and artifacts
    pub results: Vec<Value>,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,

    // Collaboration
    pub debate_results: Vec<Value>,
    pub quality_checks: Vec<Value>,

    pub errors: Vec<ErrorRecord>,

    // Counters
    pub retry_count: i64,
    pub total_tokens_used: i64,
    pub execution_time_ms: i64,

    // Control
    pub next_action: Option<String>,
    pub should_continue: bool,

    /// Template-specific keys
    pub extensions: BTreeMap<String, Value>,
}

impl WorkflowState {
    pub fn new(instance_id: InstanceId, template_id: impl Into<String>) -> Self {
        Self {
            instance_id,
            template_id: template_id.into(),
            project_id: String::new(),
            started_at: Utc::now(),
            current_node: String::new(),
            user_request: String::new(),
            user_context: BTreeMap::new(),
            tasks: Vec::new(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            agent_assignments: BTreeMap::new(),
            agent_outputs: BTreeMap::new(),
            results: Vec::new(),
            files_created: Vec::new(),
            files_modified: Vec::new(),
            debate_results: Vec::new(),
            quality_checks: Vec::new(),
            errors: Vec::new(),
            retry_count: 0,
            total_tokens_used: 0,
            execution_time_ms: 0,
            next_action: None,
            should_continue: true,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_request(mut self, user_request: impl Into<String>) -> Self {
        self.user_request = user_request.into();
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.user_context = context;
        self
    }

    /// Read a field by name. Unknown names are looked up in `extensions`.
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "instance_id" => Value::from(self.instance_id.to_string()),
            "template_id" => Value::from(self.template_id.as_str()),
            "project_id" => Value::from(self.project_id.as_str()),
            "started_at" => Value::from(self.started_at.to_rfc3339()),
            "current_node" => Value::from(self.current_node.as_str()),
            "user_request" => Value::from(self.user_request.as_str()),
            "user_context" => Value::Object(self.user_context.clone()),
            "tasks" => Value::Array(self.tasks.clone()),
            "completed_tasks" => strings_to_value(&self.completed_tasks),
            "failed_tasks" => strings_to_value(&self.failed_tasks),
            "agent_assignments" => Value::Object(self.agent_assignments.clone()),
            "agent_outputs" => Value::Object(self.agent_outputs.clone()),
            "results" => Value::Array(self.results.clone()),
            "files_created" => strings_to_value(&self.files_created),
            "files_modified" => strings_to_value(&self.files_modified),
            "debate_results" => Value::Array(self.debate_results.clone()),
            "quality_checks" => Value::Array(self.quality_checks.clone()),
            "errors" => Value::Array(self.errors.iter().map(ErrorRecord::to_value).collect()),
            "retry_count" => Value::from(self.retry_count),
            "total_tokens_used" => Value::from(self.total_tokens_used),
            "execution_time_ms" => Value::from(self.execution_time_ms),
            "next_action" => Value::from(self.next_action.clone()),
            "should_continue" => Value::from(self.should_continue),
            other => return self.extensions.get(other).cloned(),
        };
        Some(value)
    }

    /// Write a field by name, checking the value against the field's type.
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<(), StateError> {
        match name {
            "instance_id" | "started_at" => {
                return Err(StateError::ReadOnlyField(name.to_string()));
            }
            "template_id" => self.template_id = expect_string(name, value)?,
            "project_id" => self.project_id = expect_string(name, value)?,
            "current_node" => self.current_node = expect_string(name, value)?,
            "user_request" => self.user_request = expect_string(name, value)?,
            "user_context" => self.user_context = expect_object(name, value)?,
            "tasks" => self.tasks = expect_array(name, value)?,
            "completed_tasks" => self.completed_tasks = expect_strings(name, value)?,
            "failed_tasks" => self.failed_tasks = expect_strings(name, value)?,
            "agent_assignments" => self.agent_assignments = expect_object(name, value)?,
            "agent_outputs" => self.agent_outputs = expect_object(name, value)?,
            "results" => self.results = expect_array(name, value)?,
            "files_created" => self.files_created = expect_strings(name, value)?,
            "files_modified" => self.files_modified = expect_strings(name, value)?,
            "debate_results" => self.debate_results = expect_array(name, value)?,
            "quality_checks" => self.quality_checks = expect_array(name, value)?,
            "errors" => {
                self.errors = expect_array(name, value)?
                    .into_iter()
                    .map(|item| {
                        serde_json::from_value::<ErrorRecord>(item.to_json())
                            .map_err(|_| mismatch(name, "error record", &item))
                    })
                    .collect::<Result<_, _>>()?;
            }
            "retry_count" => self.retry_count = expect_counter(name, value)?,
            "total_tokens_used" => self.total_tokens_used = expect_counter(name, value)?,
            "execution_time_ms" => self.execution_time_ms = expect_counter(name, value)?,
            "next_action" => {
                self.next_action = match value {
                    Value::Null => None,
                    Value::String(s) => Some(s),
                    other => return Err(mismatch(name, "string or null", &other)),
                };
            }
            "should_continue" => {
                self.should_continue = value
                    .as_bool()
                    .ok_or_else(|| mismatch(name, "bool", &value))?;
            }
            other => {
                self.extensions.insert(other.to_string(), value);
            }
        }
        Ok(())
    }

    /// Produce a new snapshot with every field of `update` folded in.
    ///
    /// With `operator == None` each field uses its own reducer
    /// ([`Operator::for_field`]). Fails without touching `self` if any field
    /// rejects its value.
    pub fn apply(
        &self,
        update: &StateUpdate,
        operator: Option<Operator>,
    ) -> Result<WorkflowState, StateError> {
        let mut next = self.clone();
        for (field, value) in update.iter() {
            let op = operator.unwrap_or_else(|| Operator::for_field(field));
            let folded = op.apply(field, next.field(field), value.clone())?;
            next.set_field(field, folded)?;
        }
        Ok(next)
    }

    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new(Uuid::new_v4(), "")
    }
}

fn strings_to_value(items: &[String]) -> Value {
    Value::Array(items.iter().map(|s| Value::from(s.as_str())).collect())
}

fn expect_string(field: &str, value: Value) -> Result<String, StateError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(mismatch(field, "string", &other)),
    }
}

fn expect_array(field: &str, value: Value) -> Result<Vec<Value>, StateError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(mismatch(field, "array", &other)),
    }
}

fn expect_object(field: &str, value: Value) -> Result<BTreeMap<String, Value>, StateError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(mismatch(field, "object", &other)),
    }
}

fn expect_strings(field: &str, value: Value) -> Result<Vec<String>, StateError> {
    expect_array(field, value)?
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            other => Err(mismatch(field, "array of strings", &other)),
        })
        .collect()
}

fn expect_counter(field: &str, value: Value) -> Result<i64, StateError> {
    value
        .as_i64()
        .ok_or_else(|| mismatch(field, "integer", &value))
}

/// Partial state: field name to new value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateUpdate {
    fields: BTreeMap<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for StateUpdate {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }
}

impl FromIterator<(String, Value)> for StateUpdate {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Saved snapshot, restorable through [`StateManager::rollback`]
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub version: u64,
    pub state: Arc<WorkflowState>,
    pub created_at: DateTime<Utc>,
}

/// Owns the state of one instance.
///
/// Snapshots are immutable: every update builds a new `Arc<WorkflowState>`
/// and bumps the version. Holders of an older snapshot never observe later
/// writes.
#[derive(Debug)]
pub struct StateManager {
    state: Arc<WorkflowState>,
    version: u64,
    checkpoints: Vec<Checkpoint>,
}

impl StateManager {
    pub fn new(initial_state: WorkflowState) -> Self {
        Self {
            state: Arc::new(initial_state),
            version: 0,
            checkpoints: Vec::new(),
        }
    }

    pub fn state(&self) -> Arc<WorkflowState> {
        Arc::clone(&self.state)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply `update` with a single operator for every field.
    pub fn update(
        &mut self,
        update: &StateUpdate,
        operator: Operator,
    ) -> Result<Arc<WorkflowState>, StateError> {
        let next = self.state.apply(update, Some(operator))?;
        Ok(self.install(next))
    }

    /// Fold a node result into state using each field's reducer.
    pub fn apply_result(&mut self, update: &StateUpdate) -> Result<Arc<WorkflowState>, StateError> {
        let next = self.state.apply(update, None)?;
        Ok(self.install(next))
    }

    /// Override a single field.
    pub fn set(
        &mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Arc<WorkflowState>, StateError> {
        let update = StateUpdate::new().with(field, value);
        self.update(&update, Operator::Override)
    }

    /// Push the current snapshot; returns the version it was taken at.
    pub fn checkpoint(&mut self) -> u64 {
        self.checkpoints.push(Checkpoint {
            version: self.version,
            state: Arc::clone(&self.state),
            created_at: Utc::now(),
        });
        self.version
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// Restore the `steps`-th most recent checkpoint and drop it together
    /// with everything taken after it.
    ///
    /// With `n` checkpoints this restores the one at index `n - steps`. Fewer
    /// than `steps` checkpoints leaves state and stack untouched.
    pub fn rollback(&mut self, steps: usize) -> Result<Arc<WorkflowState>, StateError> {
        let available = self.checkpoints.len();
        if steps > available {
            return Err(StateError::InsufficientCheckpoints {
                requested: steps,
                available,
            });
        }
        if steps == 0 {
            return Ok(self.state());
        }

        let target = available - steps;
        let restored = Arc::clone(&self.checkpoints[target].state);
        self.checkpoints.truncate(target);
        self.state = restored;
        self.version += 1;
        tracing::debug!(
            "Rolled back {} checkpoint(s) to version {}",
            steps,
            self.version
        );
        Ok(self.state())
    }

    pub fn into_state(self) -> Arc<WorkflowState> {
        self.state
    }

    fn install(&mut self, next: WorkflowState) -> Arc<WorkflowState> {
        self.state = Arc::new(next);
        self.version += 1;
        self.state()
    }
}
