//! The per-execution context object addressed by `$$` paths.
//!
//! `ExecutionContext` is a copy-on-write JSON document: cloning it is an
//! `Arc` bump, and the first mutation on a shared copy detaches it. Each
//! Parallel branch and Map iteration gets its own clone, so sibling writes
//! (state name, retry count, item index) are never observable across branches.

use std::sync::Arc;

use aslrun_types::execution::ExecutionId;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};

/// Account placeholder used in the synthesized ARNs.
const LOCAL_ACCOUNT: &str = "000000000000";

/// Current time in the RFC 3339 form used throughout the context object.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    value: Arc<Value>,
}

impl ExecutionContext {
    /// Build the context for a new execution.
    ///
    /// `seed` is merged over the generated document: object sections merge
    /// key by key, any other value replaces the generated one.
    pub fn new(
        execution_id: ExecutionId,
        state_machine_name: &str,
        input: &Value,
        seed: Option<&Value>,
    ) -> Self {
        let state_machine_arn =
            format!("arn:aws:states:local:{LOCAL_ACCOUNT}:stateMachine:{state_machine_name}");
        let mut value = json!({
            "Execution": {
                "Id": format!(
                    "arn:aws:states:local:{LOCAL_ACCOUNT}:execution:{state_machine_name}:{execution_id}"
                ),
                "Input": input,
                "Name": execution_id.to_string(),
                "RoleArn": format!("arn:aws:iam::{LOCAL_ACCOUNT}:role/aslrun"),
                "StartTime": now_rfc3339(),
                "RedriveCount": 0,
            },
            "State": {},
            "StateMachine": {
                "Id": state_machine_arn,
                "Name": state_machine_name,
            },
        });

        if let Some(Value::Object(seed)) = seed {
            merge_sections(&mut value, seed);
        }

        Self {
            value: Arc::new(value),
        }
    }

    /// Wrap an existing document without adding generated fields.
    pub fn from_value(value: Value) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Record entry into a state: `State.Name`, `State.EnteredTime`, and a
    /// retry count of zero. Clears any `Task` section from a previous state.
    pub fn enter_state(&mut self, name: &str) {
        let state = json!({
            "EnteredTime": now_rfc3339(),
            "Name": name,
            "RetryCount": 0,
        });
        let root = self.root_mut();
        root.insert("State".into(), state);
        root.remove("Task");
    }

    pub fn set_retry_count(&mut self, count: u32) {
        if let Some(Value::Object(state)) = self.root_mut().get_mut("State") {
            state.insert("RetryCount".into(), Value::from(count));
        }
    }

    /// Issue a fresh `Task.Token` for the current Task invocation.
    pub fn issue_task_token(&mut self) {
        let token = uuid::Uuid::new_v4().to_string();
        self.root_mut()
            .insert("Task".into(), json!({ "Token": token }));
    }

    /// A private copy for one Map iteration, carrying `Map.Item.Index/Value`.
    pub fn for_map_item(&self, index: usize, item: &Value) -> Self {
        let mut ctx = self.clone();
        ctx.root_mut().insert(
            "Map".into(),
            json!({ "Item": { "Index": index, "Value": item } }),
        );
        ctx
    }

    fn root_mut(&mut self) -> &mut Map<String, Value> {
        let value = Arc::make_mut(&mut self.value);
        if !value.is_object() {
            *value = Value::Object(Map::new());
        }
        match value {
            Value::Object(map) => map,
            _ => unreachable!("context root is always an object"),
        }
    }
}

fn merge_sections(target: &mut Value, seed: &Map<String, Value>) {
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in seed {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                existing.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
