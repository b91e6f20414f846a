//! Demo store modules shared by every process the CLI starts.
//!
//! Every process must register the same reducers, otherwise the Worker
//! refuses mutations a Renderer applied optimistically.

use serde_json::{json, Value};

use statesync_types::{ProcessId, StateReplica};

/// A replica with the `counter` and `todos` modules.
pub fn demo_replica(owner: ProcessId) -> StateReplica {
    let mut replica = StateReplica::new(owner);
    replica.insert_module("counter", json!({"value": 0}));
    replica.insert_module("todos", json!([]));

    replica.register("counter", "counter/increment", |state, payload| {
        let by = match payload.get("by") {
            None | Some(Value::Null) => 1,
            Some(by) => by.as_i64().ok_or("`by` must be an integer")?,
        };
        let value = state["value"].as_i64().unwrap_or(0);
        state["value"] = json!(value.saturating_add(by));
        Ok(())
    });
    replica.register("counter", "counter/reset", |state, _| {
        state["value"] = json!(0);
        Ok(())
    });
    replica.register("todos", "todos/add", |state, payload| {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or("todo needs a `text` string")?;
        todos(state)?.push(json!({"text": text, "done": false}));
        Ok(())
    });
    replica.register("todos", "todos/toggle", |state, payload| {
        let index = payload
            .get("index")
            .and_then(Value::as_u64)
            .ok_or("toggle needs an `index`")? as usize;
        let todo = todos(state)?
            .get_mut(index)
            .ok_or_else(|| format!("no todo at {}", index))?;
        let done = todo["done"].as_bool().unwrap_or(false);
        todo["done"] = json!(!done);
        Ok(())
    });
    replica
}

fn todos(state: &mut Value) -> Result<&mut Vec<Value>, String> {
    state
        .as_array_mut()
        .ok_or_else(|| "todos module is not a list".to_string())
}
