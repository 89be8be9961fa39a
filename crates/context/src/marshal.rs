//! Safe marshalling of arbitrary request/response values for storage.
//!
//! Traversal is iterative with an explicit stack and a hard depth bound,
//! so adversarially deep (or, through shared handles, effectively cyclic)
//! structures are rejected with `CyclicValue` instead of looping or
//! overflowing the stack.

use serde_json::Value;

use agentmesh_core::error::ContextError;

/// Maximum nesting depth accepted by the marshaller.
pub const MAX_DEPTH: usize = 128;

/// Verify a value is storable: bounded depth, finite.
pub fn check_value(value: &Value) -> Result<(), ContextError> {
    let mut stack: Vec<(&Value, usize)> = vec![(value, 0)];

    while let Some((node, depth)) = stack.pop() {
        if depth > MAX_DEPTH {
            return Err(ContextError::CyclicValue { depth });
        }
        match node {
            Value::Array(items) => {
                for item in items {
                    stack.push((item, depth + 1));
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    stack.push((item, depth + 1));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Serialize a value for storage after checking it.
pub fn encode(value: &Value) -> Result<String, ContextError> {
    check_value(value)?;
    serde_json::to_string(value).map_err(|e| ContextError::Storage(e.to_string()))
}
