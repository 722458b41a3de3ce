//! The input reducer: a pure fold merging mapped input events for one run
//! into a single `{run, input, count}` record.
//!
//! Discipline:
//! - entries without a value (upstream emitted nothing for the field) are
//!   dropped and do not count toward completeness;
//! - a run-id mismatch between accumulator and entry is a protocol
//!   violation;
//! - a scalar field receiving a second value is a protocol violation;
//! - array fields append in arrival order;
//! - `count` increments on every accepted entry.

use crate::error::{ProtocolViolation, Result};
use crate::event::Run;
use crate::node::{InputSlot, InputValue, NodeInput};

/// One event mapped onto a target input field
#[derive(Debug, Clone)]
pub struct MappedInput {
    pub run: Run,
    pub target_field: String,
    /// Inherited from whether the binding was declared as an array
    pub is_array: bool,
    /// `None` models an undefined upstream value
    pub value: Option<InputValue>,
}

impl MappedInput {
    pub fn new(
        run: Run,
        target_field: impl Into<String>,
        is_array: bool,
        value: Option<InputValue>,
    ) -> Self {
        Self {
            run,
            target_field: target_field.into(),
            is_array,
            value,
        }
    }
}

impl NodeInput {
    /// Fold one mapped event into the accumulator.
    ///
    /// Returns `Ok(true)` when the entry was accepted, `Ok(false)` when it
    /// carried no value and was dropped.
    pub fn accept(&mut self, entry: MappedInput) -> Result<bool> {
        let Some(value) = entry.value else {
            return Ok(false);
        };

        match self.run() {
            Some(run) if run.id != entry.run.id => {
                return Err(ProtocolViolation::RunMismatch {
                    expected: run.id.clone(),
                    actual: entry.run.id,
                }
                .into());
            }
            Some(_) => {}
            None => self.set_run(entry.run),
        }

        match self.values_mut().get_mut(&entry.target_field) {
            None => {
                let slot = if entry.is_array {
                    InputSlot::Many(vec![value])
                } else {
                    InputSlot::One(value)
                };
                self.values_mut().insert(entry.target_field, slot);
            }
            Some(InputSlot::One(_)) => {
                return Err(ProtocolViolation::DuplicateScalar {
                    field: entry.target_field,
                }
                .into());
            }
            Some(InputSlot::Many(values)) => values.push(value),
        }

        self.bump_count();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    fn json_entry(run: &str, field: &str, is_array: bool, value: serde_json::Value) -> MappedInput {
        MappedInput::new(
            Run::with_id(run),
            field,
            is_array,
            Some(InputValue::Json(value)),
        )
    }

    #[test]
    fn test_scalar_then_duplicate_fails() {
        let mut acc = NodeInput::new();
        assert!(acc
            .accept(json_entry("r1", "v", false, serde_json::json!(1)))
            .unwrap());
        assert_eq!(acc.count(), 1);

        let err = acc
            .accept(json_entry("r1", "v", false, serde_json::json!(2)))
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::Protocol(ProtocolViolation::DuplicateScalar { ref field }) if field == "v"
        ));
    }

    #[test]
    fn test_array_appends_in_order() {
        let mut acc = NodeInput::new();
        acc.accept(json_entry("r1", "items", true, serde_json::json!("p")))
            .unwrap();
        acc.accept(json_entry("r1", "items", true, serde_json::json!("q")))
            .unwrap();

        assert_eq!(acc.count(), 2);
        let items = acc.json_array("items");
        assert_eq!(items, vec![&serde_json::json!("p"), &serde_json::json!("q")]);
    }

    #[test]
    fn test_undefined_is_dropped_without_counting() {
        let mut acc = NodeInput::new();
        let accepted = acc
            .accept(MappedInput::new(Run::with_id("r1"), "v", false, None))
            .unwrap();
        assert!(!accepted);
        assert_eq!(acc.count(), 0);
        assert!(acc.run().is_none());
    }

    #[test]
    fn test_run_mismatch_fails() {
        let mut acc = NodeInput::new();
        acc.accept(json_entry("r1", "a", false, serde_json::json!(1)))
            .unwrap();

        let err = acc
            .accept(json_entry("r2", "b", false, serde_json::json!(2)))
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::Protocol(ProtocolViolation::RunMismatch { .. })
        ));
    }

    #[test]
    fn test_run_is_stable_once_set() {
        let mut acc = NodeInput::new();
        acc.accept(json_entry("r1", "a", false, serde_json::json!(1)))
            .unwrap();
        acc.accept(json_entry("r1", "b", false, serde_json::json!(2)))
            .unwrap();
        assert_eq!(acc.run().unwrap().id, "r1");
        assert_eq!(acc.count(), 2);
    }

    #[test]
    fn test_json_null_is_a_value() {
        // JSON null is a real value, distinct from an absent field
        let mut acc = NodeInput::new();
        assert!(acc
            .accept(json_entry("r1", "v", false, serde_json::Value::Null))
            .unwrap());
        assert_eq!(acc.count(), 1);
    }
}
