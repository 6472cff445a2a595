//! Typed identifier definitions.
//!
//! Agent, offer, framework and executor identifiers are assigned by the
//! resource manager. Task identifiers are minted by the scheduler (or by the
//! layer above it) and must be unique per framework.

use crate::define_id;

#[doc(hidden)]
pub use crate::macros::validate as __validate;
pub use crate::macros::MAX_ID_LEN;

// =============================================================================
// Assigned by the resource manager
// =============================================================================

define_id!(AgentId);
define_id!(OfferId);
define_id!(FrameworkId);
define_id!(ExecutorId);

// =============================================================================
// Assigned by the scheduler
// =============================================================================

define_id!(TaskId, "task");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_parse_valid() {
        let id: AgentId = "20170412-034853-1-0001-S0".parse().unwrap();
        assert_eq!(id.as_str(), "20170412-034853-1-0001-S0");
        assert_eq!(id.to_string(), "20170412-034853-1-0001-S0");
    }

    #[test]
    fn test_parse_empty() {
        let err = OfferId::parse("").unwrap_err();
        assert!(err.is_empty());
    }

    #[test]
    fn test_parse_whitespace() {
        let err = OfferId::parse("O 1").unwrap_err();
        assert_eq!(
            err,
            IdError::InvalidCharacter {
                character: ' ',
                position: 1
            }
        );
    }

    #[test]
    fn test_parse_too_long() {
        let raw = "x".repeat(MAX_ID_LEN + 1);
        assert!(matches!(
            FrameworkId::parse(&raw),
            Err(IdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_generate_task_id() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("task_"));
    }

    #[test]
    fn test_wire_shape() {
        let id = OfferId::parse("O42").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"value":"O42"}"#);

        let parsed: OfferId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_wire_rejects_empty_value() {
        let result: Result<AgentId, _> = serde_json::from_str(r#"{"value":""}"#);
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn prop_printable_ids_parse(raw in "[A-Za-z0-9._-]{1,64}") {
            let id = TaskId::parse(&raw).unwrap();
            prop_assert_eq!(id.as_str(), raw.as_str());
        }
    }
}
