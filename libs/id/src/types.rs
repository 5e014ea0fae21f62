//! Typed ID definitions.

use crate::define_id;

define_id!(NodeId, "node");
define_id!(ContainerId, "ctr");
define_id!(SessionId, "ses");
define_id!(UserId, "usr");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("node_"));
    }

    #[test]
    fn test_invalid_prefix() {
        let result: Result<NodeId, _> = "ctr_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.unwrap_err().is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<SessionId, _> = "ses01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        let result: Result<UserId, _> = "".parse();
        assert_eq!(result.unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<ContainerId, _> = "ctr_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_container_id_is_valid_runtime_name() {
        // Runtime names must match [a-zA-Z0-9][a-zA-Z0-9_.-]+
        let name = ContainerId::new().to_string();
        let mut chars = name.chars();
        assert!(chars.next().unwrap().is_ascii_alphanumeric());
        assert!(chars.all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c)));
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [
            NodeId::PREFIX,
            ContainerId::PREFIX,
            SessionId::PREFIX,
            UserId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_user_id_roundtrip(raw in any::<u128>()) {
            let id = UserId::from_ulid(crate::Ulid(raw));
            let parsed: UserId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
