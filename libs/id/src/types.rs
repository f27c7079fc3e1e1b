//! Typed ID definitions.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Tenant tree
// =============================================================================

define_id!(UserId, "usr");
define_id!(TeamId, "team");
define_id!(ProjectId, "prj");
define_id!(EnvId, "env");
define_id!(AppId, "app");

// =============================================================================
// Deployment and dispatch
// =============================================================================

define_id!(DeploymentId, "dep");
define_id!(NodeId, "node");
define_id!(TaskId, "task");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");

/// Splits `s` into prefix and ULID and checks the prefix.
#[doc(hidden)]
pub fn split_prefixed(s: &str, expected: &'static str) -> Result<crate::Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let Some((prefix, ulid_str)) = s.split_once('_') else {
        return Err(IdError::MissingSeparator);
    };

    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }

    ulid_str
        .parse::<crate::Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}

/// Returns the prefix of a rendered ID without validating the ULID part.
pub fn prefix_of(s: &str) -> Result<&str, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    s.split_once('_')
        .map(|(prefix, _)| prefix)
        .ok_or(IdError::MissingSeparator)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_team_id_roundtrip() {
        let id = TeamId::new();
        let parsed: TeamId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("team_"));
    }

    #[test]
    fn test_invalid_prefix() {
        let result: Result<TeamId, _> = "app_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::InvalidPrefix { .. })));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<AppId, _> = "app01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), IdError::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        let result: Result<NodeId, _> = "".parse();
        assert_eq!(result.unwrap_err(), IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<DeploymentId, _> = "dep_invalid".parse();
        assert!(matches!(result, Err(IdError::InvalidUlid(_))));
    }

    #[test]
    fn test_json_roundtrip() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = EnvId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EnvId::new();
        assert!(first < second);
        assert!(first.to_string() < second.to_string());
    }

    #[test]
    fn test_prefix_of() {
        assert_eq!(prefix_of("prj_01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap(), "prj");
        assert_eq!(prefix_of("nope").unwrap_err(), IdError::MissingSeparator);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [
            UserId::PREFIX,
            TeamId::PREFIX,
            ProjectId::PREFIX,
            EnvId::PREFIX,
            AppId::PREFIX,
            DeploymentId::PREFIX,
            NodeId::PREFIX,
            TaskId::PREFIX,
            RequestId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn string_order_matches_ulid_order(a in any::<u128>(), b in any::<u128>()) {
            let x = AppId::from_ulid(crate::Ulid(a));
            let y = AppId::from_ulid(crate::Ulid(b));
            prop_assert_eq!(x.cmp(&y), x.to_string().cmp(&y.to_string()));
        }
    }
}
