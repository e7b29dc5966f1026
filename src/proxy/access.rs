//! Access control for tool calls.
//!
//! A backend has at most one of a whitelist or a blacklist. The same policy
//! gates `tools/call` and filters `tools/list`, so a client never sees a
//! tool it cannot call.

use std::collections::HashSet;

use serde_json::Value;

use super::errors::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    #[default]
    Unrestricted,
    /// Only the named tools are permitted. An empty set permits nothing.
    Whitelist(HashSet<String>),
    /// Every tool except the named ones is permitted.
    Blacklist(HashSet<String>),
}

impl AccessPolicy {
    /// Build the policy for `backend`; supplying both lists is a conflict,
    /// even when one of them is empty.
    pub fn resolve(
        backend: &str,
        whitelist: Option<&[String]>,
        blacklist: Option<&[String]>,
    ) -> Result<Self, ProxyError> {
        match (whitelist, blacklist) {
            (Some(_), Some(_)) => Err(ProxyError::PolicyConflict {
                backend: backend.to_string(),
            }),
            (Some(allowed), None) => Ok(Self::Whitelist(allowed.iter().cloned().collect())),
            (None, Some(denied)) => Ok(Self::Blacklist(denied.iter().cloned().collect())),
            (None, None) => Ok(Self::Unrestricted),
        }
    }

    pub fn permits(&self, tool: &str) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Whitelist(allowed) => allowed.contains(tool),
            Self::Blacklist(denied) => !denied.contains(tool),
        }
    }

    /// Drop non-permitted entries from a `tools/list` result in place.
    ///
    /// Entries without a string `name` are dropped too under a restrictive
    /// policy. Returns how many entries were removed.
    pub fn filter_tool_list(&self, result: &mut Value) -> usize {
        if *self == Self::Unrestricted {
            return 0;
        }
        let Some(tools) = result.get_mut("tools").and_then(Value::as_array_mut) else {
            return 0;
        };
        let before = tools.len();
        tools.retain(|tool| {
            tool.get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| self.permits(name))
        });
        before - tools.len()
    }

    /// Short human-readable form for status output.
    pub fn summary(&self) -> String {
        fn sorted(names: &HashSet<String>) -> String {
            let mut names: Vec<&str> = names.iter().map(String::as_str).collect();
            names.sort_unstable();
            names.join(", ")
        }
        match self {
            Self::Unrestricted => "unrestricted".to_string(),
            Self::Whitelist(allowed) => format!("whitelist [{}]", sorted(allowed)),
            Self::Blacklist(denied) => format!("blacklist [{}]", sorted(denied)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_whitelist_permits_only_listed() {
        let allowed = names(&["a", "b"]);
        let policy = AccessPolicy::resolve("demo", Some(allowed.as_slice()), None).unwrap();
        assert!(policy.permits("a"));
        assert!(policy.permits("b"));
        assert!(!policy.permits("c"));
    }

    #[test]
    fn test_blacklist_denies_only_listed() {
        let denied = names(&["rm"]);
        let policy = AccessPolicy::resolve("demo", None, Some(denied.as_slice())).unwrap();
        assert!(!policy.permits("rm"));
        assert!(policy.permits("ls"));
    }

    #[test]
    fn test_empty_whitelist_permits_nothing() {
        let policy = AccessPolicy::resolve("demo", Some(&[][..]), None).unwrap();
        assert!(!policy.permits("anything"));
    }

    #[test]
    fn test_both_lists_conflict_even_when_empty() {
        let err = AccessPolicy::resolve("demo", Some(&[][..]), Some(&[][..])).unwrap_err();
        assert!(matches!(err, ProxyError::PolicyConflict { backend } if backend == "demo"));
    }

    #[test]
    fn test_no_lists_is_unrestricted() {
        let policy = AccessPolicy::resolve("demo", None, None).unwrap();
        assert_eq!(policy, AccessPolicy::Unrestricted);
        assert!(policy.permits("x"));
    }

    #[test]
    fn test_filter_tool_list_matches_permits() {
        let allowed = names(&["a", "b"]);
        let policy = AccessPolicy::resolve("demo", Some(allowed.as_slice()), None).unwrap();
        let mut result = json!({
            "tools": [
                {"name": "a", "description": "first"},
                {"name": "b"},
                {"name": "c"},
                {"description": "nameless"}
            ],
            "nextCursor": null
        });
        let removed = policy.filter_tool_list(&mut result);
        assert_eq!(removed, 2);
        let listed: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(listed, vec!["a", "b"]);
        assert!(result.get("nextCursor").is_some());
    }

    #[test]
    fn test_unrestricted_leaves_list_untouched() {
        let mut result = json!({"tools": [{"description": "nameless"}]});
        assert_eq!(AccessPolicy::Unrestricted.filter_tool_list(&mut result), 0);
        assert_eq!(result["tools"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_summary_is_sorted() {
        let denied = names(&["z", "a"]);
        let policy = AccessPolicy::resolve("demo", None, Some(denied.as_slice())).unwrap();
        assert_eq!(policy.summary(), "blacklist [a, z]");
    }
}
