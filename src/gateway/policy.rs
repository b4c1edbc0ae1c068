//! Blocked / allowed server policy.

use std::collections::HashSet;

use super::config::GatewayConfig;
use super::errors::GatewayError;

/// Deny list plus optional allow list, checked by server id.
#[derive(Debug, Clone, Default)]
pub struct ServerPolicy {
    blocked: HashSet<String>,
    allowed: Option<HashSet<String>>,
}

impl ServerPolicy {
    pub fn new<B, A>(blocked: B, allowed: Option<A>) -> Self
    where
        B: IntoIterator<Item = String>,
        A: IntoIterator<Item = String>,
    {
        Self {
            blocked: blocked.into_iter().collect(),
            allowed: allowed.map(|a| a.into_iter().collect()),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.blocked_servers.iter().cloned(),
            config.allowed_servers.clone(),
        )
    }

    /// Why `server_id` is rejected, or `None` if it is allowed.
    pub fn denial(&self, server_id: &str) -> Option<&'static str> {
        if self.blocked.contains(server_id) {
            return Some("server is on the blocked list");
        }
        match &self.allowed {
            Some(allowed) if !allowed.contains(server_id) => Some("server is not on the allowed list"),
            _ => None,
        }
    }

    pub fn is_allowed(&self, server_id: &str) -> bool {
        self.denial(server_id).is_none()
    }

    /// Fail fast for a blocked server.
    pub fn ensure_allowed(&self, server_id: &str) -> Result<(), GatewayError> {
        match self.denial(server_id) {
            None => Ok(()),
            Some(reason) => {
                tracing::warn!(server = %server_id, reason, "policy rejected server");
                Err(GatewayError::PolicyBlocked {
                    server_id: server_id.to_string(),
                    reason: reason.to_string(),
                })
            }
        }
    }
}

/// Keep only the items whose server id passes `policy`.
pub fn filter_servers_by_policy<T>(
    policy: &ServerPolicy,
    list: Vec<T>,
    id_of: impl Fn(&T) -> Option<&str>,
) -> Vec<T> {
    let before = list.len();
    let kept: Vec<T> = list
        .into_iter()
        .filter(|item| id_of(item).map_or(true, |id| policy.is_allowed(id)))
        .collect();
    if kept.len() < before {
        tracing::debug!(filtered = before - kept.len(), "servers hidden by policy");
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn ids(items: &[Value]) -> Vec<&str> {
        items.iter().filter_map(|v| v["server_id"].as_str()).collect()
    }

    #[test]
    fn test_blocked_list() {
        let policy = ServerPolicy::new(vec!["sv_bad".to_string()], None::<Vec<String>>);
        assert!(policy.is_allowed("sv_ok"));
        assert!(!policy.is_allowed("sv_bad"));
        let err = policy.ensure_allowed("sv_bad").unwrap_err();
        assert!(err.to_string().contains("blocked list"));
    }

    #[test]
    fn test_allow_list_restricts_and_block_wins() {
        let policy = ServerPolicy::new(
            vec!["sv_a".to_string()],
            Some(vec!["sv_a".to_string(), "sv_b".to_string()]),
        );
        assert!(!policy.is_allowed("sv_a"));
        assert!(policy.is_allowed("sv_b"));
        assert!(!policy.is_allowed("sv_c"));
    }

    #[test]
    fn test_filter_keeps_items_without_ids() {
        let policy = ServerPolicy::new(vec!["sv_b".to_string()], None::<Vec<String>>);
        let list = vec![
            json!({"server_id": "sv_a"}),
            json!({"server_id": "sv_b"}),
            json!({"title": "no id"}),
        ];
        let kept = filter_servers_by_policy(&policy, list, |v| v["server_id"].as_str());
        assert_eq!(kept.len(), 2);
        assert_eq!(ids(&kept), vec!["sv_a"]);
    }
}
