use serde::{Deserialize, Serialize};

use super::Timestamp;

/// A single role in a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    Tool,
    System,
}

/// A tool invocation recorded on an agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool_name: String,
    pub tool_input: serde_json::Value,
}

/// A single atomic turn in a conversation. Immutable once persisted: the
/// store never exposes an update path for this type, only create and
/// cascade-delete (via its request or request group).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub interaction_id: String,
    pub user_id: String,
    pub request_id: String,
    /// Monotonic unix seconds; `Orchestrator` assigns ties by insertion order
    /// within the same request.
    pub created_at: Timestamp,
    pub role: Role,
    pub content: String,
    /// Alternative agent reply for A/B shadow comparison; only meaningful
    /// when `role == Agent`.
    pub shadow_content: Option<String>,
    pub tools_used: Vec<ToolUse>,
    /// Base64 or URI payload; the core treats this as opaque bytes/string.
    pub image: Option<String>,
    pub embedding: Vec<f32>,
}

impl Interaction {
    pub fn is_shadow_candidate(&self) -> bool {
        matches!(self.role, Role::Agent) && self.shadow_content.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// A bundle of interactions posted together; the unit of success evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub user_id: String,
    pub created_at: Timestamp,
    pub source: String,
    pub agent_version: String,
    /// Session-level grouping; deleting a request group cascades to all its
    /// requests and, transitively, their interactions.
    pub request_group: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_candidate_requires_agent_role_and_nonempty_content() {
        let mut i = Interaction {
            interaction_id: "i1".into(),
            user_id: "u1".into(),
            request_id: "r1".into(),
            created_at: 0,
            role: Role::User,
            content: "hi".into(),
            shadow_content: Some("alt".into()),
            tools_used: vec![],
            image: None,
            embedding: vec![],
        };
        assert!(!i.is_shadow_candidate());

        i.role = Role::Agent;
        assert!(i.is_shadow_candidate());

        i.shadow_content = Some(String::new());
        assert!(!i.is_shadow_candidate());

        i.shadow_content = None;
        assert!(!i.is_shadow_candidate());
    }
}
