//! Identifier types shared across loadpub components.

use serde::{Deserialize, Serialize};

/// Logical result-set identifier chosen by the agents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultSetId(pub String);

impl ResultSetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResultSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one stream of correlated events: result set, agent host and agent port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    /// Build the key the same way every component does: plain concatenation.
    pub fn derive(result_set: &ResultSetId, agent_host: &str, agent_port: u16) -> Self {
        Self(format!("{}{}{}", result_set.as_str(), agent_host, agent_port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value of the single-row readiness flag consumed by result pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotReady,
}

impl Readiness {
    /// Text stored in the readiness table.
    pub fn as_stored(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::NotReady => "Not ready",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_is_plain_concatenation() {
        let key = SessionKey::derive(&ResultSetId::new("42"), "host", 8080);
        assert_eq!(key.as_str(), "42host8080");
        assert_eq!(key.to_string(), "42host8080");
    }

    #[test]
    fn readiness_stored_text() {
        assert_eq!(Readiness::Ready.as_stored(), "Ready");
        assert_eq!(Readiness::NotReady.as_stored(), "Not ready");
    }
}
