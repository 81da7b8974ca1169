use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token naming one endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an explicit identity string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A fresh, globally unique identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A globally unique correlation id.
///
/// Random rather than counted, so ids stay unambiguous across restarts.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_identities_differ() {
        assert_ne!(Identity::random(), Identity::random());
        assert_ne!(new_correlation_id(), new_correlation_id());
    }

    #[test]
    fn serializes_transparently() {
        let identity = Identity::new("worker-1");
        assert_eq!(serde_json::to_string(&identity).unwrap(), "\"worker-1\"");
        assert_eq!(identity.to_string(), "worker-1");
    }
}
