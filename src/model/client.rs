use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

const MAX_ID_LEN: usize = 64;

/// Identity of a participant on the relay.
///
/// Chosen locally (typed by the user or generated) and announced when the
/// transport opens. Restricted to `[A-Za-z0-9_.-]` so it can travel in a query
/// string or an announce frame unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if valid {
            Ok(ClientId(id))
        } else {
            Err(ProtocolError::InvalidClientId(id))
        }
    }

    /// A fresh random id for clients that don't pick their own.
    pub fn random() -> Self {
        ClientId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClientId::new(s)
    }
}

impl TryFrom<String> for ClientId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ClientId::new(value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert_eq!(ClientId::new("111").unwrap().as_str(), "111");
        assert!(ClientId::new("rover-2.cam_a").is_ok());
    }

    #[test]
    fn rejects_empty_and_reserved_characters() {
        assert!(ClientId::new("").is_err());
        assert!(ClientId::new("a b").is_err());
        assert!(ClientId::new("a:b").is_err());
        assert!(ClientId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn random_ids_are_valid_and_distinct() {
        let a = ClientId::random();
        let b = ClientId::random();
        assert_ne!(a, b);
        assert!(ClientId::new(a.as_str()).is_ok());
    }

    #[test]
    fn deserialize_enforces_validity() {
        assert!(serde_json::from_str::<ClientId>("\"222\"").is_ok());
        assert!(serde_json::from_str::<ClientId>("\"\"").is_err());
    }
}
