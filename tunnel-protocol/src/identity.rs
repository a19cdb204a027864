//! Certificate identity, shared between the controller's accept path and the
//! (out-of-scope) CA that issues these certificates in the first place.
//!
//! The OU field of an issued certificate carries a `CertificateName` encoded
//! as JSON. The controller parses it after the TLS layer has already
//! verified the chain — this module does not itself verify anything.

use serde::{Deserialize, Serialize};

/// What a certificate is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// May open a tunnel stream.
    Agent,
    /// May call the CNC REST surface.
    Control,
    /// May mint/consume service-auth tokens.
    Service,
}

/// Identity carried in a certificate's OU field, JSON-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateName {
    pub purpose: Purpose,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("certificate OU is not valid CertificateName JSON: {0}")]
    MalformedOu(#[source] serde_json::Error),
    #[error("certificate purpose is {found:?}, expected {expected:?}")]
    WrongPurpose { found: Purpose, expected: Purpose },
    #[error("agent certificate is missing the agent field")]
    MissingAgentName,
}

impl CertificateName {
    /// Parses the JSON blob found in a certificate's OU field.
    pub fn from_ou(ou: &str) -> Result<Self, IdentityError> {
        serde_json::from_str(ou).map_err(IdentityError::MalformedOu)
    }

    /// Requires `purpose == Agent` and returns the agent name, per §4.2.
    pub fn require_agent_name(&self) -> Result<&str, IdentityError> {
        if self.purpose != Purpose::Agent {
            return Err(IdentityError::WrongPurpose {
                found: self.purpose,
                expected: Purpose::Agent,
            });
        }
        self.agent
            .as_deref()
            .ok_or(IdentityError::MissingAgentName)
    }

    /// Requires `purpose == Control`, for the CNC REST surface contract.
    pub fn require_control(&self) -> Result<(), IdentityError> {
        if self.purpose != Purpose::Control {
            return Err(IdentityError::WrongPurpose {
                found: self.purpose,
                expected: Purpose::Control,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_identity() {
        let ou = r#"{"purpose":"agent","agent":"a1"}"#;
        let name = CertificateName::from_ou(ou).unwrap();
        assert_eq!(name.require_agent_name().unwrap(), "a1");
    }

    #[test]
    fn rejects_wrong_purpose() {
        let ou = r#"{"purpose":"control","name":"ops"}"#;
        let name = CertificateName::from_ou(ou).unwrap();
        assert!(matches!(
            name.require_agent_name(),
            Err(IdentityError::WrongPurpose { .. })
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            CertificateName::from_ou("not json"),
            Err(IdentityError::MalformedOu(_))
        ));
    }

    #[test]
    fn rejects_agent_purpose_without_name() {
        let ou = r#"{"purpose":"agent"}"#;
        let name = CertificateName::from_ou(ou).unwrap();
        assert!(matches!(
            name.require_agent_name(),
            Err(IdentityError::MissingAgentName)
        ));
    }
}
