//! Ordered levels used throughout the engine
//!
//! Assurance levels form a hierarchy from weakest to strongest proof:
//! none < password < mfa < step_up
//!
//! Sensitivity tiers form a hierarchy from least to most protected:
//! public < internal < confidential < restricted

use serde::{Deserialize, Serialize};
use std::fmt;

/// Strength of authentication a principal has demonstrated (or must demonstrate)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuranceLevel {
    /// Nothing proven yet.
    None,

    /// Primary credential only.
    Password,

    /// Multi-factor authentication completed.
    Mfa,

    /// Fresh step-up challenge completed.
    /// Required for the riskiest requests.
    StepUp,
}

impl Default for AssuranceLevel {
    fn default() -> Self {
        AssuranceLevel::None
    }
}

impl AssuranceLevel {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(AssuranceLevel::None),
            "password" => Some(AssuranceLevel::Password),
            "mfa" => Some(AssuranceLevel::Mfa),
            "step_up" | "stepup" | "step-up" => Some(AssuranceLevel::StepUp),
            _ => None,
        }
    }

    /// Get the string name
    pub fn as_str(&self) -> &'static str {
        match self {
            AssuranceLevel::None => "none",
            AssuranceLevel::Password => "password",
            AssuranceLevel::Mfa => "mfa",
            AssuranceLevel::StepUp => "step_up",
        }
    }

    /// Check if this level satisfies a required level
    pub fn satisfies(&self, required: AssuranceLevel) -> bool {
        *self >= required
    }

    /// Trust level granted by a successful primary authentication
    pub fn from_primary_auth(mfa_satisfied: bool) -> Self {
        if mfa_satisfied {
            AssuranceLevel::Mfa
        } else {
            AssuranceLevel::Password
        }
    }
}

impl fmt::Display for AssuranceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sensitivity tier assigned to a resource by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Public,
    Internal,
    Confidential,
    /// Also the conservative stand-in when the classifier cannot answer.
    Restricted,
}

impl Sensitivity {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "public" => Some(Sensitivity::Public),
            "internal" => Some(Sensitivity::Internal),
            "confidential" => Some(Sensitivity::Confidential),
            "restricted" => Some(Sensitivity::Restricted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Public => "public",
            Sensitivity::Internal => "internal",
            Sensitivity::Confidential => "confidential",
            Sensitivity::Restricted => "restricted",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            Sensitivity::Public,
            Sensitivity::Internal,
            Sensitivity::Confidential,
            Sensitivity::Restricted,
        ]
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assurance_ordering() {
        assert!(AssuranceLevel::StepUp > AssuranceLevel::Mfa);
        assert!(AssuranceLevel::Mfa > AssuranceLevel::Password);
        assert!(AssuranceLevel::Password > AssuranceLevel::None);
    }

    #[test]
    fn test_satisfies() {
        assert!(AssuranceLevel::StepUp.satisfies(AssuranceLevel::Mfa));
        assert!(AssuranceLevel::Mfa.satisfies(AssuranceLevel::Mfa));
        assert!(!AssuranceLevel::Password.satisfies(AssuranceLevel::Mfa));
    }

    #[test]
    fn test_primary_auth_level() {
        assert_eq!(AssuranceLevel::from_primary_auth(true), AssuranceLevel::Mfa);
        assert_eq!(AssuranceLevel::from_primary_auth(false), AssuranceLevel::Password);
    }

    #[test]
    fn test_parse_round_trip_names() {
        for level in [
            AssuranceLevel::None,
            AssuranceLevel::Password,
            AssuranceLevel::Mfa,
            AssuranceLevel::StepUp,
        ] {
            assert_eq!(AssuranceLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(Sensitivity::from_str("RESTRICTED"), Some(Sensitivity::Restricted));
        assert_eq!(Sensitivity::from_str("secret"), None);
    }

    #[test]
    fn test_sensitivity_ordering() {
        assert!(Sensitivity::Restricted > Sensitivity::Confidential);
        assert!(Sensitivity::Confidential > Sensitivity::Internal);
        assert!(Sensitivity::Internal > Sensitivity::Public);
    }
}
