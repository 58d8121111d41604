//! Perfect-negotiation roles.

use serde::{Deserialize, Serialize};

/// Negotiation role.
///
/// The polite peer yields on offer collisions; the impolite peer ignores the
/// colliding offer and originates negotiated data channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts colliding offers
    Polite,
    /// Ignores colliding offers
    Impolite,
}

impl Role {
    /// Parse `"polite"` / `"impolite"`, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polite" => Some(Self::Polite),
            "impolite" => Some(Self::Impolite),
            _ => None,
        }
    }

    /// Role name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Polite => "polite",
            Self::Impolite => "impolite",
        }
    }

    /// Whether this is the polite role
    pub fn is_polite(&self) -> bool {
        *self == Self::Polite
    }

    /// Role for the local peer given both seeds.
    ///
    /// The strictly larger seed is polite. Equal seeds decide nothing and
    /// both peers must re-roll.
    pub fn decide(local_seed: f64, remote_seed: f64) -> Option<Self> {
        if local_seed > remote_seed {
            Some(Self::Polite)
        } else if local_seed < remote_seed {
            Some(Self::Impolite)
        } else {
            None
        }
    }

    /// The other role
    pub fn opposite(&self) -> Self {
        match self {
            Self::Polite => Self::Impolite,
            Self::Impolite => Self::Polite,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse() {
        assert_eq!(Role::parse("polite"), Some(Role::Polite));
        assert_eq!(Role::parse(" Impolite "), Some(Role::Impolite));
        assert_eq!(Role::parse("rude"), None);
    }

    #[test]
    fn test_larger_seed_is_polite() {
        assert_eq!(Role::decide(10.0, 0.5), Some(Role::Polite));
        assert_eq!(Role::decide(0.5, 10.0), Some(Role::Impolite));
        assert_eq!(Role::decide(0.5, 0.5), None);
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Impolite).unwrap(), "\"impolite\"");
        let role: Role = serde_json::from_str("\"polite\"").unwrap();
        assert_eq!(role, Role::Polite);
    }

    proptest! {
        #[test]
        fn prop_roles_diverge(a in any::<f64>().prop_filter("finite", |x| x.is_finite()),
                              b in any::<f64>().prop_filter("finite", |x| x.is_finite())) {
            match (Role::decide(a, b), Role::decide(b, a)) {
                (Some(mine), Some(theirs)) => prop_assert_eq!(mine.opposite(), theirs),
                (None, None) => prop_assert_eq!(a, b),
                other => prop_assert!(false, "asymmetric decision {:?}", other),
            }
        }
    }
}
