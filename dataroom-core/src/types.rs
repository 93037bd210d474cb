use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrganizationId(pub String);

/// Principal recorded on audit events (user, service account or node).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Actor(pub String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $ty {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(DatasetId);
string_id!(OrganizationId);
string_id!(Actor);

impl Actor {
    pub fn system() -> Self {
        Self("system".into())
    }
}

/// Random correlation id of the form `<prefix>-<16 hex digits>`.
pub fn random_id(prefix: &str) -> String {
    format!("{prefix}-{:016x}", rand::thread_rng().gen::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_carry_prefix_and_differ() {
        let a = random_id("run");
        let b = random_id("run");
        assert!(a.starts_with("run-"));
        assert_eq!(a.len(), "run-".len() + 16);
        assert_ne!(a, b);
    }

    #[test]
    fn ids_display_their_inner_value() {
        assert_eq!(DatasetId::from("patients").to_string(), "patients");
        assert_eq!(OrganizationId::new("org-a").as_str(), "org-a");
    }
}
