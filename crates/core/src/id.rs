//! Strongly-typed identifiers used across the workspace.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Maximum accepted SKU length (matches the width operators use for labels).
pub const MAX_SKU_LEN: usize = 64;

/// Stock-keeping unit: the key of one inventory record.
///
/// A SKU is opaque to this workspace; it is only validated to be a non-empty,
/// bounded token without surrounding whitespace so that it can be used as a
/// primary key verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sku(String);

impl Sku {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::invalid_id("Sku: cannot be empty"));
        }
        if value.len() > MAX_SKU_LEN {
            return Err(DomainError::invalid_id(format!(
                "Sku: longer than {MAX_SKU_LEN} bytes"
            )));
        }
        if value.trim() != value {
            return Err(DomainError::invalid_id(
                "Sku: leading or trailing whitespace",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Sku {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Sku {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Sku {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Sku> for String {
    fn from(value: Sku) -> Self {
        value.0
    }
}

impl AsRef<str> for Sku {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Caller-supplied token that makes a deduction safe to resend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(IdempotencyKey, "IdempotencyKey");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sku_rejects_empty_and_padded_values() {
        assert!(Sku::new("").is_err());
        assert!(Sku::new(" X").is_err());
        assert!(Sku::new("X\n").is_err());
        assert!(Sku::new("a".repeat(MAX_SKU_LEN + 1)).is_err());
        assert_eq!(Sku::new("SKU-42").unwrap().as_str(), "SKU-42");
    }

    #[test]
    fn sku_deserialization_is_validated() {
        let ok: Sku = serde_json::from_str("\"X\"").unwrap();
        assert_eq!(ok.to_string(), "X");

        let err = serde_json::from_str::<Sku>("\"\"");
        assert!(err.is_err());
    }

    #[test]
    fn idempotency_key_parses_uuid_strings() {
        let key = IdempotencyKey::new();
        let parsed: IdempotencyKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);

        let err = "not-a-uuid".parse::<IdempotencyKey>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(msg) if msg.starts_with("IdempotencyKey")));
    }
}
