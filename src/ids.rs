//! Typed identifiers for persistent entities.
//!
//! Every identifier is a fixed prefix plus a monotonically sortable suffix:
//! a Crockford-base32 millisecond timestamp followed by random characters.
//! Lexicographic order over the string form is therefore creation order,
//! which the store relies on for "most recent snapshot" queries.
//! Identifiers are immutable after creation.

use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const CROCKFORD_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const TIMESTAMP_CHARS: usize = 10;
const RANDOM_CHARS: usize = 16;

fn encode_timestamp(mut millis: u64) -> String {
    let mut buf = [b'0'; TIMESTAMP_CHARS];
    for slot in buf.iter_mut().rev() {
        *slot = CROCKFORD_ALPHABET[(millis & 0x1f) as usize];
        millis >>= 5;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_CHARS)
        .map(|_| CROCKFORD_ALPHABET[rng.gen_range(0..CROCKFORD_ALPHABET.len())] as char)
        .collect()
}

/// Generate a fresh sortable suffix for the current instant.
fn generate_suffix() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    format!("{}{}", encode_timestamp(millis), random_suffix())
}

macro_rules! define_object_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Create a fresh identifier for the current instant.
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, generate_suffix()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let expected = concat!($prefix, "-");
                if !s.starts_with(expected) || s.len() <= expected.len() {
                    return Err(format!(
                        "invalid {} identifier (expected prefix {:?}): {s}",
                        stringify!($name),
                        $prefix,
                    ));
                }
                Ok(Self(s.to_string()))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

define_object_id!(
    /// Identifier of a scheduled task.
    TaskId, "tsk"
);
define_object_id!(
    /// Identifier of a project (one local repository).
    ProjectId, "prj"
);
define_object_id!(
    /// Identifier of a message in a task's log. Shared with the message row.
    MessageId, "msg"
);
define_object_id!(
    /// Identifier of a user-visible notification.
    NotificationId, "ntf"
);
define_object_id!(
    /// Identifier of a per-user settings record.
    UserSettingsId, "ust"
);
define_object_id!(
    /// Identifier of one immutable snapshot row in the store.
    SnapshotId, "snp"
);
define_object_id!(
    /// Identifier correlating one request with its completed transaction.
    RequestId, "req"
);
define_object_id!(
    /// Identifier of a snapshottable environment image.
    ImageId, "img"
);

/// Opaque reference to the owning user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserReference(pub String);

impl UserReference {
    pub fn anonymous() -> Self {
        UserReference("anonymous".to_string())
    }
}

impl fmt::Display for UserReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to the owning organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrganizationReference(pub String);

impl fmt::Display for OrganizationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
