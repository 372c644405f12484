use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{InvalidIdSnafu, InvalidKeySnafu, StorageError, StorageResult};

/// Prefix of session keys that have no server-assigned id yet.
pub const TENTATIVE_PREFIX: &str = "tentative:";

// Locally minted ids share one shape so they serialize and parse the same way.
macro_rules! define_local_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = Uuid::parse_str(raw.trim()).context(InvalidIdSnafu {
                    stage: "parse-local-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_local_id!(MessageId, "message-id");
define_local_id!(TentativeSessionId, "tentative-session-id");

/// Opaque identifier assigned by the backend on the first completed generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(raw: impl Into<String>) -> StorageResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        ensure!(
            !trimmed.is_empty(),
            InvalidKeySnafu {
                stage: "session-id-new",
                key: raw.clone(),
                details: "session id must not be blank",
            }
        );
        ensure!(
            !trimmed.starts_with(TENTATIVE_PREFIX),
            InvalidKeySnafu {
                stage: "session-id-new",
                key: raw.clone(),
                details: "session id must not use the tentative prefix",
            }
        );
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = StorageError;

    fn try_from(value: String) -> StorageResult<Self> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

/// Key under which everything local about one session is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SessionKey {
    Assigned(SessionId),
    Tentative(TentativeSessionId),
}

impl SessionKey {
    pub fn new_tentative() -> Self {
        Self::Tentative(TentativeSessionId::new_v7())
    }

    pub fn is_tentative(&self) -> bool {
        matches!(self, Self::Tentative(_))
    }

    pub fn assigned(&self) -> Option<&SessionId> {
        match self {
            Self::Assigned(id) => Some(id),
            Self::Tentative(_) => None,
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        match raw.trim().strip_prefix(TENTATIVE_PREFIX) {
            Some(tentative) => Ok(Self::Tentative(TentativeSessionId::parse(tentative)?)),
            None => Ok(Self::Assigned(SessionId::new(raw)?)),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned(id) => write!(formatter, "{id}"),
            Self::Tentative(id) => write!(formatter, "{TENTATIVE_PREFIX}{id}"),
        }
    }
}

impl From<SessionId> for SessionKey {
    fn from(value: SessionId) -> Self {
        Self::Assigned(value)
    }
}

impl From<TentativeSessionId> for SessionKey {
    fn from(value: TentativeSessionId) -> Self {
        Self::Tentative(value)
    }
}

impl FromStr for SessionKey {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for SessionKey {
    type Error = StorageError;

    fn try_from(value: String) -> StorageResult<Self> {
        Self::parse(&value)
    }
}

impl From<SessionKey> for String {
    fn from(value: SessionKey) -> Self {
        value.to_string()
    }
}
