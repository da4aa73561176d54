//! Mapping identifier.

use serde::{Deserialize, Serialize};

/// Primary key of a mapping configuration.
///
/// Serializes as a bare integer and, with the `postgres` feature, binds as
/// an `INTEGER` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type), sqlx(transparent))]
#[serde(transparent)]
pub struct MappingId(i32);

impl MappingId {
    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for MappingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for MappingId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl From<MappingId> for i32 {
    fn from(id: MappingId) -> Self {
        id.0
    }
}
