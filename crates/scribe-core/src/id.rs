//! Strongly-typed identifiers for tenants and documents.
//!
//! Identifiers arrive from the upstream bus as opaque strings; the newtypes
//! here prevent mixing them up at compile time and reject values that could
//! not have come from a well-formed session (empty, or containing path
//! separators that would break storage keys).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

const MAX_ID_LENGTH: usize = 256;

fn validate(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} must not be empty"),
        });
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(Error::InvalidId {
            message: format!("{kind} exceeds {MAX_ID_LENGTH} characters"),
        });
    }
    if id.contains('/') || id.chars().any(char::is_whitespace) {
        return Err(Error::InvalidId {
            message: format!("{kind} must not contain '/' or whitespace: {id:?}"),
        });
    }
    Ok(())
}

/// A unique identifier for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a new tenant ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant ID is empty, too long, or contains
    /// path separators or whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate("tenant ID", &id)?;
        Ok(Self(id))
    }

    /// Returns the tenant ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unique identifier for a collaborative document within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates a new document ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the document ID is empty, too long, or contains
    /// path separators or whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate("document ID", &id)?;
        Ok(Self(id))
    }

    /// Returns the document ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
