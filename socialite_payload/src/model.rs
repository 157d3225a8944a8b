//! Data model shared by generators and the services that consume them.

use std::{collections::BTreeMap, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A member of the social graph.
///
/// Users carry no state beyond their identifier and compare by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct User {
    id: String,
}

impl User {
    /// Create a new [`User`] with the given identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The user's identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A content value, either readable text or the opaque output of a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Plain text as produced by the [`crate::Synthesizer`]
    Text(String),
    /// Bytes produced by an encrypting transform
    Encrypted(Bytes),
}

impl Value {
    /// Size of the value in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Value::Text(text) => text.len(),
            Value::Encrypted(bytes) => bytes.len(),
        }
    }

    /// Whether the value holds zero bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the value has been through an encrypting transform
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Value::Encrypted(_))
    }
}

/// Structured fields attached to a [`Content`], ordered by name.
pub type Fields = BTreeMap<String, Value>;

/// An authored item to be published and fanned out.
///
/// Content is immutable once built. Transforms take it apart with
/// [`Content::into_parts`] and construct a replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    author: User,
    body: Value,
    fields: Option<Fields>,
}

impl Content {
    /// Create a new [`Content`]
    #[must_use]
    pub fn new(author: User, body: Value, fields: Option<Fields>) -> Self {
        Self {
            author,
            body,
            fields,
        }
    }

    /// The author of this content
    #[must_use]
    pub fn author(&self) -> &User {
        &self.author
    }

    /// The body of this content
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Structured fields, if any were synthesized
    #[must_use]
    pub fn fields(&self) -> Option<&Fields> {
        self.fields.as_ref()
    }

    /// Decompose into author, body and fields.
    #[must_use]
    pub fn into_parts(self) -> (User, Value, Option<Fields>) {
        (self.author, self.body, self.fields)
    }
}
