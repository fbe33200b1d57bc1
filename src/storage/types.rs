//! core type-safe identifiers and names used across the engine.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a hex encoded SHA-256 digest.
pub(crate) const HASH_HEX_LEN: usize = 64;

/// hex encoded SHA-256 of `bytes`; every content id in the engine is one of these
pub(crate) fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn is_hex_digest(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Declares a content-address newtype.
///
/// This makes sure we don't accidentally pass a range id where a commit id
/// is expected, even though all of them are hex SHA-256 digests underneath.
macro_rules! content_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// wrap a digest computed by this crate
            pub(crate) fn from_digest(digest: String) -> Self {
                Self(digest)
            }

            /// parse from a 64 character lowercase hex string
            pub fn from_hex(hex: &str) -> Result<Self, InvalidNameError> {
                if !is_hex_digest(hex) {
                    return Err(InvalidNameError::InvalidDigest(hex.to_string()));
                }
                Ok(Self(hex.to_string()))
            }

            /// short form of the id
            pub fn short(&self) -> &str {
                &self.0[..7.min(self.0.len())]
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

content_id!(
    /// Identifier of an immutable range blob.
    RangeId
);
content_id!(
    /// Identifier of an immutable metarange blob.
    MetaRangeId
);
content_id!(
    /// Identifier of a commit; a digest of the commit's own fields.
    CommitId
);

impl CommitId {
    /// true if `prefix` could abbreviate a commit id
    pub fn is_prefix_candidate(prefix: &str) -> bool {
        prefix.len() <= HASH_HEX_LEN
            && prefix.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    }
}

/// A path inside a repository.
///
/// Keys order lexicographically by bytes, which is the order every range,
/// metarange and staging scan uses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub const MAX_LEN: usize = 1024;

    pub fn new(key: impl Into<String>) -> Result<Self, InvalidNameError> {
        let key = key.into();
        if key.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if key.len() > Self::MAX_LEN {
            return Err(InvalidNameError::TooLong(key.len()));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A validated repository name.
///
/// Valid names:
/// - 3-63 characters
/// - lowercase letters, digits and hyphens
/// - must start with a letter or digit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryName(String);

impl RepositoryName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        let first = name.chars().next().ok_or(InvalidNameError::Empty)?;
        if name.len() < 3 {
            return Err(InvalidNameError::TooShort(name.len()));
        }
        if name.len() > 63 {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
            return Err(InvalidNameError::InvalidStart(first));
        }
        for (i, c) in name.chars().enumerate() {
            if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RepositoryName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RepositoryName> for String {
    fn from(value: RepositoryName) -> Self {
        value.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated branch name: a word character followed by word characters or hyphens.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// the default branch of a new repository
    pub const MAIN: &'static str = "main";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        let first = name.chars().next().ok_or(InvalidNameError::Empty)?;
        if name.len() > 256 {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if !(first.is_ascii_alphanumeric() || first == '_') {
            return Err(InvalidNameError::InvalidStart(first));
        }
        for (i, c) in name.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }
        Ok(Self(name))
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BranchName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BranchName> for String {
    fn from(value: BranchName) -> Self {
        value.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated tag name.
///
/// Tags may contain dots and slashes (`v1.2`, `release/2024`) but never
/// whitespace or the ref expression operators `~`, `^`, `@` and `:`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagName(String);

impl TagName {
    const FORBIDDEN: &'static [char] = &['~', '^', '@', ':', '\\', '?', '*', '['];

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.len() > 256 {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        for (i, c) in name.chars().enumerate() {
            if c.is_whitespace() || c.is_control() || Self::FORBIDDEN.contains(&c) {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }
        if name.contains("..") || name.starts_with('/') || name.ends_with('/') || name.ends_with('.') {
            return Err(InvalidNameError::InvalidPath(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TagName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TagName> for String {
    fn from(value: TagName) -> Self {
        value.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a set of uncommitted entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagingToken(String);

impl StagingToken {
    /// Generate a fresh ULID-based token.
    pub fn generate() -> Self {
        Self(format!("st-{}", ulid::Ulid::new().to_string().to_lowercase()))
    }

    /// wrap an externally supplied token (bulk ingest)
    pub fn new(token: impl Into<String>) -> Result<Self, InvalidNameError> {
        let token = token.into();
        if token.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if let Some((i, c)) = token.char_indices().find(|(_, c)| c.is_whitespace() || *c == '/') {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StagingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// error type for invalid names and identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooShort(usize),
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    InvalidPath(String),
    InvalidDigest(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooShort(len) => write!(f, "name too short: {} characters", len),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
            Self::InvalidDigest(value) => write!(f, "not a content digest: '{}'", value),
        }
    }
}

impl std::error::Error for InvalidNameError {}
