//! Query keys and their normalized hashes.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// One primitive value inside a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
}

impl From<&KeyPart> for Value {
  fn from(part: &KeyPart) -> Self {
    match part {
      KeyPart::Null => Value::Null,
      KeyPart::Bool(b) => Value::Bool(*b),
      KeyPart::Int(i) => Value::from(*i),
      KeyPart::Str(s) => Value::String(s.clone()),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<&String> for KeyPart {
  fn from(s: &String) -> Self {
    KeyPart::Str(s.clone())
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

impl From<i64> for KeyPart {
  fn from(i: i64) -> Self {
    KeyPart::Int(i)
  }
}

impl From<i32> for KeyPart {
  fn from(i: i32) -> Self {
    KeyPart::Int(i64::from(i))
  }
}

impl From<u32> for KeyPart {
  fn from(i: u32) -> Self {
    KeyPart::Int(i64::from(i))
  }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(KeyPart::Null)
  }
}

/// Ordered list of primitive values identifying a query.
///
/// A key also serves as a prefix: a peer group is declared with a short key
/// and every query whose key starts with it belongs to the group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new<I, P>(parts: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<KeyPart>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  pub fn from_parts(parts: Vec<KeyPart>) -> Self {
    Self(parts)
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Append a part, returning the extended key.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  /// Whether `prefix` is a leading subsequence of this key.
  /// The empty key is a prefix of every key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Canonical JSON form of the key, e.g. `["count",3,null]`.
  pub fn canonical(&self) -> String {
    Value::Array(self.0.iter().map(Value::from).collect()).to_string()
  }

  /// Normalized identifier: SHA-256 over the canonical form, hex encoded.
  pub fn hash(&self) -> KeyHash {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    KeyHash(hex::encode(hasher.finalize()))
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical())
  }
}

/// Stable, fixed-length identifier for a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyHash(String);

impl KeyHash {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Short form for log output.
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(12)]
  }
}

impl fmt::Display for KeyHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Build a [`QueryKey`] from mixed primitive values.
///
/// ```ignore
/// let key = query_key!["match-count", "pcc2", 3];
/// ```
#[macro_export]
macro_rules! query_key {
  ($($part:expr),* $(,)?) => {
    $crate::query::QueryKey::from_parts(vec![$($crate::query::KeyPart::from($part)),*])
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_canonical_form() {
    let key = crate::query_key!["count", 3, true, None::<String>];
    assert_eq!(key.canonical(), r#"["count",3,true,null]"#);
  }

  #[test]
  fn test_equal_parts_hash_equal() {
    let a = QueryKey::new(["nodes", "tok"]);
    let b = crate::query_key!["nodes", String::from("tok")];
    assert_eq!(a.hash(), b.hash());
    assert_eq!(a.hash().as_str().len(), 64);
  }

  #[test]
  fn test_type_distinguishes_hash() {
    let a = crate::query_key!["x", 1];
    let b = crate::query_key!["x", "1"];
    assert_ne!(a.hash(), b.hash());
  }

  #[test]
  fn test_starts_with() {
    let key = crate::query_key!["match-count", "pcc2", "tok"];
    assert!(key.starts_with(&crate::query_key!["match-count"]));
    assert!(key.starts_with(&key.clone()));
    assert!(key.starts_with(&QueryKey::default()));
    assert!(!key.starts_with(&crate::query_key!["match"]));
    assert!(!crate::query_key!["match-count"].starts_with(&key));
  }

  #[test]
  fn test_with_appends() {
    let key = crate::query_key!["nodes"].with("tok=\"a\"");
    assert_eq!(key.parts().len(), 2);
    assert_eq!(key.parts()[1], KeyPart::Str("tok=\"a\"".to_string()));
  }
}
