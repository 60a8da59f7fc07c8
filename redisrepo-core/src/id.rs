use crate::error::{RepoError, Result};
use std::fmt::Debug;
use std::hash::Hash;
use ulid::Ulid;

/// Identifier of a stored entity.
///
/// `to_key_part` is the canonical string form used in storage keys and lock
/// names; `from_key_part` must accept exactly what `to_key_part` produces.
pub trait EntityId: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    fn to_key_part(&self) -> String;

    fn from_key_part(raw: &str) -> Result<Self>;
}

impl EntityId for String {
    fn to_key_part(&self) -> String {
        self.clone()
    }

    fn from_key_part(raw: &str) -> Result<Self> {
        Ok(raw.to_string())
    }
}

impl EntityId for Ulid {
    fn to_key_part(&self) -> String {
        self.to_string()
    }

    fn from_key_part(raw: &str) -> Result<Self> {
        Ulid::from_string(raw)
            .map_err(|e| RepoError::InvalidId(format!("'{}' is not a ulid: {}", raw, e)))
    }
}

macro_rules! integer_entity_id {
    ($($ty:ty),*) => {
        $(
            impl EntityId for $ty {
                fn to_key_part(&self) -> String {
                    self.to_string()
                }

                fn from_key_part(raw: &str) -> Result<Self> {
                    raw.parse::<$ty>().map_err(|e| {
                        RepoError::InvalidId(format!(
                            "'{}' is not a {}: {}",
                            raw,
                            stringify!($ty),
                            e
                        ))
                    })
                }
            }
        )*
    };
}

integer_entity_id!(u32, u64, i32, i64);

/// Key naming for one collection: `<prefix><id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key<I: EntityId>(&self, id: &I) -> String {
        format!("{}{}", self.prefix, id.to_key_part())
    }

    /// SCAN `MATCH` pattern selecting every key of the collection.
    pub fn scan_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + 1);
        for c in self.prefix.chars() {
            // glob metacharacters in the prefix must match literally
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }

    /// Recover the id from a scanned key.
    pub fn id_from_key<I: EntityId>(&self, key: &str) -> Result<I> {
        let raw = key.strip_prefix(self.prefix.as_str()).ok_or_else(|| {
            RepoError::InvalidId(format!(
                "key '{}' is outside collection '{}'",
                key, self.prefix
            ))
        })?;
        I::from_key_part(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_prefix_plus_canonical_id() {
        let keyspace = Keyspace::new("order:");
        assert_eq!(keyspace.key(&"42".to_string()), "order:42");
        assert_eq!(keyspace.key(&7u64), "order:7");
        assert_eq!(keyspace.key(&-3i64), "order:-3");
    }

    #[test]
    fn scan_pattern_escapes_glob_characters() {
        assert_eq!(Keyspace::new("user:").scan_pattern(), "user:*");
        assert_eq!(
            Keyspace::new("a*b?[c]\\").scan_pattern(),
            "a\\*b\\?\\[c\\]\\\\*"
        );
    }

    #[test]
    fn id_from_key_strips_prefix() {
        let keyspace = Keyspace::new("user:");
        let id: String = keyspace.id_from_key("user:alice").unwrap();
        assert_eq!(id, "alice");

        let id: u64 = keyspace.id_from_key("user:19").unwrap();
        assert_eq!(id, 19);
    }

    #[test]
    fn id_from_key_rejects_unparseable_ids() {
        let keyspace = Keyspace::new("user:");
        let err = keyspace.id_from_key::<u64>("user:abc").unwrap_err();
        assert!(matches!(err, RepoError::InvalidId(_)));

        let err = keyspace.id_from_key::<String>("other:1").unwrap_err();
        assert!(matches!(err, RepoError::InvalidId(_)));
    }

    #[test]
    fn ulid_round_trips_through_key_part() {
        let id = Ulid::new();
        let parsed = Ulid::from_key_part(&id.to_key_part()).unwrap();
        assert_eq!(parsed, id);
    }
}
