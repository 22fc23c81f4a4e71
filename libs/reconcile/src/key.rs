//! Stable resource identities.
//!
//! A [`Key`] is derived from kind, namespace and name:
//!
//! - namespaced: `Pod/prod/web-0`
//! - cluster-scoped: `Node/worker-1`
//!
//! Segments are non-empty and never contain `/`, so two distinct resources
//! can never encode to the same key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::KeyError;
use crate::resource::Resource;

const SEPARATOR: char = '/';

/// Opaque, comparable identity of one managed resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// Build a key from its parts, validating every segment.
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Result<Self, KeyError> {
        validate_segment("kind", kind)?;
        validate_segment("name", name)?;

        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => {
                validate_segment("namespace", ns)?;
                Ok(Self(format!("{kind}{SEPARATOR}{ns}{SEPARATOR}{name}")))
            }
            None => Ok(Self(format!("{kind}{SEPARATOR}{name}"))),
        }
    }

    /// Parse a key string produced by [`Key::new`].
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        Self::try_from(s.to_string())
    }

    /// Split the key back into kind, namespace and name.
    pub fn parts(&self) -> Result<KeyParts<'_>, KeyError> {
        let segments: Vec<&str> = self.0.split(SEPARATOR).collect();
        let parts = match segments.as_slice() {
            [kind, name] => KeyParts {
                kind: *kind,
                namespace: None,
                name: *name,
            },
            [kind, namespace, name] => KeyParts {
                kind: *kind,
                namespace: Some(*namespace),
                name: *name,
            },
            _ => return Err(KeyError::Malformed(self.0.clone())),
        };

        if segments.iter().any(|s| s.is_empty()) {
            return Err(KeyError::Malformed(self.0.clone()));
        }

        Ok(parts)
    }

    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Key {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let key = Self(s);
        key.parts()?;
        Ok(key)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Borrowed view of a key's segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyParts<'a> {
    pub kind: &'a str,
    pub namespace: Option<&'a str>,
    pub name: &'a str,
}

/// Extract the identity of a resource.
///
/// Fails only when the object lacks a kind or name, or a segment contains
/// the separator.
pub fn key_for<R: Resource + ?Sized>(obj: &R) -> Result<Key, KeyError> {
    let kind = obj.kind();
    if kind.is_empty() {
        return Err(KeyError::MissingKind);
    }

    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| KeyError::MissingName {
            kind: kind.to_string(),
        })?;

    Key::new(kind, meta.namespace.as_deref(), name)
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() || value.contains(SEPARATOR) {
        return Err(KeyError::InvalidSegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{DynamicObject, ObjectMeta};

    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(ObjectMeta::namespaced("prod", "web-0"), "Pod/prod/web-0")]
    #[case(ObjectMeta::cluster_scoped("web-0"), "Pod/web-0")]
    #[case(ObjectMeta::namespaced("", "web-0"), "Pod/web-0")]
    fn test_key_for(#[case] meta: ObjectMeta, #[case] expected: &str) {
        let obj = DynamicObject::new("Pod", meta);
        assert_eq!(key_for(&obj).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case(DynamicObject::new("", ObjectMeta::cluster_scoped("a")), KeyError::MissingKind)]
    #[case(
        DynamicObject::new("Pod", ObjectMeta::default()),
        KeyError::MissingName { kind: "Pod".to_string() }
    )]
    #[case(
        DynamicObject::new("Pod", ObjectMeta::namespaced("prod", "")),
        KeyError::MissingName { kind: "Pod".to_string() }
    )]
    #[case(
        DynamicObject::new("Pod", ObjectMeta::namespaced("a/b", "c")),
        KeyError::InvalidSegment { field: "namespace", value: "a/b".to_string() }
    )]
    fn test_key_for_malformed(#[case] obj: DynamicObject, #[case] expected: KeyError) {
        assert_eq!(key_for(&obj).unwrap_err(), expected);
    }

    #[test]
    fn test_key_stable_across_updates() {
        let v1 = DynamicObject::new("Pod", ObjectMeta::namespaced("prod", "web-0"))
            .with_resource_version("1");
        let v2 = v1
            .clone()
            .with_resource_version("2")
            .with_spec(serde_json::json!({"replicas": 3}));

        assert_eq!(key_for(&v1).unwrap(), key_for(&v2).unwrap());
    }

    #[test]
    fn test_parts() {
        let key = Key::new("Pod", Some("prod"), "web-0").unwrap();
        let parts = key.parts().unwrap();
        assert_eq!(parts.kind, "Pod");
        assert_eq!(parts.namespace, Some("prod"));
        assert_eq!(parts.name, "web-0");

        let key = Key::new("Node", None, "worker-1").unwrap();
        assert_eq!(key.parts().unwrap().namespace, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Key::parse("Pod").is_err());
        assert!(Key::parse("Pod//web").is_err());
        assert!(Key::parse("a/b/c/d").is_err());
        assert_eq!(Key::parse("Pod/prod/web").unwrap().as_str(), "Pod/prod/web");
    }

    #[test]
    fn test_deserialize_validates() {
        let key: Key = serde_json::from_str(r#""Pod/prod/web""#).unwrap();
        assert_eq!(key, Key::new("Pod", Some("prod"), "web").unwrap());
        assert_eq!(serde_json::to_string(&key).unwrap(), r#""Pod/prod/web""#);

        assert!(serde_json::from_str::<Key>(r#""a/b/c/d""#).is_err());
        assert!(serde_json::from_str::<Key>(r#""Pod//web""#).is_err());
        assert!(serde_json::from_str::<Key>(r#""Pod""#).is_err());
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9.-]{1,8}"
    }

    proptest! {
        #[test]
        fn distinct_resources_never_collide(
            a in (segment(), proptest::option::of(segment()), segment()),
            b in (segment(), proptest::option::of(segment()), segment()),
        ) {
            prop_assume!(a != b);
            let ka = Key::new(&a.0, a.1.as_deref(), &a.2).unwrap();
            let kb = Key::new(&b.0, b.1.as_deref(), &b.2).unwrap();
            prop_assert_ne!(ka, kb);
        }
    }
}
