use crate::error::{Error, Result};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A validated git commit SHA, stored lower-case hex. 40 characters for
/// SHA-1 repositories, 64 for SHA-256 repositories. Deserialization goes
/// through the same validation as [`CommitSha::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitSha(String);

impl TryFrom<String> for CommitSha {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        CommitSha::new(s)
    }
}

impl From<CommitSha> for String {
    fn from(sha: CommitSha) -> String {
        sha.0
    }
}

impl CommitSha {
    pub fn new(s: impl AsRef<str>) -> Result<Self> {
        let normalized = s.as_ref().to_ascii_lowercase();
        if (normalized.len() == 40 || normalized.len() == 64)
            && normalized.bytes().all(|b| b.is_ascii_hexdigit())
        {
            Ok(CommitSha(normalized))
        } else {
            Err(Error::InvalidResource(format!(
                "not a commit SHA: {:?}",
                s.as_ref()
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First seven characters, the conventional short form.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for CommitSha {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CommitSha::new(s)
    }
}

/// Identity of a cluster object: `(kind, namespace, name)`. Namespace falls
/// back to `default` when the manifest carries none. Canonical text form is
/// `Kind/Namespace/Name` and must round-trip through [`ResourceKey::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        ResourceKey {
            kind: kind.into(),
            namespace: namespace.unwrap_or("default").to_string(),
            name: name.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(namespace), Some(name), None)
                if !kind.is_empty() && !namespace.is_empty() && !name.is_empty() =>
            {
                Ok(ResourceKey {
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::InvalidResource(format!(
                "not a resource key: {s:?}"
            ))),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A parsed Kubernetes object. Construction guarantees `apiVersion`, `kind`
/// and `metadata.name` are present; `metadata.namespace` stays optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    pub fn try_new(value: Value) -> std::result::Result<Self, String> {
        let api_version = value.get("apiVersion").and_then(Value::as_str);
        let kind = value.get("kind").and_then(Value::as_str);
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str);
        match (api_version, kind, name) {
            (Some(a), Some(k), Some(n)) if !a.is_empty() && !k.is_empty() && !n.is_empty() => {
                Ok(Manifest(value))
            }
            _ => Err("document is missing apiVersion, kind or metadata.name".to_string()),
        }
    }

    pub fn api_version(&self) -> &str {
        self.0
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.0
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.pointer("/metadata/namespace").and_then(Value::as_str)
    }

    /// Inserts `metadata.namespace` when the document has none.
    pub fn default_namespace(&mut self, namespace: &str) {
        if self.namespace().is_none() {
            if let Some(meta) = self.0.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert("namespace".to_string(), Value::String(namespace.to_string()));
            }
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), self.namespace(), self.name())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn sha_accepts_both_lengths_and_normalizes_case() {
        let short = "a".repeat(40);
        let long = "B".repeat(64);
        assert_eq!(CommitSha::new(&short).unwrap().as_str(), short);
        assert_eq!(CommitSha::new(&long).unwrap().as_str(), "b".repeat(64));
    }

    #[test]
    fn sha_rejects_bad_input() {
        assert!(CommitSha::new("abc").is_err());
        assert!(CommitSha::new("g".repeat(40)).is_err());
        assert!(CommitSha::new("a".repeat(41)).is_err());
        assert!(CommitSha::new("").is_err());
    }

    #[test]
    fn sha_short_form() {
        let sha = CommitSha::new("0123456789".repeat(4)).unwrap();
        assert_eq!(sha.short(), "0123456");
    }

    #[test]
    fn key_round_trips_through_text_form() {
        let key = ResourceKey::new("ConfigMap", Some("prod"), "app");
        let text = key.to_string();
        assert_eq!(text, "ConfigMap/prod/app");
        assert_eq!(ResourceKey::parse(&text).unwrap(), key);
    }

    #[test]
    fn key_defaults_namespace() {
        let key = ResourceKey::new("ConfigMap", None, "app");
        assert_eq!(key.namespace, "default");
    }

    #[test]
    fn key_parse_rejects_malformed() {
        assert!(ResourceKey::parse("ConfigMap/app").is_err());
        assert!(ResourceKey::parse("a/b/c/d").is_err());
        assert!(ResourceKey::parse("//x").is_err());
    }

    #[test]
    fn manifest_requires_identity_fields() {
        assert!(Manifest::try_new(json!({"kind": "ConfigMap"})).is_err());
        assert!(Manifest::try_new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "app"}
        }))
        .is_ok());
    }

    #[test]
    fn manifest_namespace_defaulting_is_idempotent() {
        let mut m = Manifest::try_new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "app", "namespace": "prod"}
        }))
        .unwrap();
        m.default_namespace("other");
        assert_eq!(m.namespace(), Some("prod"));

        let mut n = Manifest::try_new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "app"}
        }))
        .unwrap();
        n.default_namespace("prod");
        assert_eq!(n.namespace(), Some("prod"));
        assert_eq!(n.key().to_string(), "ConfigMap/prod/app");
    }
}
