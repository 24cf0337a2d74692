use crate::resource::CommitSha;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Push payload fields the worker cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub commit: Option<CommitSha>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    GitHub,
    GitLab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
        }
    }
}

/// Request data the HTTP layer extracts from headers and body.
#[derive(Debug, Default)]
pub struct Delivery<'a> {
    pub github_event: Option<&'a str>,
    pub gitlab_event: Option<&'a str>,
    /// `X-Hub-Signature-256` value, `sha256=<hex>`.
    pub signature: Option<&'a str>,
    /// `X-Gitlab-Token` value.
    pub token: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted(Push),
    /// Known provider, but not a push event.
    Ignored,
}

/// Rejections map onto the HTTP status codes of the webhook contract.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("unknown webhook provider")]
    UnknownProvider,
    #[error("invalid payload")]
    InvalidPayload,
    #[error("missing or invalid signature")]
    Unauthenticated,
    #[error("webhook secret not configured")]
    SecretNotConfigured,
}

/// Repository names accepted on the webhook URL.
pub fn valid_repo_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

pub fn detect_provider(delivery: &Delivery<'_>) -> Option<Provider> {
    if delivery.github_event.is_some() {
        Some(Provider::GitHub)
    } else if delivery.gitlab_event.is_some() {
        Some(Provider::GitLab)
    } else {
        None
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// GitHub: HMAC-SHA256 of the raw body, compared constant-time against
/// the `sha256=<hex>` header value.
pub fn verify_github(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// GitLab: shared token, compared constant-time.
pub fn verify_gitlab(secret: &str, token: &str) -> bool {
    constant_time_eq(secret.as_bytes(), token.as_bytes())
}

/// Lower-case hex only, per the webhook contract; no case normalization.
fn parse_commit(value: Option<&str>) -> Option<CommitSha> {
    let s = value?;
    if (s.len() == 40 || s.len() == 64) && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        CommitSha::new(s).ok()
    } else {
        None
    }
}

fn parse_branch(value: Option<&str>) -> Option<String> {
    value.map(|r| r.strip_prefix("refs/heads/").unwrap_or(r).to_string())
}

fn parse_push(body: &[u8]) -> Result<Push, Rejection> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|_| Rejection::InvalidPayload)?;
    if !payload.is_object() {
        return Err(Rejection::InvalidPayload);
    }
    Ok(Push {
        commit: parse_commit(payload.get("after").and_then(Value::as_str)),
        branch: parse_branch(payload.get("ref").and_then(Value::as_str)),
    })
}

/// Authenticates and parses one webhook delivery. Authentication comes
/// first: an unauthenticated request never reaches payload parsing, let
/// alone a worker.
pub fn handle(delivery: &Delivery<'_>, secret: Option<&str>) -> Result<Outcome, Rejection> {
    let provider = detect_provider(delivery).ok_or(Rejection::UnknownProvider)?;
    let secret = secret.ok_or(Rejection::SecretNotConfigured)?;

    let authenticated = match provider {
        Provider::GitHub => delivery
            .signature
            .map(|sig| verify_github(secret, sig, delivery.body))
            .unwrap_or(false),
        Provider::GitLab => delivery
            .token
            .map(|token| verify_gitlab(secret, token))
            .unwrap_or(false),
    };
    if !authenticated {
        return Err(Rejection::Unauthenticated);
    }

    let is_push = match provider {
        Provider::GitHub => delivery.github_event == Some("push"),
        Provider::GitLab => delivery.gitlab_event == Some("Push Hook"),
    };
    if !is_push {
        return Ok(Outcome::Ignored);
    }

    Ok(Outcome::Accepted(parse_push(delivery.body)?))
}

#[cfg(test)]
mod test {
    use super::*;

    const SECRET: &str = "hunter2";

    fn github_signature(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn push_body(after: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "ref": "refs/heads/main",
            "after": after,
        }))
        .unwrap()
    }

    #[test]
    fn repo_name_pattern() {
        assert!(valid_repo_name("acme"));
        assert!(valid_repo_name("team.acme_app-2"));
        assert!(!valid_repo_name(""));
        assert!(!valid_repo_name("acme/evil"));
        assert!(!valid_repo_name("acme repo"));
    }

    #[test]
    fn github_round_trip() {
        let body = push_body(&"a".repeat(40));
        let signature = github_signature(SECRET, &body);
        let delivery = Delivery {
            github_event: Some("push"),
            signature: Some(&signature),
            body: &body,
            ..Delivery::default()
        };
        let outcome = handle(&delivery, Some(SECRET)).unwrap();
        let Outcome::Accepted(push) = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(push.branch.as_deref(), Some("main"));
        assert_eq!(push.commit.unwrap().as_str(), "a".repeat(40));
    }

    #[test]
    fn github_wrong_secret_is_unauthenticated() {
        let body = push_body(&"a".repeat(40));
        let signature = github_signature("wrong", &body);
        let delivery = Delivery {
            github_event: Some("push"),
            signature: Some(&signature),
            body: &body,
            ..Delivery::default()
        };
        assert_eq!(handle(&delivery, Some(SECRET)), Err(Rejection::Unauthenticated));
    }

    #[test]
    fn github_missing_signature_is_unauthenticated() {
        let body = push_body(&"a".repeat(40));
        let delivery = Delivery {
            github_event: Some("push"),
            body: &body,
            ..Delivery::default()
        };
        assert_eq!(handle(&delivery, Some(SECRET)), Err(Rejection::Unauthenticated));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let body = push_body(&"a".repeat(40));
        let signature = github_signature(SECRET, &body);
        let tampered = push_body(&"b".repeat(40));
        assert!(!verify_github(SECRET, &signature, &tampered));
    }

    #[test]
    fn gitlab_token_compare() {
        let body = push_body(&"c".repeat(64));
        let delivery = Delivery {
            gitlab_event: Some("Push Hook"),
            token: Some(SECRET),
            body: &body,
            ..Delivery::default()
        };
        let Outcome::Accepted(push) = handle(&delivery, Some(SECRET)).unwrap() else {
            panic!("expected acceptance");
        };
        assert_eq!(push.commit.unwrap().as_str(), "c".repeat(64));

        let delivery = Delivery {
            gitlab_event: Some("Push Hook"),
            token: Some("nope"),
            body: &body,
            ..Delivery::default()
        };
        assert_eq!(handle(&delivery, Some(SECRET)), Err(Rejection::Unauthenticated));
    }

    #[test]
    fn non_push_events_are_ignored() {
        let body = b"{}".to_vec();
        let signature = github_signature(SECRET, &body);
        let delivery = Delivery {
            github_event: Some("ping"),
            signature: Some(&signature),
            body: &body,
            ..Delivery::default()
        };
        assert_eq!(handle(&delivery, Some(SECRET)), Ok(Outcome::Ignored));
    }

    #[test]
    fn unknown_provider_and_missing_secret() {
        let delivery = Delivery {
            body: b"{}",
            ..Delivery::default()
        };
        assert_eq!(handle(&delivery, Some(SECRET)), Err(Rejection::UnknownProvider));

        let delivery = Delivery {
            github_event: Some("push"),
            body: b"{}",
            ..Delivery::default()
        };
        assert_eq!(handle(&delivery, None), Err(Rejection::SecretNotConfigured));
    }

    #[test]
    fn commit_must_be_lowercase_full_length_hex() {
        assert!(parse_commit(Some(&"a".repeat(40))).is_some());
        assert!(parse_commit(Some(&"f".repeat(64))).is_some());
        assert!(parse_commit(Some(&"A".repeat(40))).is_none());
        assert!(parse_commit(Some("deadbeef")).is_none());
        assert!(parse_commit(None).is_none());
    }

    #[test]
    fn branch_strips_refs_heads_prefix() {
        assert_eq!(parse_branch(Some("refs/heads/main")).as_deref(), Some("main"));
        assert_eq!(parse_branch(Some("main")).as_deref(), Some("main"));
    }

    #[test]
    fn invalid_json_payload_is_rejected() {
        let body = b"not json".to_vec();
        let signature = github_signature(SECRET, &body);
        let delivery = Delivery {
            github_event: Some("push"),
            signature: Some(&signature),
            body: &body,
            ..Delivery::default()
        };
        assert_eq!(handle(&delivery, Some(SECRET)), Err(Rejection::InvalidPayload));
    }
}
