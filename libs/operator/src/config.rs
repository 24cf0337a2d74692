use crate::leader::LeaderConfig;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_HTTP_PORT: u16 = 4000;

/// Process configuration from the environment. Invalid values fall back
/// to the documented defaults with a warning.
#[derive(Debug, Clone)]
pub struct Config {
    pub pod_namespace: String,
    pub pod_name: String,
    pub watch_namespace: String,
    pub enable_leader_election: bool,
    pub cluster_enabled: bool,
    pub http_port: u16,
    pub webhook_secret: Option<String>,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: u64,
    pub renew_deadline_seconds: u64,
    pub retry_period_seconds: u64,
    pub repo_base_dir: PathBuf,
    pub git_socket: PathBuf,
    pub git_command: Option<Vec<String>>,
}

fn lookup_parse<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = raw, "invalid value, using default");
                default
            }
        },
    }
}

fn lookup_bool<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> bool {
    match lookup(key).as_deref() {
        None => false,
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(other) => {
            warn!(key, value = other, "invalid boolean, using false");
            false
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let pod_namespace =
            lookup("POD_NAMESPACE").unwrap_or_else(|| "default".to_string());
        let pod_name = lookup("POD_NAME").unwrap_or_else(|| "nopea".to_string());
        let watch_namespace =
            lookup("WATCH_NAMESPACE").unwrap_or_else(|| pod_namespace.clone());
        let lease_namespace =
            lookup("NOPEA_LEADER_LEASE_NAMESPACE").unwrap_or_else(|| pod_namespace.clone());
        let git_command = lookup("NOPEA_GIT_COMMAND").map(|raw| {
            raw.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        Config {
            enable_leader_election: lookup_bool(&lookup, "NOPEA_ENABLE_LEADER_ELECTION"),
            cluster_enabled: lookup_bool(&lookup, "NOPEA_CLUSTER_ENABLED"),
            http_port: lookup_parse(&lookup, "NOPEA_HTTP_PORT", DEFAULT_HTTP_PORT),
            webhook_secret: lookup("NOPEA_WEBHOOK_SECRET").filter(|s| !s.is_empty()),
            lease_name: lookup("NOPEA_LEADER_LEASE_NAME")
                .unwrap_or_else(|| "nopea-leader".to_string()),
            lease_duration_seconds: lookup_parse(&lookup, "NOPEA_LEADER_LEASE_DURATION", 15),
            renew_deadline_seconds: lookup_parse(&lookup, "NOPEA_LEADER_LEASE_RENEW_DEADLINE", 10),
            retry_period_seconds: lookup_parse(&lookup, "NOPEA_LEADER_LEASE_RETRY_PERIOD", 2),
            repo_base_dir: lookup("NOPEA_REPO_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/nopea/repos")),
            git_socket: lookup("NOPEA_GIT_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/run/nopea/git.sock")),
            git_command,
            pod_namespace,
            pod_name,
            watch_namespace,
            lease_namespace,
        }
    }

    pub fn leader_config(&self) -> LeaderConfig {
        let mut config = LeaderConfig::new(
            self.lease_name.clone(),
            self.lease_namespace.clone(),
            self.pod_name.clone(),
        );
        config.lease_duration = Duration::from_secs(self.lease_duration_seconds);
        config.renew_deadline = Duration::from_secs(self.renew_deadline_seconds);
        config.retry_period = Duration::from_secs(self.retry_period_seconds);
        config
    }
}
