use std::time::Duration;

use crate::error::ChangeError;

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PUSH_ATTEMPTS: u32 = 3;
pub const DEFAULT_AUTOMERGE_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_AUTOMERGE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_UNPUSHED_GRACE: Duration = Duration::from_secs(5 * 60);

pub const ENV_GIT_TIMEOUT: &str = "FOXOPS_GIT_TIMEOUT_SECS";
pub const ENV_PUSH_ATTEMPTS: &str = "FOXOPS_PUSH_ATTEMPTS";
pub const ENV_AUTOMERGE_POLL_INTERVAL: &str = "FOXOPS_AUTOMERGE_POLL_INTERVAL_SECS";
pub const ENV_AUTOMERGE_TIMEOUT: &str = "FOXOPS_AUTOMERGE_TIMEOUT_SECS";
pub const ENV_UNPUSHED_GRACE: &str = "FOXOPS_UNPUSHED_GRACE_SECS";

/// Tunables of the change orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Deadline for each git subprocess.
    pub git_timeout: Duration,
    /// Total push attempts when the remote diverged (at least 1).
    pub push_attempts: u32,
    pub automerge_poll_interval: Duration,
    /// Give up waiting for a blocked automerge after this long; the merge
    /// request stays open.
    pub automerge_timeout: Duration,
    /// Unconfirmed change records younger than this are left alone by
    /// `reconcile_unpushed_changes`.
    pub unpushed_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            git_timeout: DEFAULT_GIT_TIMEOUT,
            push_attempts: DEFAULT_PUSH_ATTEMPTS,
            automerge_poll_interval: DEFAULT_AUTOMERGE_POLL_INTERVAL,
            automerge_timeout: DEFAULT_AUTOMERGE_TIMEOUT,
            unpushed_grace: DEFAULT_UNPUSHED_GRACE,
        }
    }
}

impl Settings {
    /// Defaults overridden by `FOXOPS_*` environment variables.
    pub fn from_env() -> Result<Self, ChangeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ChangeError> {
        let mut settings = Self::default();
        if let Some(secs) = parse_u64(&lookup, ENV_GIT_TIMEOUT)? {
            settings.git_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_u64(&lookup, ENV_PUSH_ATTEMPTS)? {
            settings.push_attempts = u32::try_from(attempts)
                .ok()
                .filter(|a| *a >= 1)
                .ok_or_else(|| ChangeError::InvalidSetting {
                    name: ENV_PUSH_ATTEMPTS.into(),
                    value: attempts.to_string(),
                    reason: "must be between 1 and 4294967295".into(),
                })?;
        }
        if let Some(secs) = parse_u64(&lookup, ENV_AUTOMERGE_POLL_INTERVAL)? {
            settings.automerge_poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, ENV_AUTOMERGE_TIMEOUT)? {
            settings.automerge_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, ENV_UNPUSHED_GRACE)? {
            settings.unpushed_grace = Duration::from_secs(secs);
        }
        Ok(settings)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<u64>, ChangeError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| ChangeError::InvalidSetting {
            name: name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}
