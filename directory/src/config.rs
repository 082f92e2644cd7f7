use serde::Deserialize;
use std::time::Duration;

use crate::settings::{LABELS_PLUGIN_ID, ONCALL_PLUGIN_ID};

/// Timeouts and cache lifetimes for calls to the host platform.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Timeout for single-object host API calls
    pub api_timeout_secs: u64,
    /// Timeout for directory listing and team membership calls
    pub directory_timeout_secs: u64,
    /// Lifetime of both the bulk directory snapshot and enriched per-user records
    pub user_ttl_secs: u64,
    /// Lifetime of the sibling plugin settings snapshot
    pub plugin_settings_ttl_secs: u64,
    /// Plugin ids whose RBAC actions are forwarded to the external service
    pub permission_plugin_ids: Vec<String>,
    /// Maximum number of team membership requests in flight during a sync
    pub team_members_concurrency: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            api_timeout_secs: 10,
            directory_timeout_secs: 60,
            user_ttl_secs: 60,
            plugin_settings_ttl_secs: 60,
            permission_plugin_ids: vec![ONCALL_PLUGIN_ID.into(), LABELS_PLUGIN_ID.into()],
            team_members_concurrency: 8,
        }
    }
}

impl DirectoryConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }

    pub fn user_ttl(&self) -> Duration {
        Duration::from_secs(self.user_ttl_secs)
    }

    pub fn plugin_settings_ttl(&self) -> Duration {
        Duration::from_secs(self.plugin_settings_ttl_secs)
    }
}
