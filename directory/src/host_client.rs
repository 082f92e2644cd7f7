//! Client for the host platform HTTP API.
//!
//! All calls authenticate with the bearer token from the effective settings.

use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::DirectoryConfig;
use crate::metrics_defs::{HOST_REQUEST_DURATION, HOST_REQUESTS};
use crate::settings::{EffectiveSettings, ONCALL_PLUGIN_ID};
use crate::types::{DirectoryUser, Permission, Team};
use shared::http::join_path;
use shared::{counter, histogram};

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("invalid host platform URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned status {status}")]
    UnexpectedStatus {
        endpoint: &'static str,
        status: StatusCode,
    },
    #[error("could not decode {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("team membership task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrgUserRecord {
    user_id: i64,
    #[serde(default)]
    name: String,
    login: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    avatar_url: String,
    #[serde(default)]
    role: String,
}

#[derive(Deserialize)]
struct TeamSearchPage {
    teams: Vec<TeamRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamRecord {
    id: i64,
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    avatar_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamMemberRecord {
    user_id: i64,
}

#[derive(Deserialize)]
struct UserTeamRecord {
    id: i64,
}

/// Settings record the host keeps for another installed plugin.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PluginSettingsRecord {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "jsonData", default)]
    pub json_data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl PluginSettingsRecord {
    pub fn json_str(&self, key: &str) -> Option<&str> {
        self.json_data.as_ref()?.get(key)?.as_str()
    }
}

/// Permissions keyed by user id, as returned by the bulk permission search.
type PermissionSearch = HashMap<String, HashMap<String, serde_json::Value>>;

#[derive(Clone)]
pub struct HostClient {
    client: reqwest::Client,
    api_timeout: Duration,
    directory_timeout: Duration,
    permission_plugin_ids: Arc<[String]>,
    team_members_concurrency: usize,
}

impl HostClient {
    pub fn new(client: reqwest::Client, config: &DirectoryConfig) -> Self {
        HostClient {
            client,
            api_timeout: config.api_timeout(),
            directory_timeout: config.directory_timeout(),
            permission_plugin_ids: config.permission_plugin_ids.clone().into(),
            team_members_concurrency: config.team_members_concurrency.max(1),
        }
    }

    pub fn permission_plugin_ids(&self) -> &[String] {
        &self.permission_plugin_ids
    }

    async fn send(
        &self,
        endpoint: &'static str,
        request: reqwest::RequestBuilder,
        settings: &EffectiveSettings,
        timeout: Duration,
    ) -> Result<reqwest::Response, HostError> {
        let start = Instant::now();
        let result = request
            .bearer_auth(&settings.grafana_token)
            .timeout(timeout)
            .send()
            .await;
        histogram!(HOST_REQUEST_DURATION, "endpoint" => endpoint)
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                counter!(HOST_REQUESTS, "endpoint" => endpoint, "outcome" => "response")
                    .increment(1);
                Ok(response)
            }
            Err(source) => {
                counter!(HOST_REQUESTS, "endpoint" => endpoint, "outcome" => "error")
                    .increment(1);
                Err(HostError::Request { endpoint, source })
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        settings: &EffectiveSettings,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<T, HostError> {
        let url = join_path(&settings.grafana_url, path)?;
        let request = self.client.get(url).query(query);
        let response = self.send(endpoint, request, settings, timeout).await?;

        if response.status() != StatusCode::OK {
            return Err(HostError::UnexpectedStatus {
                endpoint,
                status: response.status(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| HostError::Decode { endpoint, source })
    }

    /// Lists every user of the organization, without teams or permissions.
    pub async fn org_users(
        &self,
        settings: &EffectiveSettings,
    ) -> Result<Vec<DirectoryUser>, HostError> {
        let records: Vec<OrgUserRecord> = self
            .get_json("org_users", settings, "api/org/users", &[], self.directory_timeout)
            .await?;

        Ok(records
            .into_iter()
            .map(|r| DirectoryUser {
                id: r.user_id,
                name: r.name,
                login: r.login,
                email: r.email,
                role: r.role,
                avatar_url: r.avatar_url,
                permissions: Vec::new(),
                teams: Vec::new(),
            })
            .collect())
    }

    /// Lists every user and, when RBAC is enabled, attaches their relevant
    /// permissions from the bulk permission search.
    pub async fn org_users_with_permissions(
        &self,
        settings: &EffectiveSettings,
    ) -> Result<Vec<DirectoryUser>, HostError> {
        let mut users = self.org_users(settings).await?;
        if !settings.rbac_enabled {
            return Ok(users);
        }

        let mut by_user = self.all_permissions(settings).await?;
        for user in &mut users {
            match by_user.remove(&user.id.to_string()) {
                Some(actions) => {
                    user.permissions = actions.into_iter().map(Permission::new).collect();
                }
                None => {
                    tracing::warn!(user_id = user.id, "no permissions found for user");
                }
            }
        }
        Ok(users)
    }

    async fn all_permissions(
        &self,
        settings: &EffectiveSettings,
    ) -> Result<HashMap<String, BTreeSet<String>>, HostError> {
        let mut merged: HashMap<String, BTreeSet<String>> = HashMap::new();
        for plugin_id in self.permission_plugin_ids.iter() {
            let page: PermissionSearch = self
                .get_json(
                    "permissions_search",
                    settings,
                    "api/access-control/users/permissions/search",
                    &[("actionPrefix", plugin_id.as_str())],
                    self.directory_timeout,
                )
                .await?;
            for (user_id, actions) in page {
                merged.entry(user_id).or_default().extend(actions.into_keys());
            }
        }
        Ok(merged)
    }

    /// Permissions of one user restricted to the configured plugin prefixes.
    pub async fn user_permissions(
        &self,
        settings: &EffectiveSettings,
        user_id: i64,
    ) -> Result<Vec<Permission>, HostError> {
        let path = format!("api/access-control/users/{user_id}/permissions");
        let all: HashMap<String, serde_json::Value> = self
            .get_json("user_permissions", settings, &path, &[], self.api_timeout)
            .await?;
        Ok(filter_permissions(all.into_keys(), &self.permission_plugin_ids))
    }

    pub async fn user_teams(
        &self,
        settings: &EffectiveSettings,
        user_id: i64,
    ) -> Result<Vec<i64>, HostError> {
        let path = format!("api/users/{user_id}/teams");
        let teams: Vec<UserTeamRecord> = self
            .get_json("user_teams", settings, &path, &[], self.api_timeout)
            .await?;
        Ok(teams.into_iter().map(|t| t.id).collect())
    }

    pub async fn teams(&self, settings: &EffectiveSettings) -> Result<Vec<Team>, HostError> {
        let page: TeamSearchPage = self
            .get_json(
                "teams_search",
                settings,
                "api/teams/search",
                &[("perpage", "1000000")],
                self.directory_timeout,
            )
            .await?;

        Ok(page
            .teams
            .into_iter()
            .map(|t| Team {
                id: t.id,
                name: t.name,
                email: t.email,
                avatar_url: t.avatar_url,
            })
            .collect())
    }

    pub async fn team_members(
        &self,
        settings: &EffectiveSettings,
        team_id: i64,
    ) -> Result<Vec<i64>, HostError> {
        let path = format!("api/teams/{team_id}/members");
        let members: Vec<TeamMemberRecord> = self
            .get_json("team_members", settings, &path, &[], self.directory_timeout)
            .await?;
        Ok(members.into_iter().map(|m| m.user_id).collect())
    }

    /// Fetches the member list of every team with bounded concurrency.
    ///
    /// Fails as a whole if any single team fails.
    pub async fn all_team_members(
        &self,
        settings: &EffectiveSettings,
        teams: &[Team],
    ) -> Result<HashMap<i64, Vec<i64>>, HostError> {
        let permits = Arc::new(Semaphore::new(self.team_members_concurrency));
        let settings = Arc::new(settings.clone());
        let mut tasks = JoinSet::new();

        for team in teams {
            let client = self.clone();
            let settings = settings.clone();
            let permits = permits.clone();
            let team_id = team.id;
            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let members = client.team_members(&settings, team_id).await;
                (team_id, members)
            });
        }

        let mut result = HashMap::with_capacity(teams.len());
        while let Some(joined) = tasks.join_next().await {
            let (team_id, members) = joined?;
            result.insert(team_id, members?);
        }
        Ok(result)
    }

    /// Reads another plugin's settings. Any non-200 answer means "not installed".
    pub async fn plugin_settings(
        &self,
        settings: &EffectiveSettings,
        plugin_id: &str,
    ) -> Result<Option<PluginSettingsRecord>, HostError> {
        const ENDPOINT: &str = "plugin_settings";
        let url = join_path(&settings.grafana_url, &format!("api/plugins/{plugin_id}/settings"))?;
        let response = self
            .send(ENDPOINT, self.client.get(url), settings, self.api_timeout)
            .await?;

        if response.status() != StatusCode::OK {
            tracing::debug!(plugin_id, status = %response.status(), "plugin settings unavailable");
            return Ok(None);
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|source| HostError::Decode {
                endpoint: ENDPOINT,
                source,
            })
    }

    /// Stores `settings` as this plugin's persisted configuration.
    pub async fn save_plugin_settings(&self, settings: &EffectiveSettings) -> Result<(), HostError> {
        const ENDPOINT: &str = "save_plugin_settings";
        let url = join_path(
            &settings.grafana_url,
            &format!("api/plugins/{ONCALL_PLUGIN_ID}/settings"),
        )?;
        let request = self.client.post(url).json(&settings.write_back());
        let response = self
            .send(ENDPOINT, request, settings, self.api_timeout)
            .await?;

        if !response.status().is_success() {
            return Err(HostError::UnexpectedStatus {
                endpoint: ENDPOINT,
                status: response.status(),
            });
        }
        Ok(())
    }

    /// Probes the host's organization endpoint and returns its status code.
    pub async fn check_org(&self, settings: &EffectiveSettings) -> Result<StatusCode, HostError> {
        let url = join_path(&settings.grafana_url, "api/org")?;
        let response = self
            .send("org", self.client.get(url), settings, self.api_timeout)
            .await?;
        Ok(response.status())
    }
}

/// Keeps the actions that start with one of `prefixes`.
pub fn filter_permissions(
    actions: impl IntoIterator<Item = String>,
    prefixes: &[String],
) -> Vec<Permission> {
    actions
        .into_iter()
        .filter(|action| prefixes.iter().any(|prefix| action.starts_with(prefix.as_str())))
        .map(Permission::new)
        .collect()
}
