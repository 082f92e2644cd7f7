//! Resolution of a caller's login to an enriched directory record.
//!
//! Two tiers are kept: the bulk organization directory, refreshed as a whole,
//! and enriched records per login. Each login has its own lock, so concurrent
//! requests for one login trigger a single enrichment while requests for other
//! logins proceed independently.

use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::clock::{Clock, Expiring};
use crate::host_client::{HostClient, HostError};
use crate::metrics_defs::{DIRECTORY_REFRESHES, DIRECTORY_SIZE, USER_CACHE_HITS, USER_CACHE_MISSES};
use crate::settings::EffectiveSettings;
use crate::types::DirectoryUser;
use shared::{counter, gauge};

#[derive(thiserror::Error, Debug)]
pub enum IdentityError {
    #[error("user {0:?} not found in organization directory")]
    UserNotFound(String),
    #[error("failed to fetch organization directory: {0}")]
    Directory(#[source] HostError),
    #[error("failed to enrich user {login:?}: {source}")]
    Enrichment {
        login: String,
        #[source]
        source: HostError,
    },
}

type Directory = Arc<HashMap<String, DirectoryUser>>;
type UserSlot = Arc<Mutex<Option<Expiring<DirectoryUser>>>>;

pub struct IdentityCache {
    host: HostClient,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    directory: Mutex<Option<Expiring<Directory>>>,
    users: SyncMutex<HashMap<String, UserSlot>>,
}

impl IdentityCache {
    pub fn new(host: HostClient, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        IdentityCache {
            host,
            clock,
            ttl,
            directory: Mutex::new(None),
            users: SyncMutex::new(HashMap::new()),
        }
    }

    /// Returns the enriched record for `login`.
    ///
    /// Teams are attached when external service accounts are enabled and
    /// permissions when RBAC is enabled. Enrichment is all-or-nothing: a failure
    /// caches nothing and the next call retries.
    pub async fn resolve(
        &self,
        settings: &EffectiveSettings,
        login: &str,
    ) -> Result<DirectoryUser, IdentityError> {
        let slot = self.user_slot(login);
        let mut entry = slot.lock().await;

        if let Some(user) = entry.as_ref().and_then(|e| e.fresh(self.clock.now())) {
            counter!(USER_CACHE_HITS).increment(1);
            return Ok(user.clone());
        }
        counter!(USER_CACHE_MISSES).increment(1);

        let mut user = self.directory_user(settings, login).await?;

        if settings.external_service_account_enabled {
            user.teams = self
                .host
                .user_teams(settings, user.id)
                .await
                .map_err(|source| enrichment_error(login, source))?;
        }
        if settings.rbac_enabled {
            user.permissions = self
                .host
                .user_permissions(settings, user.id)
                .await
                .map_err(|source| enrichment_error(login, source))?;
        }

        tracing::debug!(login, user_id = user.id, "enriched caller identity");
        *entry = Some(Expiring::new(user.clone(), self.clock.now(), self.ttl));
        Ok(user)
    }

    /// Looks `login` up in the bulk directory, refreshing it when stale.
    async fn directory_user(
        &self,
        settings: &EffectiveSettings,
        login: &str,
    ) -> Result<DirectoryUser, IdentityError> {
        let mut directory = self.directory.lock().await;

        let users = match directory.as_ref().and_then(|d| d.fresh(self.clock.now())) {
            Some(users) => users.clone(),
            None => {
                counter!(DIRECTORY_REFRESHES).increment(1);
                let fetched = self
                    .host
                    .org_users(settings)
                    .await
                    .map_err(IdentityError::Directory)?;
                gauge!(DIRECTORY_SIZE).set(fetched.len() as f64);

                let users: Directory = Arc::new(
                    fetched
                        .into_iter()
                        .map(|u| (u.login.clone(), u))
                        .collect(),
                );
                *directory = Some(Expiring::new(users.clone(), self.clock.now(), self.ttl));
                users
            }
        };
        drop(directory);

        users
            .get(login)
            .cloned()
            .ok_or_else(|| IdentityError::UserNotFound(login.to_string()))
    }

    fn user_slot(&self, login: &str) -> UserSlot {
        self.users
            .lock()
            .entry(login.to_string())
            .or_default()
            .clone()
    }
}

fn enrichment_error(login: &str, source: HostError) -> IdentityError {
    tracing::warn!(login, error = %source, "failed to enrich caller identity");
    IdentityError::Enrichment {
        login: login.to_string(),
        source,
    }
}
