//! Single-flight directory synchronization.
//!
//! At most one sync runs at a time. A run collects the full directory from the
//! host, compares it with the last pushed snapshot and pushes it to the
//! external service only when it changed or the run is forced. After any push
//! attempt the engine cools down; requests arriving while a run is active or
//! cooling down are rejected at once with an estimate of when to retry.
//!
//! ```text
//! Idle ──try_begin──▶ Running ──push attempted──▶ CoolingDown ──window over──▶ Idle
//!                        │
//!                        └── unchanged / failed before push ──▶ Idle
//! ```

use directory::clock::Clock;
use directory::host_client::{HostClient, HostError};
use directory::settings::EffectiveSettings;
use directory::types::{DirectoryUser, Team, unordered_eq};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SyncConfig;
use crate::headers::{HeaderError, service_headers};
use crate::metrics_defs::{SYNC_DURATION, SYNC_RUNS, SYNC_SNAPSHOT_USERS};
use crate::oncall_client::{OnCallClient, OnCallError};
use shared::{counter, gauge, histogram};

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("sync already in progress, retry in {}s", .retry_after.as_secs())]
    InProgress { retry_after: Duration },
    #[error("failed to collect directory: {0}")]
    Collect(#[from] HostError),
    #[error("failed to build sync headers: {0}")]
    Headers(#[from] HeaderError),
    #[error("failed to push snapshot: {0}")]
    Push(#[from] OnCallError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Pushed,
    Unchanged,
}

/// Everything the external service needs to mirror the host directory.
///
/// Equality ignores the order of users, teams and team members.
#[derive(Clone, Debug, Serialize)]
pub struct SyncSnapshot {
    pub users: Vec<DirectoryUser>,
    pub teams: Vec<Team>,
    pub team_members: HashMap<i64, Vec<i64>>,
    pub settings: EffectiveSettings,
}

impl PartialEq for SyncSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.settings == other.settings
            && same_by_id(&self.users, &other.users, |u| u.id)
            && same_by_id(&self.teams, &other.teams, |t| t.id)
            && self.team_members.len() == other.team_members.len()
            && self.team_members.iter().all(|(team_id, members)| {
                other
                    .team_members
                    .get(team_id)
                    .is_some_and(|theirs| unordered_eq(members, theirs))
            })
    }
}

fn same_by_id<T: PartialEq>(a: &[T], b: &[T], id: impl Fn(&T) -> i64) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&T> = a.iter().collect();
    let mut b: Vec<&T> = b.iter().collect();
    a.sort_by_key(|item| id(item));
    b.sort_by_key(|item| id(item));
    a == b
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Running { started: Instant },
    CoolingDown { until: Instant },
}

struct State {
    phase: Phase,
    last_duration: Option<Duration>,
}

struct Inner {
    host: HostClient,
    oncall: OnCallClient,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    gzip: bool,
    state: Mutex<State>,
    last_pushed: Mutex<Option<Arc<SyncSnapshot>>>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        host: HostClient,
        oncall: OnCallClient,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        SyncEngine {
            inner: Arc::new(Inner {
                host,
                oncall,
                clock,
                cooldown: config.cooldown(),
                gzip: config.gzip,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    last_duration: None,
                }),
                last_pushed: Mutex::new(None),
            }),
        }
    }

    /// Runs a sync and waits for it to finish.
    pub async fn sync(
        &self,
        settings: &EffectiveSettings,
        user_agent: &str,
        force: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let permit = self.try_begin()?;
        self.inner.run(permit, settings, user_agent, force).await
    }

    /// Starts a sync in the background. Admission is decided before returning,
    /// so an in-progress rejection is still reported to the caller.
    pub fn spawn(
        &self,
        settings: EffectiveSettings,
        user_agent: String,
        force: bool,
    ) -> Result<(), SyncError> {
        let permit = self.try_begin()?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.run(permit, &settings, &user_agent, force).await {
                tracing::error!(error = %e, "background sync failed");
            }
        });
        Ok(())
    }

    fn try_begin(&self) -> Result<RunPermit, SyncError> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        let retry_after = match state.phase {
            Phase::Running { started } => Some(
                state
                    .last_duration
                    .unwrap_or_default()
                    .saturating_sub(now.saturating_duration_since(started)),
            ),
            Phase::CoolingDown { until } if now < until => Some(until - now),
            Phase::CoolingDown { .. } | Phase::Idle => None,
        };

        if let Some(retry_after) = retry_after {
            counter!(SYNC_RUNS, "outcome" => "rejected").increment(1);
            return Err(SyncError::InProgress { retry_after });
        }

        state.phase = Phase::Running { started: now };
        Ok(RunPermit {
            inner: self.inner.clone(),
            started: now,
            cool_down: false,
        })
    }
}

impl Inner {
    async fn run(
        &self,
        mut permit: RunPermit,
        settings: &EffectiveSettings,
        user_agent: &str,
        force: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let result = self.run_inner(&mut permit, settings, user_agent, force).await;
        let outcome = match &result {
            Ok(SyncOutcome::Pushed) => "pushed",
            Ok(SyncOutcome::Unchanged) => "unchanged",
            Err(_) => "failed",
        };
        counter!(SYNC_RUNS, "outcome" => outcome).increment(1);
        result
    }

    async fn run_inner(
        &self,
        permit: &mut RunPermit,
        settings: &EffectiveSettings,
        user_agent: &str,
        force: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let headers = service_headers(settings, user_agent)?;
        let snapshot = self.collect(settings).await?;

        let changed = force || self.last_pushed.lock().as_deref() != Some(&snapshot);
        if !changed {
            tracing::debug!("directory unchanged since last push, skipping sync");
            return Ok(SyncOutcome::Unchanged);
        }

        // Recorded before pushing so a rejected snapshot is not retried until
        // the directory changes again.
        let snapshot = Arc::new(snapshot);
        *self.last_pushed.lock() = Some(snapshot.clone());
        permit.cool_down = true;

        self.oncall
            .push_sync(settings, headers, snapshot.as_ref(), self.gzip)
            .await?;
        tracing::info!(
            users = snapshot.users.len(),
            teams = snapshot.teams.len(),
            forced = force,
            "pushed directory snapshot"
        );
        Ok(SyncOutcome::Pushed)
    }

    async fn collect(&self, settings: &EffectiveSettings) -> Result<SyncSnapshot, HostError> {
        let users = self.host.org_users_with_permissions(settings).await?;
        let teams = self.host.teams(settings).await?;
        let team_members = self.host.all_team_members(settings, &teams).await?;
        gauge!(SYNC_SNAPSHOT_USERS).set(users.len() as f64);

        Ok(SyncSnapshot {
            users,
            teams,
            team_members,
            settings: settings.clone(),
        })
    }
}

/// Exclusive right to run a sync. Leaving the running phase happens on drop,
/// so failures and panics release the engine too.
struct RunPermit {
    inner: Arc<Inner>,
    started: Instant,
    cool_down: bool,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        let now = self.inner.clock.now();
        let elapsed = now.saturating_duration_since(self.started);
        histogram!(SYNC_DURATION).record(elapsed.as_secs_f64());

        let mut state = self.inner.state.lock();
        state.last_duration = Some(elapsed);
        state.phase = if self.cool_down {
            Phase::CoolingDown {
                until: now + self.inner.cooldown,
            }
        } else {
            Phase::Idle
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{oncall_client, settings_for};
    use directory::clock::ManualClock;
    use directory::config::DirectoryConfig;
    use directory::types::Permission;
    use httpmock::prelude::*;
    use serde_json::json;

    const UA: &str = "GrafanaOnCall/1.2.3";

    fn engine(clock: Arc<ManualClock>) -> SyncEngine {
        let host = HostClient::new(reqwest::Client::new(), &DirectoryConfig::default());
        let config = SyncConfig {
            cooldown_secs: 300,
            gzip: false,
            interval_secs: None,
        };
        SyncEngine::new(host, oncall_client(), clock, &config)
    }

    async fn mock_directory(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org/users");
                then.status(200).json_body(json!([
                    {"userId": 1, "name": "Alice", "login": "alice", "email": "a@example.com", "avatarUrl": "", "role": "Admin"}
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/teams/search");
                then.status(200)
                    .json_body(json!({"teams": [{"id": 3, "name": "SRE", "email": "", "avatarUrl": ""}]}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/teams/3/members");
                then.status(200).json_body(json!([{"userId": 1}]));
            })
            .await;
    }

    fn snapshot() -> SyncSnapshot {
        SyncSnapshot {
            users: vec![
                DirectoryUser {
                    id: 1,
                    login: "alice".into(),
                    permissions: vec![Permission::new("a"), Permission::new("b")],
                    ..Default::default()
                },
                DirectoryUser {
                    id: 2,
                    login: "bob".into(),
                    ..Default::default()
                },
            ],
            teams: vec![
                Team { id: 1, name: "one".into(), ..Default::default() },
                Team { id: 2, name: "two".into(), ..Default::default() },
            ],
            team_members: HashMap::from([(1, vec![1, 2]), (2, vec![])]),
            settings: EffectiveSettings::default(),
        }
    }

    #[test]
    fn test_snapshot_equality_ignores_order() {
        let a = snapshot();
        let mut b = snapshot();
        b.users.reverse();
        b.users[1].permissions.reverse();
        b.teams.reverse();
        b.team_members.insert(1, vec![2, 1]);
        assert_eq!(a, b);

        let mut c = snapshot();
        c.team_members.insert(2, vec![1]);
        assert_ne!(a, c);

        let mut d = snapshot();
        d.settings.labels_enabled = true;
        assert_ne!(a, d);

        let mut e = snapshot();
        e.users.pop();
        assert_ne!(a, e);
    }

    #[test]
    fn test_snapshot_wire_format() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["team_members"]["1"], json!([1, 2]));
        assert_eq!(json["teams"][0]["team_id"], 1);
        assert!(json["settings"].is_object());
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_pushed_once() {
        let server = MockServer::start_async().await;
        mock_directory(&server).await;
        let push = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/internal/v1/plugin/v2/sync")
                    .header("authorization", "oncall-token");
                then.status(200);
            })
            .await;

        let clock = Arc::new(ManualClock::new());
        let engine = engine(clock.clone());
        let settings = settings_for(&server);

        assert_eq!(engine.sync(&settings, UA, false).await.unwrap(), SyncOutcome::Pushed);
        clock.advance(Duration::from_secs(300));
        assert_eq!(engine.sync(&settings, UA, false).await.unwrap(), SyncOutcome::Unchanged);
        push.assert_async().await;

        // Unchanged does not start a cool-down
        let again = engine.sync(&settings, UA, false).await;
        assert!(matches!(again, Ok(SyncOutcome::Unchanged)));
    }

    #[tokio::test]
    async fn test_forced_sync_pushes_unchanged_snapshot() {
        let server = MockServer::start_async().await;
        mock_directory(&server).await;
        let mut first = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/internal/v1/plugin/v2/sync");
                then.status(200);
            })
            .await;

        let clock = Arc::new(ManualClock::new());
        let engine = engine(clock.clone());
        let settings = settings_for(&server);

        engine.sync(&settings, UA, false).await.unwrap();
        first.assert_async().await;
        first.delete_async().await;

        let second = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/internal/v1/plugin/v2/sync");
                then.status(200);
            })
            .await;
        clock.advance(Duration::from_secs(300));
        assert_eq!(engine.sync(&settings, UA, true).await.unwrap(), SyncOutcome::Pushed);
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_cooling_down_rejects_with_remaining_time() {
        let server = MockServer::start_async().await;
        mock_directory(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/internal/v1/plugin/v2/sync");
                then.status(200);
            })
            .await;

        let clock = Arc::new(ManualClock::new());
        let engine = engine(clock.clone());
        let settings = settings_for(&server);

        engine.sync(&settings, UA, false).await.unwrap();
        clock.advance(Duration::from_secs(100));

        let err = engine.sync(&settings, UA, true).await.unwrap_err();
        match err {
            SyncError::InProgress { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(200))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_request_fails_fast() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org/users");
                then.status(200).delay(Duration::from_millis(500)).json_body(json!([]));
            })
            .await;

        let engine = engine(Arc::new(ManualClock::new()));
        let settings = settings_for(&server);

        engine.spawn(settings.clone(), UA.into(), false).unwrap();

        let start = std::time::Instant::now();
        let err = engine.sync(&settings, UA, false).await.unwrap_err();
        assert!(matches!(err, SyncError::InProgress { .. }));
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_collect_failure_returns_to_idle() {
        let server = MockServer::start_async().await;
        let mut users = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org/users");
                then.status(500);
            })
            .await;

        let engine = engine(Arc::new(ManualClock::new()));
        let settings = settings_for(&server);

        let err = engine.sync(&settings, UA, false).await.unwrap_err();
        assert!(matches!(err, SyncError::Collect(_)));

        users.delete_async().await;
        mock_directory(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/internal/v1/plugin/v2/sync");
                then.status(200);
            })
            .await;
        assert_eq!(engine.sync(&settings, UA, false).await.unwrap(), SyncOutcome::Pushed);
    }

    #[tokio::test]
    async fn test_failed_background_sync_releases_engine() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org/users");
                then.status(500);
            })
            .await;

        let engine = engine(Arc::new(ManualClock::new()));
        let settings = settings_for(&server);
        engine.spawn(settings.clone(), UA.into(), false).unwrap();

        let mut result = engine.sync(&settings, UA, false).await;
        for _ in 0..50 {
            if !matches!(result, Err(SyncError::InProgress { .. })) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            result = engine.sync(&settings, UA, false).await;
        }
        assert!(matches!(result, Err(SyncError::Collect(_))), "{result:?}");
    }

    #[tokio::test]
    async fn test_rejected_push_is_not_retried_until_change() {
        let server = MockServer::start_async().await;
        mock_directory(&server).await;
        let push = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/internal/v1/plugin/v2/sync");
                then.status(400);
            })
            .await;

        let clock = Arc::new(ManualClock::new());
        let engine = engine(clock.clone());
        let settings = settings_for(&server);

        let err = engine.sync(&settings, UA, false).await.unwrap_err();
        assert!(matches!(err, SyncError::Push(_)));

        // A failed push still cools down
        assert!(matches!(
            engine.sync(&settings, UA, false).await,
            Err(SyncError::InProgress { .. })
        ));

        clock.advance(Duration::from_secs(300));
        assert_eq!(engine.sync(&settings, UA, false).await.unwrap(), SyncOutcome::Unchanged);
        push.assert_async().await;
    }
}
