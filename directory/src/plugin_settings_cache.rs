use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::clock::{Clock, Expiring};
use crate::host_client::{HostClient, PluginSettingsRecord};
use crate::metrics_defs::PLUGIN_SETTINGS_REFRESHES;
use crate::settings::{EffectiveSettings, INCIDENT_PLUGIN_ID, LABELS_PLUGIN_ID};
use shared::counter;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IncidentPlugin {
    pub enabled: bool,
    pub backend_url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelsPlugin {
    pub enabled: bool,
}

/// Settings of the sibling plugins that affect this plugin. `None` means the
/// plugin is not installed or could not be read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiblingPlugins {
    pub incident: Option<IncidentPlugin>,
    pub labels: Option<LabelsPlugin>,
}

/// Process-wide snapshot of sibling plugin settings.
///
/// The lock is held for the whole refresh, so concurrent callers that find
/// the snapshot stale wait for one refresh instead of starting their own.
pub struct PluginSettingsCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    snapshot: Mutex<Option<Expiring<Arc<SiblingPlugins>>>>,
}

impl PluginSettingsCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        PluginSettingsCache {
            ttl,
            clock,
            snapshot: Mutex::new(None),
        }
    }

    pub async fn get(&self, host: &HostClient, settings: &EffectiveSettings) -> Arc<SiblingPlugins> {
        let mut snapshot = self.snapshot.lock().await;
        if let Some(fresh) = snapshot.as_ref().and_then(|s| s.fresh(self.clock.now())) {
            return fresh.clone();
        }

        counter!(PLUGIN_SETTINGS_REFRESHES).increment(1);
        let (incident, labels) = tokio::join!(
            fetch(host, settings, INCIDENT_PLUGIN_ID),
            fetch(host, settings, LABELS_PLUGIN_ID),
        );

        let plugins = Arc::new(SiblingPlugins {
            incident: incident.map(|record| IncidentPlugin {
                enabled: record.enabled,
                backend_url: record.json_str("backendUrl").map(str::to_string),
            }),
            labels: labels.map(|record| LabelsPlugin {
                enabled: record.enabled,
            }),
        });

        *snapshot = Some(Expiring::new(plugins.clone(), self.clock.now(), self.ttl));
        plugins
    }
}

async fn fetch(
    host: &HostClient,
    settings: &EffectiveSettings,
    plugin_id: &'static str,
) -> Option<PluginSettingsRecord> {
    match host.plugin_settings(settings, plugin_id).await {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(plugin_id, error = %err, "failed to read sibling plugin settings");
            None
        }
    }
}
