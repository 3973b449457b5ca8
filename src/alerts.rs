// =============================================================================
// Alert hub — best-effort, deduplicated operational alerts
// =============================================================================
//
// Alerts never block the core loop: `raise` stamps the dedup map, logs, and
// enqueues; a background task delivers to the optional webhook.  Delivery
// failures are logged and forgotten — alerting can never roll back engine
// state.
// =============================================================================

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::runtime_config::AlertConfig;
use crate::store::DaoHandle;

/// One alert destined for the log, the DB, and the webhook.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Dedup key, e.g. "source_degraded".
    pub key: String,
    pub message: String,
    pub ts_ms: i64,
}

/// Shared alert entry point.  Cloneable handles all feed one sender task.
pub struct AlertHub {
    enabled: bool,
    dedup_ttl: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
    tx: mpsc::UnboundedSender<Alert>,
    /// Set after the DAO comes up; alerts raised earlier are not persisted.
    store: OnceLock<DaoHandle>,
}

impl AlertHub {
    /// Build the hub and spawn its delivery task.  The returned receiver
    /// side lives inside the spawned task.
    pub fn new(config: &AlertConfig) -> std::sync::Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let hub = std::sync::Arc::new(Self {
            enabled: config.enabled,
            dedup_ttl: Duration::from_millis(config.dedup_ttl_ms),
            last_sent: Mutex::new(HashMap::new()),
            tx,
            store: OnceLock::new(),
        });

        tokio::spawn(run_sender(rx, config.webhook_url.clone()));
        hub
    }

    /// Attach the DAO so raised alerts also land in the alerts table.
    pub fn set_store(&self, dao: DaoHandle) {
        let _ = self.store.set(dao);
    }

    /// Raise an alert.  Duplicate keys within the dedup TTL are swallowed.
    pub fn raise(&self, key: impl Into<String>, message: impl Into<String>) {
        if !self.enabled {
            return;
        }
        let key = key.into();
        let message = message.into();

        {
            let mut last = self.last_sent.lock();
            if let Some(at) = last.get(&key) {
                if at.elapsed() < self.dedup_ttl {
                    debug!(key = %key, "alert deduplicated");
                    return;
                }
            }
            last.insert(key.clone(), Instant::now());
        }

        warn!(key = %key, message = %message, "ALERT");

        let alert = Alert {
            key,
            message,
            ts_ms: chrono::Utc::now().timestamp_millis(),
        };

        if let Some(dao) = self.store.get() {
            dao.insert_alert(alert.ts_ms, alert.key.clone(), alert.message.clone());
        }

        // A closed channel means shutdown; nothing to do.
        let _ = self.tx.send(alert);
    }
}

/// Deliver alerts to the webhook, if one is configured.  Errors are logged
/// and dropped.
async fn run_sender(mut rx: mpsc::UnboundedReceiver<Alert>, webhook_url: Option<String>) {
    let client = reqwest::Client::new();

    while let Some(alert) = rx.recv().await {
        let Some(url) = webhook_url.as_deref() else {
            continue;
        };

        match client.post(url).json(&alert).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), key = %alert.key, "alert webhook rejected");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, key = %alert.key, "alert webhook unreachable");
            }
        }
    }
}
