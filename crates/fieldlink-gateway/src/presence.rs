//! Device presence tracking.
//!
//! Every routed message refreshes the sender's record. A device is online
//! while `now - last_seen` is shorter than the liveness window; the check
//! sweep turns that into `device_online`/`device_offline` transitions, the
//! cleanup sweep drops devices that stayed silent past the retention window.
//! Reads compute the online flag on the spot, so a caller never sees a
//! device as online just because the sweep has not run yet.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fieldlink_core::{EventBus, GatewayEvent};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::PresenceConfig;

const EVENT_SOURCE: &str = "presence";

/// What the gateway knows about one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
    /// Merged status snapshot, keyed by top-level category
    pub status: Map<String, Value>,
    pub message_count: u64,
}

impl DeviceRecord {
    fn new(device_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            first_seen: now,
            last_seen: now,
            online: false,
            status: Map::new(),
            message_count: 0,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
        self.message_count += 1;
    }

    /// Merge a status update: object categories are merged one level deep,
    /// everything else is replaced.
    fn merge_status(&mut self, data: Map<String, Value>) {
        for (key, value) in data {
            match (self.status.get_mut(&key), value) {
                (Some(Value::Object(existing)), Value::Object(update)) => {
                    existing.extend(update);
                }
                (_, value) => {
                    self.status.insert(key, value);
                }
            }
        }
    }

    fn silence(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_seen
    }
}

/// A presence transition reported by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub device_id: String,
    pub online: bool,
}

/// Tracks last-seen time and online state per device.
pub struct PresenceTracker {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    config: PresenceConfig,
    event_bus: EventBus,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig, event_bus: EventBus) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            config,
            event_bus,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Upsert a device from a status message and mark it online.
    pub async fn update_device_status(&self, device_id: &str, data: Map<String, Value>) {
        self.update_device_status_at(device_id, data, Utc::now()).await
    }

    pub async fn update_device_status_at(
        &self,
        device_id: &str,
        data: Map<String, Value>,
        now: DateTime<Utc>,
    ) {
        let came_online = {
            let mut devices = self.devices.lock();
            let record = devices
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceRecord::new(device_id, now));
            record.merge_status(data);
            record.touch(now);
            !std::mem::replace(&mut record.online, true)
        };
        if came_online {
            self.announce_online(device_id, now).await;
        }
    }

    /// Refresh liveness only.
    pub async fn handle_heartbeat(&self, device_id: &str) {
        self.handle_heartbeat_at(device_id, Utc::now()).await
    }

    pub async fn handle_heartbeat_at(&self, device_id: &str, now: DateTime<Utc>) {
        let came_online = {
            let mut devices = self.devices.lock();
            let record = devices
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceRecord::new(device_id, now));
            record.touch(now);
            !std::mem::replace(&mut record.online, true)
        };
        if came_online {
            self.announce_online(device_id, now).await;
        }
    }

    async fn announce_online(&self, device_id: &str, now: DateTime<Utc>) {
        info!(device_id, "Device online");
        self.emit(GatewayEvent::DeviceOnline {
            device_id: device_id.to_string(),
            timestamp: now.timestamp_millis(),
        })
        .await;
    }

    /// Recompute the online flag of every device.
    pub async fn check_online_devices(&self) -> Vec<PresenceChange> {
        self.check_online_devices_at(Utc::now()).await
    }

    pub async fn check_online_devices_at(&self, now: DateTime<Utc>) -> Vec<PresenceChange> {
        let window = self.config.liveness_window();
        let changes: Vec<PresenceChange> = {
            let mut devices = self.devices.lock();
            devices
                .values_mut()
                .filter_map(|record| {
                    let online = record.silence(now) < window;
                    if online == record.online {
                        return None;
                    }
                    record.online = online;
                    Some(PresenceChange {
                        device_id: record.device_id.clone(),
                        online,
                    })
                })
                .collect()
        };

        for change in &changes {
            let timestamp = now.timestamp_millis();
            let device_id = change.device_id.clone();
            if change.online {
                info!(device_id = %device_id, "Device online");
                self.emit(GatewayEvent::DeviceOnline {
                    device_id,
                    timestamp,
                })
                .await;
            } else {
                info!(device_id = %device_id, "Device offline");
                self.emit(GatewayEvent::DeviceOffline {
                    device_id,
                    timestamp,
                })
                .await;
            }
        }
        changes
    }

    /// Purge devices that are offline and silent past the retention window.
    ///
    /// Returns the removed device ids.
    pub async fn cleanup_offline_devices(&self) -> Vec<String> {
        self.cleanup_offline_devices_at(Utc::now()).await
    }

    pub async fn cleanup_offline_devices_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let liveness = self.config.liveness_window();
        let retention = self.config.retention_window();

        let removed: Vec<DeviceRecord> = {
            let mut devices = self.devices.lock();
            let expired: Vec<String> = devices
                .values()
                .filter(|record| {
                    let silence = record.silence(now);
                    silence >= liveness && silence >= retention
                })
                .map(|record| record.device_id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|device_id| devices.remove(device_id))
                .collect()
        };

        let timestamp = now.timestamp_millis();
        for record in &removed {
            if record.online {
                self.emit(GatewayEvent::DeviceOffline {
                    device_id: record.device_id.clone(),
                    timestamp,
                })
                .await;
            }
            debug!(device_id = %record.device_id, "Removing stale device record");
            self.emit(GatewayEvent::DeviceRemoved {
                device_id: record.device_id.clone(),
                timestamp,
            })
            .await;
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleaned up offline devices");
        }
        removed.into_iter().map(|record| record.device_id).collect()
    }

    /// Get a device with its online flag computed for the current time.
    pub fn get_device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.get_device_at(device_id, Utc::now())
    }

    pub fn get_device_at(&self, device_id: &str, now: DateTime<Utc>) -> Option<DeviceRecord> {
        let window = self.config.liveness_window();
        self.devices.lock().get(device_id).map(|record| {
            let mut copy = record.clone();
            copy.online = record.silence(now) < window;
            copy
        })
    }

    /// All devices, sorted by id, with computed online flags.
    pub fn list_devices(&self) -> Vec<DeviceRecord> {
        self.list_devices_at(Utc::now())
    }

    pub fn list_devices_at(&self, now: DateTime<Utc>) -> Vec<DeviceRecord> {
        let window = self.config.liveness_window();
        let mut records: Vec<DeviceRecord> = self
            .devices
            .lock()
            .values()
            .map(|record| {
                let mut copy = record.clone();
                copy.online = record.silence(now) < window;
                copy
            })
            .collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }

    /// Ids of the devices currently online.
    pub fn online_devices(&self) -> Vec<String> {
        self.list_devices()
            .into_iter()
            .filter(|record| record.online)
            .map(|record| record.device_id)
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Start the periodic check and cleanup sweeps.
    pub fn spawn_sweeps(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let check_every = self.config.check_interval();
        let cleanup_every = self.config.cleanup_interval();

        let tracker = Arc::clone(self);
        let check = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + check_every, check_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.check_online_devices().await;
            }
        });

        let tracker = Arc::clone(self);
        let cleanup = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + cleanup_every, cleanup_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.cleanup_offline_devices().await;
            }
        });

        vec![check, cleanup]
    }

    async fn emit(&self, event: GatewayEvent) {
        self.event_bus.publish_with_source(event, EVENT_SOURCE).await;
    }
}
