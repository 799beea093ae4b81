// Config Store: validated, observable tunables with preset profiles.
//
// Every mutation re-validates the whole configuration; a failed validation
// rejects the mutation and leaves the previous state untouched. Observers
// are invoked synchronously after a successful mutation.

use crate::error::{EngineError, Result};
use crate::events::{EventEmitter, ListenerId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// All engine tunables. Serialized as lowerCamelCase JSON for import/export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerConfig {
    /// Origin/seeder base URL.
    pub base_url: String,
    /// Signaling WebSocket URL.
    pub signaling_url: String,

    // --- Fetching ---
    /// Per-request timeout for origin and peer fetches, in milliseconds.
    pub fetch_timeout_ms: u64,
    /// Maximum origin retry attempts beyond the initial one.
    pub max_retries: u32,
    /// Base for exponential retry backoff, in milliseconds.
    pub retry_delay_base_ms: u64,
    /// Concurrency bound for batch/prefetch fetching.
    pub max_concurrent_fetches: usize,

    // --- Cache ---
    /// Cold-cache byte budget. Hot entries live outside this bound.
    pub cache_size_limit: u64,
    /// TTL for cached media segments, in milliseconds.
    pub cache_segment_ttl_ms: u64,
    /// Interval of the expired-entry sweep, in milliseconds.
    pub cache_cleanup_interval_ms: u64,

    // --- Peers ---
    pub max_active_peers: usize,
    pub min_active_peers: usize,
    /// Peers scoring below this (with enough observations) are dropped.
    pub peer_score_threshold: f64,
    /// WebRTC connection establishment bound, in milliseconds.
    pub peer_connection_timeout_ms: u64,
    /// Base stagger before each outbound peer request, in milliseconds.
    pub staggered_request_delay_ms: u64,
    /// Lower bound of the peer response wait, in milliseconds.
    pub segment_request_wait_min_ms: u64,
    /// Upper bound of the peer response wait, in milliseconds.
    pub segment_request_wait_max_ms: u64,

    // --- Signaling ---
    /// Deadline for who-has queries, in milliseconds.
    pub who_has_timeout_ms: u64,
    /// Heartbeat interval, in milliseconds. Zero disables heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Delay before the single reconnect attempt, in milliseconds.
    pub reconnect_interval_ms: u64,

    // --- Buffer ---
    /// Seconds of buffer below which the level is `low` (a third of this is
    /// `critical`).
    pub buffer_min_threshold: f64,
    /// Seconds of buffer the prefetcher aims to hold ahead.
    pub buffer_target_duration: f64,
    /// Seconds of buffer above which prefetch pauses.
    pub buffer_max_threshold: f64,
    /// Buffer monitor tick, in milliseconds.
    pub monitor_interval_ms: u64,

    // --- Prefetch ---
    /// Seconds ahead of the playhead covered by standard prefetch.
    pub prefetch_window_ahead: f64,
    /// Seconds behind the playhead retained/prefetched.
    pub prefetch_window_behind: f64,

    // --- ABR ---
    /// Buffer ratio above which an up-switch is considered.
    pub abr_switch_up_threshold: f64,
    /// Buffer ratio below which a down-switch is taken.
    pub abr_switch_down_threshold: f64,
    /// Smoothing factor of the EWMA bandwidth estimator.
    pub abr_ewma_alpha: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            signaling_url: "ws://localhost:8081/signaling".to_string(),
            fetch_timeout_ms: 8_000,
            max_retries: 3,
            retry_delay_base_ms: 500,
            max_concurrent_fetches: 4,
            cache_size_limit: 200 * 1024 * 1024,
            cache_segment_ttl_ms: 120_000,
            cache_cleanup_interval_ms: 30_000,
            max_active_peers: 8,
            min_active_peers: 2,
            peer_score_threshold: 0.3,
            peer_connection_timeout_ms: 2_000,
            staggered_request_delay_ms: 150,
            segment_request_wait_min_ms: 500,
            segment_request_wait_max_ms: 3_000,
            who_has_timeout_ms: 2_000,
            heartbeat_interval_ms: 30_000,
            reconnect_interval_ms: 3_000,
            buffer_min_threshold: 8.0,
            buffer_target_duration: 30.0,
            buffer_max_threshold: 60.0,
            monitor_interval_ms: 1_000,
            prefetch_window_ahead: 30.0,
            prefetch_window_behind: 10.0,
            abr_switch_up_threshold: 0.8,
            abr_switch_down_threshold: 0.3,
            abr_ewma_alpha: 0.3,
        }
    }
}

impl PlayerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }

    pub fn who_has_timeout(&self) -> Duration {
        Duration::from_millis(self.who_has_timeout_ms)
    }

    pub fn peer_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_connection_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn cache_segment_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_segment_ttl_ms)
    }

    /// Validate cross-field invariants. Called on every mutation.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(EngineError::config("baseUrl must not be empty"));
        }
        if self.signaling_url.is_empty() {
            return Err(EngineError::config("signalingUrl must not be empty"));
        }
        if self.max_active_peers == 0 {
            return Err(EngineError::config("maxActivePeers must be positive"));
        }
        if self.min_active_peers > self.max_active_peers {
            return Err(EngineError::config(
                "minActivePeers must not exceed maxActivePeers",
            ));
        }
        if !(0.0..=1.0).contains(&self.peer_score_threshold) {
            return Err(EngineError::config(
                "peerScoreThreshold must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.abr_ewma_alpha) || self.abr_ewma_alpha == 0.0 {
            return Err(EngineError::config("abrEwmaAlpha must be within (0, 1]"));
        }
        if self.buffer_min_threshold <= 0.0
            || self.buffer_target_duration <= 0.0
            || self.buffer_max_threshold <= 0.0
        {
            return Err(EngineError::config("buffer thresholds must be positive"));
        }
        if self.buffer_min_threshold >= self.buffer_target_duration {
            return Err(EngineError::config(
                "bufferMinThreshold must be below bufferTargetDuration",
            ));
        }
        if self.buffer_target_duration > self.buffer_max_threshold {
            return Err(EngineError::config(
                "bufferTargetDuration must not exceed bufferMaxThreshold",
            ));
        }
        if self.cache_size_limit == 0 {
            return Err(EngineError::config("cacheSizeLimit must be positive"));
        }
        if self.cache_segment_ttl_ms == 0 || self.cache_cleanup_interval_ms == 0 {
            return Err(EngineError::config("cache TTLs must be positive"));
        }
        if self.fetch_timeout_ms == 0 || self.who_has_timeout_ms == 0 {
            return Err(EngineError::config("timeouts must be positive"));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(EngineError::config("maxConcurrentFetches must be positive"));
        }
        if self.abr_switch_up_threshold <= self.abr_switch_down_threshold {
            return Err(EngineError::config(
                "abrSwitchUpThreshold must exceed abrSwitchDownThreshold",
            ));
        }
        if self.segment_request_wait_max_ms < self.segment_request_wait_min_ms {
            return Err(EngineError::config(
                "segmentRequestWaitMax must not be below segmentRequestWaitMin",
            ));
        }
        if self.prefetch_window_ahead <= 0.0 || self.prefetch_window_behind < 0.0 {
            return Err(EngineError::config("prefetch windows out of range"));
        }
        if self.monitor_interval_ms == 0 {
            return Err(EngineError::config("monitorInterval must be positive"));
        }
        Ok(())
    }
}

/// A partial configuration; `None` fields are left untouched on merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub base_url: Option<String>,
    pub signaling_url: Option<String>,
    pub fetch_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_base_ms: Option<u64>,
    pub max_concurrent_fetches: Option<usize>,
    pub cache_size_limit: Option<u64>,
    pub cache_segment_ttl_ms: Option<u64>,
    pub cache_cleanup_interval_ms: Option<u64>,
    pub max_active_peers: Option<usize>,
    pub min_active_peers: Option<usize>,
    pub peer_score_threshold: Option<f64>,
    pub peer_connection_timeout_ms: Option<u64>,
    pub staggered_request_delay_ms: Option<u64>,
    pub segment_request_wait_min_ms: Option<u64>,
    pub segment_request_wait_max_ms: Option<u64>,
    pub who_has_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub reconnect_interval_ms: Option<u64>,
    pub buffer_min_threshold: Option<f64>,
    pub buffer_target_duration: Option<f64>,
    pub buffer_max_threshold: Option<f64>,
    pub monitor_interval_ms: Option<u64>,
    pub prefetch_window_ahead: Option<f64>,
    pub prefetch_window_behind: Option<f64>,
    pub abr_switch_up_threshold: Option<f64>,
    pub abr_switch_down_threshold: Option<f64>,
    pub abr_ewma_alpha: Option<f64>,
}

macro_rules! merge_fields {
    ($target:expr, $patch:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if let Some(value) = $patch.$field.clone() {
                $target.$field = value;
            }
        )+
    };
}

impl ConfigPatch {
    fn apply_to(&self, config: &mut PlayerConfig) {
        merge_fields!(config, self, [
            base_url,
            signaling_url,
            fetch_timeout_ms,
            max_retries,
            retry_delay_base_ms,
            max_concurrent_fetches,
            cache_size_limit,
            cache_segment_ttl_ms,
            cache_cleanup_interval_ms,
            max_active_peers,
            min_active_peers,
            peer_score_threshold,
            peer_connection_timeout_ms,
            staggered_request_delay_ms,
            segment_request_wait_min_ms,
            segment_request_wait_max_ms,
            who_has_timeout_ms,
            heartbeat_interval_ms,
            reconnect_interval_ms,
            buffer_min_threshold,
            buffer_target_duration,
            buffer_max_threshold,
            monitor_interval_ms,
            prefetch_window_ahead,
            prefetch_window_behind,
            abr_switch_up_threshold,
            abr_switch_down_threshold,
            abr_ewma_alpha,
        ]);
    }
}

/// Named bandwidth presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    HighBandwidth,
    LowBandwidth,
    Balanced,
}

impl Preset {
    pub fn patch(&self) -> ConfigPatch {
        match self {
            Preset::HighBandwidth => ConfigPatch {
                buffer_target_duration: Some(45.0),
                buffer_max_threshold: Some(90.0),
                prefetch_window_ahead: Some(45.0),
                max_concurrent_fetches: Some(6),
                abr_switch_up_threshold: Some(0.7),
                ..Default::default()
            },
            Preset::LowBandwidth => ConfigPatch {
                buffer_target_duration: Some(20.0),
                buffer_max_threshold: Some(40.0),
                prefetch_window_ahead: Some(15.0),
                max_concurrent_fetches: Some(2),
                abr_switch_up_threshold: Some(0.9),
                abr_switch_down_threshold: Some(0.4),
                ..Default::default()
            },
            Preset::Balanced => ConfigPatch::default(),
        }
    }
}

/// Named performance profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceProfile {
    Aggressive,
    Conservative,
    Balanced,
}

impl PerformanceProfile {
    pub fn patch(&self) -> ConfigPatch {
        match self {
            PerformanceProfile::Aggressive => ConfigPatch {
                monitor_interval_ms: Some(500),
                staggered_request_delay_ms: Some(75),
                max_concurrent_fetches: Some(8),
                segment_request_wait_max_ms: Some(2_000),
                ..Default::default()
            },
            PerformanceProfile::Conservative => ConfigPatch {
                monitor_interval_ms: Some(1_000),
                staggered_request_delay_ms: Some(300),
                max_concurrent_fetches: Some(2),
                max_retries: Some(5),
                ..Default::default()
            },
            PerformanceProfile::Balanced => ConfigPatch::default(),
        }
    }
}

/// Validated configuration holder with synchronous observers. No I/O.
pub struct ConfigStore {
    config: RwLock<PlayerConfig>,
    emitter: EventEmitter<PlayerConfig>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        // The default configuration is valid by construction (asserted in
        // tests), so no validation pass is needed here.
        Self {
            config: RwLock::new(PlayerConfig::default()),
            emitter: EventEmitter::new(),
        }
    }
}

impl ConfigStore {
    pub fn new(config: PlayerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            emitter: EventEmitter::new(),
        })
    }

    /// Full snapshot of the current configuration.
    pub fn snapshot(&self) -> PlayerConfig {
        self.config.read().clone()
    }

    /// Read a single value through a projection.
    pub fn read<T>(&self, f: impl FnOnce(&PlayerConfig) -> T) -> T {
        f(&self.config.read())
    }

    /// Replace the whole configuration.
    pub fn replace(&self, config: PlayerConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config.clone();
        self.emitter.emit(&config);
        Ok(())
    }

    /// Merge a partial configuration. A validation failure leaves the prior
    /// state untouched.
    pub fn apply(&self, patch: &ConfigPatch) -> Result<()> {
        let mut candidate = self.snapshot();
        patch.apply_to(&mut candidate);
        candidate.validate()?;
        *self.config.write() = candidate.clone();
        self.emitter.emit(&candidate);
        Ok(())
    }

    pub fn apply_preset(&self, preset: Preset) -> Result<()> {
        self.apply(&preset.patch())
    }

    pub fn apply_profile(&self, profile: PerformanceProfile) -> Result<()> {
        self.apply(&profile.patch())
    }

    /// Reset to defaults.
    pub fn reset(&self) -> Result<()> {
        self.replace(PlayerConfig::default())
    }

    /// Export as pretty JSON.
    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Import from JSON. Accepts partial documents; missing fields keep
    /// their defaults-from-current behavior via patch semantics.
    pub fn import_json(&self, json: &str) -> Result<()> {
        let patch: ConfigPatch = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("invalid config JSON: {e}")))?;
        self.apply(&patch)
    }

    /// Observe successful mutations. The listener runs synchronously with
    /// the post-mutation snapshot.
    pub fn subscribe(&self, listener: impl Fn(&PlayerConfig) + Send + Sync + 'static) -> ListenerId {
        self.emitter.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.emitter.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_config_is_valid() {
        PlayerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_peer_cap_inversion() {
        let store = ConfigStore::default();
        let patch = ConfigPatch {
            min_active_peers: Some(10),
            max_active_peers: Some(4),
            ..Default::default()
        };
        assert!(store.apply(&patch).is_err());
        // Prior state preserved.
        assert_eq!(store.snapshot().max_active_peers, 8);
    }

    #[test]
    fn rejects_score_threshold_out_of_range() {
        let store = ConfigStore::default();
        let patch = ConfigPatch {
            peer_score_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(store.apply(&patch).is_err());
    }

    #[test]
    fn rejects_buffer_ordering_violation() {
        let store = ConfigStore::default();
        let patch = ConfigPatch {
            buffer_min_threshold: Some(40.0),
            buffer_target_duration: Some(30.0),
            ..Default::default()
        };
        assert!(store.apply(&patch).is_err());
    }

    #[test]
    fn rejects_abr_threshold_inversion() {
        let store = ConfigStore::default();
        let patch = ConfigPatch {
            abr_switch_up_threshold: Some(0.2),
            abr_switch_down_threshold: Some(0.3),
            ..Default::default()
        };
        assert!(store.apply(&patch).is_err());
    }

    #[test]
    fn rejects_wait_bound_inversion() {
        let store = ConfigStore::default();
        let patch = ConfigPatch {
            segment_request_wait_min_ms: Some(4_000),
            ..Default::default()
        };
        assert!(store.apply(&patch).is_err());
    }

    #[test]
    fn observers_fire_after_successful_mutation_only() {
        let store = ConfigStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        store.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        });

        store
            .apply(&ConfigPatch {
                max_retries: Some(5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let _ = store.apply(&ConfigPatch {
            cache_size_limit: Some(0),
            ..Default::default()
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn json_round_trip() {
        let store = ConfigStore::default();
        store
            .apply(&ConfigPatch {
                buffer_target_duration: Some(42.0),
                ..Default::default()
            })
            .unwrap();
        let exported = store.export_json();

        let other = ConfigStore::default();
        other.import_json(&exported).unwrap();
        assert_eq!(other.snapshot(), store.snapshot());
    }

    #[test]
    fn import_rejects_invalid_json_document() {
        let store = ConfigStore::default();
        assert!(store.import_json("{ not json").is_err());
        assert!(store.import_json("{\"cacheSizeLimit\": 0}").is_err());
    }

    #[test]
    fn presets_merge_cleanly() {
        let store = ConfigStore::default();
        store.apply_preset(Preset::HighBandwidth).unwrap();
        assert_eq!(store.snapshot().buffer_target_duration, 45.0);
        store.apply_profile(PerformanceProfile::Aggressive).unwrap();
        assert_eq!(store.snapshot().monitor_interval_ms, 500);
        // Untouched keys keep their values.
        assert_eq!(store.snapshot().buffer_target_duration, 45.0);
    }

    #[test]
    fn reset_restores_defaults() {
        let store = ConfigStore::default();
        store.apply_preset(Preset::LowBandwidth).unwrap();
        store.reset().unwrap();
        assert_eq!(store.snapshot(), PlayerConfig::default());
    }
}
