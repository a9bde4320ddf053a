//! Configuration for the connection manager
//!
//! One `LinkConfig` drives every charge point the manager tracks.

use std::time::Duration;

/// Complete manager configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Central system WebSocket URL (without charge point id)
    pub base_url: String,

    /// WebSocket subprotocols offered on open
    pub protocols: Vec<String>,

    /// Interval between Heartbeat calls while a connection is open
    pub heartbeat_interval: Duration,

    /// Base delay for reconnect backoff (`base * 2^attempt`)
    pub reconnect_interval: Duration,

    /// Reconnects scheduled after an abnormal close before giving up
    pub max_reconnect_attempts: u32,

    /// Deadline for a Call to receive its CallResult/CallError
    pub call_timeout: Duration,

    /// Deadline for the transport open handshake
    pub connect_timeout: Duration,

    /// Deadline for the transport to confirm a requested close
    pub disconnect_timeout: Duration,

    /// Wait after the host comes back online before bulk reconnect
    pub network_settle_delay: Duration,

    /// Identity reported in BootNotification
    pub identity: StationIdentity,

    /// Timing of the scripted remote start/stop sequences
    pub script: ScriptTiming,
}

/// Vendor information for BootNotification
#[derive(Debug, Clone)]
pub struct StationIdentity {
    pub vendor: String,
    pub model: String,
    pub firmware_version: Option<String>,
}

/// Delays used when emulating charge point behaviour for remote commands
#[derive(Debug, Clone)]
pub struct ScriptTiming {
    /// RemoteStart accepted -> StatusNotification(Preparing)
    pub preparing_delay: Duration,
    /// Preparing -> StartTransaction
    pub start_delay: Duration,
    /// RemoteStop accepted -> StopTransaction + StatusNotification(Available)
    pub stop_delay: Duration,
    /// Meter reading reported in the scripted StopTransaction (Wh)
    pub meter_stop: i64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8080/ocpp".to_string(),
            protocols: vec!["ocpp1.6".to_string()],
            heartbeat_interval: Duration::from_secs(300),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
            network_settle_delay: Duration::from_secs(2),
            identity: StationIdentity::default(),
            script: ScriptTiming::default(),
        }
    }
}

impl Default for StationIdentity {
    fn default() -> Self {
        Self {
            vendor: "SimulatorVendor".to_string(),
            model: "SimulatorModel".to_string(),
            firmware_version: Some("1.0.0".to_string()),
        }
    }
}

impl Default for ScriptTiming {
    fn default() -> Self {
        Self {
            preparing_delay: Duration::from_secs(1),
            start_delay: Duration::from_secs(2),
            stop_delay: Duration::from_secs(1),
            meter_stop: 1500,
        }
    }
}

impl LinkConfig {
    /// Create config for a central system URL, all else default
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Full URL for one charge point
    pub fn url_for(&self, charge_point_id: &str) -> String {
        build_ocpp_url(&self.base_url, charge_point_id)
    }

    /// Replace the offered subprotocols
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set backoff base and attempt ceiling
    pub fn with_reconnect(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.reconnect_interval = interval;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_network_settle_delay(mut self, delay: Duration) -> Self {
        self.network_settle_delay = delay;
        self
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.identity.vendor = vendor.into();
        self.identity.model = model.into();
        self
    }

    /// Set firmware version
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.identity.firmware_version = Some(version.into());
        self
    }

    pub fn with_script(mut self, script: ScriptTiming) -> Self {
        self.script = script;
        self
    }

    /// Reject values the timers cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat interval must be non-zero".into());
        }
        Ok(())
    }

    /// Backoff delay before reconnect number `attempt` (zero based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_interval
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, charge_point_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), charge_point_id)
}
