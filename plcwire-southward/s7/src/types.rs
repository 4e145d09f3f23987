use crate::protocol::frame::{parse_tag, TsapPair};
use plcwire_sdk::{DriverError, DriverResult, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{fmt, time::Duration};

/// Controller family. `Any` asks the session to identify the CPU after negotiation.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ControllerType {
    #[default]
    Any = 0,
    S7_200 = 1,
    S7_300 = 2,
    S7_400 = 3,
    S7_1200 = 4,
    S7_1500 = 5,
    Logo = 6,
}

impl ControllerType {
    /// Classify by MLFB (article number), e.g. `6ES7 315-2EH14-0AB0`.
    pub fn from_article_number(article: &str) -> Option<Self> {
        let article = article.trim();
        let family = article.strip_prefix("6ES7")?.trim_start();
        match family.chars().next()? {
            '2' => Some(ControllerType::S7_1200),
            '5' => Some(ControllerType::S7_1500),
            '3' => Some(ControllerType::S7_300),
            '4' => Some(ControllerType::S7_400),
            _ => None,
        }
    }

    /// Event categories this controller family can be subscribed to.
    pub fn supported_events(self) -> &'static [EventCategory] {
        use EventCategory::*;
        match self {
            ControllerType::S7_300 | ControllerType::S7_400 => {
                &[Mode, SystemDiagnostic, UserDiagnostic, Alarm, Cyclic]
            }
            ControllerType::S7_1500 => &[Mode, SystemDiagnostic, UserDiagnostic, Alarm],
            ControllerType::S7_1200 => &[Mode, SystemDiagnostic, UserDiagnostic],
            ControllerType::S7_200 | ControllerType::Logo => &[],
            ControllerType::Any => &[Mode],
        }
    }

    pub fn supports(self, category: EventCategory) -> bool {
        self.supported_events().contains(&category)
    }
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerType::Any => "ANY",
            ControllerType::S7_200 => "S7-200",
            ControllerType::S7_300 => "S7-300",
            ControllerType::S7_400 => "S7-400",
            ControllerType::S7_1200 => "S7-1200",
            ControllerType::S7_1500 => "S7-1500",
            ControllerType::Logo => "LOGO",
        };
        f.write_str(name)
    }
}

/// Unsolicited event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    /// CPU operating mode transitions (MODE)
    Mode,
    /// System diagnostic buffer entries (SYS)
    SystemDiagnostic,
    /// User diagnostic entries, event ids 0xA000..=0xBFFF (USR)
    UserDiagnostic,
    /// Alarm and notify indications (ALM)
    Alarm,
    /// Cyclic data samples (CYC)
    Cyclic,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Mode,
        EventCategory::SystemDiagnostic,
        EventCategory::UserDiagnostic,
        EventCategory::Alarm,
        EventCategory::Cyclic,
    ];

    /// Bit in the message-service subscription mask; `None` for cyclic data.
    pub fn message_service_bit(self) -> Option<u8> {
        match self {
            EventCategory::Mode => Some(0x01),
            EventCategory::SystemDiagnostic => Some(0x02),
            EventCategory::UserDiagnostic => Some(0x04),
            EventCategory::Alarm => Some(0x80),
            EventCategory::Cyclic => None,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            EventCategory::Mode => "MODE",
            EventCategory::SystemDiagnostic => "SYS",
            EventCategory::UserDiagnostic => "USR",
            EventCategory::Alarm => "ALM",
            EventCategory::Cyclic => "CYC",
        }
    }
}

impl std::str::FromStr for EventCategory {
    type Err = DriverError;

    fn from_str(s: &str) -> DriverResult<Self> {
        EventCategory::ALL
            .into_iter()
            .find(|c| c.short_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DriverError::Configuration(format!("unknown event category {s}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TsapConfig {
    RackSlot { rack: u8, slot: u8 },
    Tsap { local: u16, remote: u16 },
}

impl Default for TsapConfig {
    fn default() -> Self {
        TsapConfig::RackSlot { rack: 0, slot: 2 }
    }
}

/// Connection configuration, already validated by [`S7ConnectionConfig::validate`]
/// before any component sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S7ConnectionConfig {
    /// Primary link address, `host:port`
    #[serde(default = "S7ConnectionConfig::default_primary")]
    pub primary: String,
    /// Standby link address for redundant (H) systems
    #[serde(default)]
    pub secondary: Option<String>,
    #[serde(default)]
    pub tsap: TsapConfig,
    #[serde(default)]
    pub controller_type: ControllerType,
    /// Skip the login handshake (no transport-level session on the medium)
    #[serde(default)]
    pub passive: bool,
    #[serde(default = "S7ConnectionConfig::default_pdu_size")]
    pub pdu_size: u16,
    #[serde(default = "S7ConnectionConfig::default_amq")]
    pub max_amq_caller: u16,
    #[serde(default = "S7ConnectionConfig::default_amq")]
    pub max_amq_callee: u16,
    /// COTP TPDU size in bytes, rounded down to a power of two
    #[serde(default = "S7ConnectionConfig::default_tpdu_size")]
    pub tpdu_size: usize,
    #[serde(default = "S7ConnectionConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-request deadline; also bounds each handshake step
    #[serde(default = "S7ConnectionConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "S7ConnectionConfig::default_tick_ms")]
    pub supervision_tick_ms: u64,
    /// Period of full reconnect attempts for links that exist but are down
    #[serde(default = "S7ConnectionConfig::default_retry_ms")]
    pub retry_interval_ms: u64,
    /// Read-inactivity watchdog on the active link (None = disabled)
    #[serde(default)]
    pub watchdog_ms: Option<u64>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default = "S7ConnectionConfig::default_keep_alive_ms")]
    pub keep_alive_interval_ms: u64,
    #[serde(default = "S7ConnectionConfig::default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "S7ConnectionConfig::default_ping_tag")]
    pub ping_tag: String,
    #[serde(default = "S7ConnectionConfig::default_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "S7ConnectionConfig::default_queue_capacity")]
    pub dispatch_queue_capacity: usize,
    #[serde(default = "S7ConnectionConfig::default_lane_capacity")]
    pub subscriber_queue_capacity: usize,
    /// Pacing of open attempts for links that were never established
    #[serde(default)]
    pub link_retry: RetryPolicy,
}

impl Default for S7ConnectionConfig {
    fn default() -> Self {
        Self {
            primary: Self::default_primary(),
            secondary: None,
            tsap: TsapConfig::default(),
            controller_type: ControllerType::Any,
            passive: false,
            pdu_size: Self::default_pdu_size(),
            max_amq_caller: Self::default_amq(),
            max_amq_callee: Self::default_amq(),
            tpdu_size: Self::default_tpdu_size(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            supervision_tick_ms: Self::default_tick_ms(),
            retry_interval_ms: Self::default_retry_ms(),
            watchdog_ms: None,
            keep_alive: false,
            keep_alive_interval_ms: Self::default_keep_alive_ms(),
            ping_timeout_ms: Self::default_ping_timeout_ms(),
            ping_tag: Self::default_ping_tag(),
            event_queue_capacity: Self::default_queue_capacity(),
            dispatch_queue_capacity: Self::default_queue_capacity(),
            subscriber_queue_capacity: Self::default_lane_capacity(),
            link_retry: RetryPolicy::default(),
        }
    }
}

impl S7ConnectionConfig {
    fn default_primary() -> String {
        "127.0.0.1:102".into()
    }

    fn default_pdu_size() -> u16 {
        960
    }

    fn default_amq() -> u16 {
        8
    }

    fn default_tpdu_size() -> usize {
        1024
    }

    fn default_connect_timeout_ms() -> u64 {
        5_000
    }

    fn default_request_timeout_ms() -> u64 {
        10_000
    }

    fn default_tick_ms() -> u64 {
        1_000
    }

    fn default_retry_ms() -> u64 {
        4_000
    }

    fn default_keep_alive_ms() -> u64 {
        3_000
    }

    fn default_ping_timeout_ms() -> u64 {
        2_000
    }

    fn default_ping_tag() -> String {
        "%MX1.0:BOOL".into()
    }

    fn default_queue_capacity() -> usize {
        256
    }

    fn default_lane_capacity() -> usize {
        64
    }

    pub fn with_primary(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> DriverResult<()> {
        let cfg_err = |m: String| Err(DriverError::Configuration(m));
        if self.primary.trim().is_empty() {
            return cfg_err("primary address must not be empty".into());
        }
        if matches!(&self.secondary, Some(s) if s.trim().is_empty()) {
            return cfg_err("secondary address must not be empty when set".into());
        }
        if !(240..=960).contains(&self.pdu_size) {
            return cfg_err(format!("pduSize {} out of range 240..=960", self.pdu_size));
        }
        if self.max_amq_caller == 0 || self.max_amq_callee == 0 {
            return cfg_err("AMQ values must be at least 1".into());
        }
        if !(128..=8192).contains(&self.tpdu_size) {
            return cfg_err(format!("tpduSize {} out of range 128..=8192", self.tpdu_size));
        }
        if self.event_queue_capacity == 0
            || self.dispatch_queue_capacity == 0
            || self.subscriber_queue_capacity == 0
        {
            return cfg_err("queue capacities must be non-zero".into());
        }
        if self.supervision_tick_ms == 0 || self.request_timeout_ms == 0 {
            return cfg_err("timeouts and tick must be non-zero".into());
        }
        if self.watchdog_ms == Some(0) {
            return cfg_err("watchdogMs must be non-zero when set".into());
        }
        parse_tag(&self.ping_tag).map_err(|e| DriverError::Configuration(e.to_string()))?;
        self.tsap_pair()?;
        Ok(())
    }

    pub fn tsap_pair(&self) -> DriverResult<TsapPair> {
        match self.tsap {
            TsapConfig::RackSlot { rack, slot } => {
                TsapPair::for_controller(self.controller_type, rack, slot)
                    .map_err(|e| DriverError::Configuration(e.to_string()))
            }
            TsapConfig::Tsap { local, remote } => Ok(TsapPair { local, remote }),
        }
    }

    #[inline]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn supervision_tick(&self) -> Duration {
        Duration::from_millis(self.supervision_tick_ms)
    }

    #[inline]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    #[inline]
    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog_ms.map(Duration::from_millis)
    }

    /// Keep-alive interval when probing is enabled.
    #[inline]
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive
            .then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    #[inline]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}
