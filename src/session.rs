//! Runtime state shared by every component talking to one device.

use crate::config::{AppConfig, DeviceConfig, RetryConfig};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

/// Placeholder written to logs instead of personal data.
pub const HIDDEN: &str = "<hidden>";

/// SID returned by the device when no session is active.
pub const EMPTY_SID: &str = "0000000000000000";

/// A SID is reused without asking the device if the last request is younger than this.
pub const SID_REUSE_WINDOW: Duration = Duration::from_secs(300);

/// Login scheme spoken by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginType {
    /// Not detected yet.
    #[default]
    Unknown,
    /// Plain password POST, very old firmware.
    Password,
    /// Challenge/response via `login_sid.xml`.
    Sid,
    /// Challenge/response via `login_sid.lua`.
    Lua,
}

impl LoginType {
    /// Whether this scheme issues session ids.
    pub fn uses_sid(self) -> bool {
        matches!(self, Self::Sid | Self::Lua)
    }
}

/// Login bookkeeping.
#[derive(Debug, Default)]
pub struct LoginState {
    pub sid: String,
    pub login_type: LoginType,
    pub last_request: Option<Instant>,
    /// Web interface language of legacy firmware, detected lazily.
    pub lang: String,
}

impl LoginState {
    /// Whether the stored SID may be reused without a login round trip.
    pub fn sid_is_fresh(&self, now: Instant) -> bool {
        self.login_type.uses_sid()
            && self
                .last_request
                .is_some_and(|last| now.saturating_duration_since(last) < SID_REUSE_WINDOW)
    }

    /// Query suffix `&sid=<sid>` for legacy webcm URLs, empty without a SID.
    pub fn sid_param(&self) -> String {
        if self.sid.is_empty() {
            String::new()
        } else {
            format!("&sid={}", self.sid)
        }
    }

    pub fn touch(&mut self) {
        self.last_request = Some(Instant::now());
    }
}

/// Telephony settings detected from the device or taken from config.
#[derive(Debug, Clone, Default)]
pub struct PhoneSettings {
    pub country_code: String,
    pub region_code: String,
    pub sip_names: Vec<String>,
    pub sip_msns: Vec<String>,
    pub msn_filter: Vec<String>,
    /// Tech id of the phonebook last shown.
    pub active_fonbook: String,
}

/// Shared per-device state.
///
/// The login mutex is held for a whole request, so only one conversation with
/// the web interface runs at a time.
#[derive(Debug)]
pub struct Session {
    device: DeviceConfig,
    retry: RetryConfig,
    login: Mutex<LoginState>,
    phone: RwLock<PhoneSettings>,
}

impl Session {
    pub fn new(config: &AppConfig) -> Self {
        let phone = PhoneSettings {
            country_code: config.location.country_code.clone(),
            region_code: config.location.region_code.clone(),
            msn_filter: config.monitor.msn_filter.clone(),
            active_fonbook: config.fonbook.active.clone(),
            ..Default::default()
        };
        Self {
            device: config.device.clone(),
            retry: config.retry.clone(),
            login: Mutex::new(LoginState::default()),
            phone: RwLock::new(phone),
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Lock the login state for the duration of one device conversation.
    pub async fn login(&self) -> MutexGuard<'_, LoginState> {
        self.login.lock().await
    }

    pub fn phone(&self) -> RwLockReadGuard<'_, PhoneSettings> {
        self.phone.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phone_mut(&self) -> RwLockWriteGuard<'_, PhoneSettings> {
        self.phone.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Country and area code for number normalization.
    pub fn location(&self) -> (String, String) {
        let phone = self.phone();
        (phone.country_code.clone(), phone.region_code.clone())
    }

    /// Personal data for logging, masked unless enabled in config.
    pub fn hidden<'a>(&self, value: &'a str) -> &'a str {
        if self.device.log_personal_info { value } else { HIDDEN }
    }
}
