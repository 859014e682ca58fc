//! Settings and profile models.
//!
//! The settings document is what the settings store persists and what every
//! orchestrator command reloads before acting.
//!
//! ## Layout
//!
//! ```text
//! AppSettings
//!   ├── ports: LocalPortSettings     (socks / http? / pac listeners)
//!   ├── routing_mode: RoutingMode    (off / global / pac)
//!   ├── server_profiles[]            (remote endpoint + secret id)
//!   └── pac_profiles[]               (managed rules or remote PAC URL)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current settings schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Generates a new profile/secret identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// How the OS-wide proxy configuration is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// No system proxy.
    #[default]
    Off,
    /// Every connection goes through the local SOCKS listener.
    Global,
    /// Clients consult a proxy auto-config script.
    Pac,
}

impl RoutingMode {
    /// Returns the mode as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Global => "global",
            Self::Pac => "pac",
        }
    }

    /// Parses a mode name, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "global" => Some(Self::Global),
            "pac" => Some(Self::Pac),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of PAC profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PacProfileKind {
    /// Rules are merged locally and compiled into a generated script.
    #[default]
    Managed,
    /// Points at an externally hosted PAC script.
    Remote,
}

impl PacProfileKind {
    /// Returns the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::Remote => "remote",
        }
    }
}

/// Decision used when no PAC rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PacDefaultAction {
    /// Unmatched traffic goes through the proxy.
    #[default]
    Proxy,
    /// Unmatched traffic goes direct.
    Direct,
}

impl PacDefaultAction {
    /// Returns the action as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Direct => "direct",
        }
    }
}

/// Global hotkey gesture. Registration itself happens outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeyGesture {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub win: bool,
    pub key: String,
}

impl Default for HotkeyGesture {
    fn default() -> Self {
        Self {
            ctrl: true,
            alt: true,
            shift: true,
            win: false,
            key: "P".to_string(),
        }
    }
}

impl HotkeyGesture {
    /// Renders the gesture as `Ctrl+Alt+Shift+P`.
    pub fn display(&self) -> String {
        let mut parts = Vec::new();
        if self.ctrl {
            parts.push("Ctrl".to_string());
        }
        if self.alt {
            parts.push("Alt".to_string());
        }
        if self.shift {
            parts.push("Shift".to_string());
        }
        if self.win {
            parts.push("Win".to_string());
        }
        if !self.key.trim().is_empty() {
            parts.push(self.key.trim().to_uppercase());
        }
        parts.join("+")
    }
}

/// Local listener ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPortSettings {
    /// SOCKS listener port.
    pub socks_port: u16,
    /// Optional HTTP listener port. `None` means no HTTP listener is started.
    pub http_port: Option<u16>,
    /// Loopback PAC server port.
    pub pac_port: u16,
    /// Address the proxy engine listens on.
    pub listen_address: String,
    /// Pick another port when the preferred one is busy.
    pub auto_select_on_conflict: bool,
}

impl Default for LocalPortSettings {
    fn default() -> Self {
        Self {
            socks_port: 1080,
            http_port: None,
            pac_port: 8090,
            listen_address: "127.0.0.1".to_string(),
            auto_select_on_conflict: true,
        }
    }
}

/// A remote Shadowsocks server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    pub group: String,
    pub tags: Vec<String>,
    pub is_favorite: bool,
    pub host: String,
    pub port: u16,
    /// Cipher method, e.g. `aes-256-gcm`.
    pub method: String,
    /// Identifier of the password in the secret store.
    pub password_secret_id: String,
    pub plugin: Option<String>,
    pub plugin_options: Option<String>,
    pub remarks: Option<String>,
}

impl Default for ServerProfile {
    fn default() -> Self {
        Self {
            id: new_id(),
            name: "New Server".to_string(),
            group: String::new(),
            tags: Vec::new(),
            is_favorite: false,
            host: String::new(),
            port: 8388,
            method: "aes-256-gcm".to_string(),
            password_secret_id: new_id(),
            plugin: None,
            plugin_options: None,
            remarks: None,
        }
    }
}

impl ServerProfile {
    /// Creates a profile pointing at `host:port`.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Sets the cipher method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }
}

/// A PAC profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacProfile {
    pub id: String,
    pub name: String,
    pub kind: PacProfileKind,
    /// Script URL for remote profiles. Must be HTTPS.
    pub remote_pac_url: Option<String>,
    /// Remote rule list merged into a managed profile.
    pub rules_url: Option<String>,
    /// Local rule file merged into a managed profile.
    pub local_rules_file_path: Option<String>,
    pub inline_rules: String,
    pub default_action: PacDefaultAction,
    pub update_interval_hours: u32,
    pub bypass_private_addresses: bool,
    pub bypass_simple_hostnames: bool,
}

impl Default for PacProfile {
    fn default() -> Self {
        Self {
            id: new_id(),
            name: "Default PAC".to_string(),
            kind: PacProfileKind::Managed,
            remote_pac_url: None,
            rules_url: None,
            local_rules_file_path: None,
            inline_rules: String::new(),
            default_action: PacDefaultAction::Proxy,
            update_interval_hours: 6,
            bypass_private_addresses: true,
            bypass_simple_hostnames: true,
        }
    }
}

impl PacProfile {
    /// Creates a managed profile from inline rule text.
    pub fn managed(name: impl Into<String>, inline_rules: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inline_rules: inline_rules.into(),
            ..Self::default()
        }
    }

    /// Creates a remote profile pointing at a hosted script.
    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PacProfileKind::Remote,
            remote_pac_url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Returns true for managed profiles.
    pub fn is_managed(&self) -> bool {
        self.kind == PacProfileKind::Managed
    }
}

/// Entry of the PAC preset catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacPreset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source_url: String,
}

/// The persisted settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub schema_version: u32,
    pub sslocal_executable_path: Option<String>,
    pub auto_connect: bool,
    pub hotkey: HotkeyGesture,
    pub ports: LocalPortSettings,
    pub routing_mode: RoutingMode,
    pub active_server_profile_id: Option<String>,
    pub active_pac_profile_id: Option<String>,
    pub server_profiles: Vec<ServerProfile>,
    pub pac_profiles: Vec<PacProfile>,
    pub log_level: String,
    pub diagnostics_log_tail_lines: usize,
    pub updated_at: DateTime<Utc>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            sslocal_executable_path: None,
            auto_connect: false,
            hotkey: HotkeyGesture::default(),
            ports: LocalPortSettings::default(),
            routing_mode: RoutingMode::Off,
            active_server_profile_id: None,
            active_pac_profile_id: None,
            server_profiles: Vec::new(),
            pac_profiles: Vec::new(),
            log_level: "info".to_string(),
            diagnostics_log_tail_lines: 300,
            updated_at: Utc::now(),
        }
    }
}

impl AppSettings {
    /// Settings written on first launch: one managed PAC profile, selected.
    pub fn first_run() -> Self {
        let pac = PacProfile::managed("Managed default", "||example.com\n@@||intranet.local");
        Self {
            active_pac_profile_id: Some(pac.id.clone()),
            pac_profiles: vec![pac],
            ..Self::default()
        }
    }

    /// Returns the active server profile, if it resolves.
    pub fn active_server_profile(&self) -> Option<&ServerProfile> {
        let id = self.active_server_profile_id.as_deref()?;
        self.server_profiles.iter().find(|p| p.id == id)
    }

    /// Returns the active PAC profile, if it resolves.
    pub fn active_pac_profile(&self) -> Option<&PacProfile> {
        let id = self.active_pac_profile_id.as_deref()?;
        self.pac_profiles.iter().find(|p| p.id == id)
    }

    /// Looks up a server profile by id.
    pub fn server_profile(&self, id: &str) -> Option<&ServerProfile> {
        self.server_profiles.iter().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_mode_parse_and_display() {
        assert_eq!(RoutingMode::parse("PAC"), Some(RoutingMode::Pac));
        assert_eq!(RoutingMode::parse(" global "), Some(RoutingMode::Global));
        assert_eq!(RoutingMode::parse("tunnel"), None);
        assert_eq!(RoutingMode::Global.to_string(), "global");
    }

    #[test]
    fn test_defaults() {
        let ports = LocalPortSettings::default();
        assert_eq!(ports.socks_port, 1080);
        assert_eq!(ports.pac_port, 8090);
        assert!(ports.http_port.is_none());
        assert!(ports.auto_select_on_conflict);

        let server = ServerProfile::default();
        assert_eq!(server.port, 8388);
        assert_eq!(server.method, "aes-256-gcm");
        assert_eq!(server.id.len(), 32);

        let pac = PacProfile::default();
        assert!(pac.is_managed());
        assert!(pac.bypass_private_addresses);
        assert!(pac.bypass_simple_hostnames);
        assert_eq!(pac.update_interval_hours, 6);
    }

    #[test]
    fn test_first_run_selects_managed_profile() {
        let settings = AppSettings::first_run();
        let pac = settings.active_pac_profile().unwrap();
        assert_eq!(pac.name, "Managed default");
        assert!(pac.inline_rules.contains("@@||intranet.local"));
        assert!(settings.active_server_profile().is_none());
    }

    #[test]
    fn test_hotkey_display() {
        assert_eq!(HotkeyGesture::default().display(), "Ctrl+Alt+Shift+P");
        let gesture = HotkeyGesture {
            ctrl: false,
            alt: false,
            shift: false,
            win: true,
            key: "k".to_string(),
        };
        assert_eq!(gesture.display(), "Win+K");
    }

    #[test]
    fn test_settings_json_uses_snake_case_and_defaults() {
        let json = r#"{"routing_mode":"pac","ports":{"socks_port":1090}}"#;
        let settings: AppSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.routing_mode, RoutingMode::Pac);
        assert_eq!(settings.ports.socks_port, 1090);
        assert_eq!(settings.ports.pac_port, 8090);
        assert_eq!(settings.schema_version, CURRENT_SCHEMA_VERSION);
    }
}
