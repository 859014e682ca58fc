//! Settings validation.
//!
//! Validation collects every violation instead of stopping at the first,
//! so a caller can show the full list at once.

use crate::models::{AppSettings, HotkeyGesture, RoutingMode, ServerProfile};

/// Maximum length of a hotkey key name.
const MAX_HOTKEY_KEY_LEN: usize = 16;

/// Validates a settings document.
pub trait SettingsValidator: Send + Sync {
    /// Returns all violations; empty means valid.
    fn validate(&self, settings: &AppSettings) -> Vec<String>;
}

/// Default validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardValidator;

impl SettingsValidator for StandardValidator {
    fn validate(&self, settings: &AppSettings) -> Vec<String> {
        validate_settings(settings)
    }
}

/// Validates the whole settings document.
pub fn validate_settings(settings: &AppSettings) -> Vec<String> {
    let mut errors = Vec::new();

    if settings.ports.socks_port == 0 {
        errors.push("SOCKS port must be in range 1..65535.".to_string());
    }
    if settings.ports.pac_port == 0 {
        errors.push("PAC server port must be in range 1..65535.".to_string());
    }
    if settings.ports.http_port == Some(0) {
        errors.push("HTTP port must be in range 1..65535 when set.".to_string());
    }

    errors.extend(validate_hotkey(&settings.hotkey));

    if settings
        .active_server_profile_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty())
        && settings.active_server_profile().is_none()
    {
        errors.push("Active server profile does not exist.".to_string());
    }

    if settings.routing_mode == RoutingMode::Pac && settings.active_pac_profile().is_none() {
        errors.push("PAC routing mode is enabled but active PAC profile is missing.".to_string());
    }

    for profile in &settings.server_profiles {
        errors.extend(validate_server_profile(profile));
    }

    errors
}

/// Validates a hotkey gesture.
pub fn validate_hotkey(hotkey: &HotkeyGesture) -> Vec<String> {
    let mut errors = Vec::new();

    if !hotkey.ctrl && !hotkey.alt && !hotkey.shift && !hotkey.win {
        errors.push("At least one hotkey modifier is required.".to_string());
    }

    let key = hotkey.key.trim();
    if key.is_empty() || key.chars().count() > MAX_HOTKEY_KEY_LEN {
        errors.push("Hotkey key is invalid.".to_string());
    }

    errors
}

/// Validates a single server profile.
pub fn validate_server_profile(profile: &ServerProfile) -> Vec<String> {
    let mut errors = Vec::new();

    if profile.name.trim().is_empty() {
        errors.push(format!("Profile {} has empty name.", profile.id));
    }
    if profile.host.trim().is_empty() {
        errors.push(format!("Profile {} has empty host.", profile.name));
    }
    if profile.port == 0 {
        errors.push(format!("Profile {} has invalid server port.", profile.name));
    }
    if profile.method.trim().is_empty() {
        errors.push(format!("Profile {} has empty cipher method.", profile.name));
    }
    if profile.password_secret_id.trim().is_empty() {
        errors.push(format!("Profile {} has no password secret id.", profile.name));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PacProfile;

    fn valid_settings() -> AppSettings {
        let server = ServerProfile::new("Tokyo", "203.0.113.10", 8388);
        let pac = PacProfile::managed("Managed", "||example.com");
        AppSettings {
            active_server_profile_id: Some(server.id.clone()),
            active_pac_profile_id: Some(pac.id.clone()),
            server_profiles: vec![server],
            pac_profiles: vec![pac],
            routing_mode: RoutingMode::Pac,
            ..AppSettings::default()
        }
    }

    #[test]
    fn test_valid_settings_pass() {
        assert!(validate_settings(&valid_settings()).is_empty());
    }

    #[test]
    fn test_ports_must_be_nonzero() {
        let mut settings = valid_settings();
        settings.ports.socks_port = 0;
        settings.ports.pac_port = 0;
        settings.ports.http_port = Some(0);
        let errors = validate_settings(&settings);
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("SOCKS"));
    }

    #[test]
    fn test_missing_active_profiles() {
        let mut settings = valid_settings();
        settings.active_server_profile_id = Some("nope".into());
        settings.active_pac_profile_id = None;
        let errors = validate_settings(&settings);
        assert!(errors.contains(&"Active server profile does not exist.".to_string()));
        assert!(errors
            .contains(&"PAC routing mode is enabled but active PAC profile is missing.".to_string()));
    }

    #[test]
    fn test_hotkey_rules() {
        let mut hotkey = HotkeyGesture {
            ctrl: false,
            alt: false,
            shift: false,
            win: false,
            key: String::new(),
        };
        assert_eq!(validate_hotkey(&hotkey).len(), 2);

        hotkey.win = true;
        hotkey.key = "F12".into();
        assert!(validate_hotkey(&hotkey).is_empty());

        hotkey.key = "x".repeat(17);
        assert_eq!(validate_hotkey(&hotkey), vec!["Hotkey key is invalid."]);
    }

    #[test]
    fn test_server_profile_rules() {
        let mut profile = ServerProfile::new("", "", 0).with_method(" ");
        profile.password_secret_id.clear();
        let errors = validate_server_profile(&profile);
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_standard_validator_delegates() {
        let validator = StandardValidator;
        let mut settings = valid_settings();
        settings.server_profiles[0].host.clear();
        assert_eq!(validator.validate(&settings).len(), 1);
    }
}
