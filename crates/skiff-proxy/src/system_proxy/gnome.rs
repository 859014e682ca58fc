//! GNOME proxy settings through `gsettings`.
//!
//! | ProxySettings     | org.gnome.system.proxy                      |
//! |-------------------|---------------------------------------------|
//! | `auto_config_url` | `mode=auto`, `autoconfig-url`               |
//! | `proxy_enable`    | `mode=manual`, `socks host` / `socks port`  |
//! | `proxy_override`  | `ignore-hosts` (`;`-joined)                 |
//! | `auto_detect`     | `mode=auto` with an empty `autoconfig-url`  |

use std::process::Command;

use super::{parse_socks_server, ProxySettings, ProxySettingsBackend};
use crate::error::{ProxyError, Result};

const SCHEMA: &str = "org.gnome.system.proxy";
const SOCKS_SCHEMA: &str = "org.gnome.system.proxy.socks";

pub struct GnomeBackend;

impl GnomeBackend {
    pub fn new() -> Self {
        Self
    }
}

fn gsettings_get(schema: &str, key: &str) -> Result<String> {
    let output = Command::new("gsettings")
        .args(["get", schema, key])
        .output()
        .map_err(|e| ProxyError::Backend(format!("gsettings unavailable: {e}")))?;
    if !output.status.success() {
        return Err(ProxyError::Backend(format!(
            "gsettings get {schema} {key} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn gsettings_set(schema: &str, key: &str, value: &str) -> Result<()> {
    let output = Command::new("gsettings")
        .args(["set", schema, key, value])
        .output()
        .map_err(|e| ProxyError::Backend(format!("gsettings unavailable: {e}")))?;
    if !output.status.success() {
        return Err(ProxyError::Backend(format!(
            "gsettings set {schema} {key} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// `'value'` → `value`.
fn unquote(value: &str) -> String {
    value.trim().trim_matches('\'').to_string()
}

/// `['a', 'b']` → `a;b`. `@as []` is empty.
fn parse_string_list(value: &str) -> Option<String> {
    let inner = value
        .trim()
        .trim_start_matches("@as")
        .trim()
        .strip_prefix('[')?
        .strip_suffix(']')?;
    let items: Vec<String> = inner
        .split(',')
        .map(unquote)
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then(|| items.join(";"))
}

fn format_string_list(value: Option<&str>) -> String {
    let items: Vec<String> = value
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("'{}'", s.replace('\'', "")))
        .collect();
    format!("[{}]", items.join(", "))
}

impl ProxySettingsBackend for GnomeBackend {
    fn name(&self) -> &'static str {
        "gnome"
    }

    fn read(&self) -> Result<ProxySettings> {
        let mode = unquote(&gsettings_get(SCHEMA, "mode")?);
        let url = Some(unquote(&gsettings_get(SCHEMA, "autoconfig-url")?)).filter(|u| !u.is_empty());
        let ignore = parse_string_list(&gsettings_get(SCHEMA, "ignore-hosts")?);
        let socks_host = unquote(&gsettings_get(SOCKS_SCHEMA, "host")?);
        let socks_port = gsettings_get(SOCKS_SCHEMA, "port")?;

        let mut settings = ProxySettings {
            proxy_override: ignore,
            ..ProxySettings::default()
        };
        if !socks_host.is_empty() {
            settings.proxy_server = Some(format!("socks={socks_host}:{}", socks_port.trim()));
        }
        match mode.as_str() {
            "manual" => settings.proxy_enable = 1,
            "auto" if url.is_some() => settings.auto_config_url = url,
            "auto" => settings.auto_detect = 1,
            _ => {}
        }
        Ok(settings)
    }

    fn write(&self, settings: &ProxySettings) -> Result<()> {
        let (host, port) = settings
            .proxy_server
            .as_deref()
            .and_then(parse_socks_server)
            .unwrap_or_default();
        gsettings_set(SOCKS_SCHEMA, "host", &host)?;
        gsettings_set(SOCKS_SCHEMA, "port", &port.to_string())?;
        gsettings_set(
            SCHEMA,
            "ignore-hosts",
            &format_string_list(settings.proxy_override.as_deref()),
        )?;
        gsettings_set(
            SCHEMA,
            "autoconfig-url",
            settings.auto_config_url.as_deref().unwrap_or_default(),
        )?;

        let mode = if settings.auto_config_url.is_some() {
            "auto"
        } else if settings.proxy_enable != 0 {
            "manual"
        } else if settings.auto_detect != 0 {
            "auto"
        } else {
            "none"
        };
        gsettings_set(SCHEMA, "mode", mode)
    }

    fn refresh(&self) -> Result<()> {
        // dconf notifies listeners on write.
        Ok(())
    }
}
