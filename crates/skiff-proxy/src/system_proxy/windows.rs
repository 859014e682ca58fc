//! WinINet proxy settings in the current user's registry hive.

use std::io;

use windows_sys::Win32::Networking::WinInet::{
    InternetSetOptionW, INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED,
};
use winreg::enums::{HKEY_CURRENT_USER, KEY_READ, KEY_WRITE};
use winreg::RegKey;

use super::{ProxySettings, ProxySettingsBackend};
use crate::error::{ProxyError, Result};

const INTERNET_SETTINGS: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

pub struct RegistryBackend;

impl RegistryBackend {
    pub fn new() -> Self {
        Self
    }

    fn open(&self, flags: u32) -> Result<RegKey> {
        RegKey::predef(HKEY_CURRENT_USER)
            .open_subkey_with_flags(INTERNET_SETTINGS, flags)
            .map_err(|e| ProxyError::Backend(format!("Cannot open Internet Settings key: {e}")))
    }
}

fn read_string(key: &RegKey, name: &str) -> Option<String> {
    key.get_value::<String, _>(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn set_or_delete(key: &RegKey, name: &str, value: Option<&str>) -> io::Result<()> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(value) => key.set_value(name, &value),
        None => match key.delete_value(name) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    }
}

fn backend_err(e: io::Error) -> ProxyError {
    ProxyError::Backend(e.to_string())
}

impl ProxySettingsBackend for RegistryBackend {
    fn name(&self) -> &'static str {
        "wininet"
    }

    fn read(&self) -> Result<ProxySettings> {
        let key = self.open(KEY_READ)?;
        Ok(ProxySettings {
            proxy_enable: key.get_value::<u32, _>("ProxyEnable").unwrap_or(0),
            proxy_server: read_string(&key, "ProxyServer"),
            proxy_override: read_string(&key, "ProxyOverride"),
            auto_config_url: read_string(&key, "AutoConfigURL"),
            auto_detect: key.get_value::<u32, _>("AutoDetect").unwrap_or(0),
        })
    }

    fn write(&self, settings: &ProxySettings) -> Result<()> {
        let key = self.open(KEY_READ | KEY_WRITE)?;
        key.set_value("ProxyEnable", &settings.proxy_enable)
            .map_err(backend_err)?;
        set_or_delete(&key, "ProxyServer", settings.proxy_server.as_deref()).map_err(backend_err)?;
        set_or_delete(&key, "ProxyOverride", settings.proxy_override.as_deref())
            .map_err(backend_err)?;
        set_or_delete(&key, "AutoConfigURL", settings.auto_config_url.as_deref())
            .map_err(backend_err)?;
        key.set_value("AutoDetect", &settings.auto_detect)
            .map_err(backend_err)?;
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        for (option, label) in [
            (INTERNET_OPTION_SETTINGS_CHANGED, "SETTINGS_CHANGED"),
            (INTERNET_OPTION_REFRESH, "REFRESH"),
        ] {
            // SAFETY: both options take no buffer; a null handle targets the
            // process-wide WinINet state.
            let ok = unsafe { InternetSetOptionW(std::ptr::null(), option, std::ptr::null(), 0) };
            if ok == 0 {
                return Err(ProxyError::Backend(format!(
                    "InternetSetOption {label} failed: {}",
                    io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }
}
