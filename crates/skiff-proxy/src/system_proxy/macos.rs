//! macOS proxy settings through `networksetup` on the primary service.

use std::process::Command;

use super::{parse_socks_server, ProxySettings, ProxySettingsBackend};
use crate::error::{ProxyError, Result};

pub struct NetworkSetupBackend;

impl NetworkSetupBackend {
    pub fn new() -> Self {
        Self
    }
}

fn networksetup(args: &[&str]) -> Result<String> {
    let output = Command::new("networksetup")
        .args(args)
        .output()
        .map_err(|e| ProxyError::Backend(format!("networksetup unavailable: {e}")))?;
    if !output.status.success() {
        return Err(ProxyError::Backend(format!(
            "networksetup {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn primary_service() -> Result<String> {
    let listing = networksetup(&["-listallnetworkservices"])?;

    for preferred in ["Wi-Fi", "Ethernet"] {
        if listing.lines().any(|l| l.trim() == preferred) {
            return Ok(preferred.to_string());
        }
    }
    // First line is a banner; `*` marks disabled services.
    listing
        .lines()
        .skip(1)
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('*'))
        .map(str::to_string)
        .ok_or_else(|| ProxyError::Backend("Could not find an active network service".into()))
}

fn field<'a>(output: &'a str, name: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == name).then(|| value.trim())
    })
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

impl ProxySettingsBackend for NetworkSetupBackend {
    fn name(&self) -> &'static str {
        "networksetup"
    }

    fn read(&self) -> Result<ProxySettings> {
        let service = primary_service()?;
        let socks = networksetup(&["-getsocksfirewallproxy", &service])?;
        let auto = networksetup(&["-getautoproxyurl", &service])?;
        let bypass = networksetup(&["-getproxybypassdomains", &service])?;
        let discovery = networksetup(&["-getproxyautodiscovery", &service])?;

        let mut settings = ProxySettings::default();
        if field(&socks, "Enabled") == Some("Yes") {
            settings.proxy_enable = 1;
        }
        if let (Some(host), Some(port)) = (field(&socks, "Server"), field(&socks, "Port")) {
            if !host.is_empty() && port != "0" {
                settings.proxy_server = Some(format!("socks={host}:{port}"));
            }
        }
        if field(&auto, "Enabled") == Some("Yes") {
            settings.auto_config_url = field(&auto, "URL")
                .filter(|u| !u.is_empty() && *u != "(null)")
                .map(str::to_string);
        }
        let domains: Vec<&str> = bypass
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("There aren't any"))
            .collect();
        if !domains.is_empty() {
            settings.proxy_override = Some(domains.join(";"));
        }
        if discovery.contains(": On") {
            settings.auto_detect = 1;
        }
        Ok(settings)
    }

    fn write(&self, settings: &ProxySettings) -> Result<()> {
        let service = primary_service()?;

        if let Some((host, port)) = settings.proxy_server.as_deref().and_then(parse_socks_server) {
            networksetup(&["-setsocksfirewallproxy", &service, &host, &port.to_string()])?;
        }
        networksetup(&[
            "-setsocksfirewallproxystate",
            &service,
            on_off(settings.proxy_enable != 0),
        ])?;

        let mut bypass: Vec<&str> = settings
            .proxy_override
            .as_deref()
            .unwrap_or_default()
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if bypass.is_empty() {
            bypass.push("Empty");
        }
        let mut args = vec!["-setproxybypassdomains", service.as_str()];
        args.extend(bypass);
        networksetup(&args)?;

        match settings.auto_config_url.as_deref() {
            Some(url) => {
                networksetup(&["-setautoproxyurl", &service, url])?;
                networksetup(&["-setautoproxystate", &service, "on"])?;
            }
            None => {
                networksetup(&["-setautoproxystate", &service, "off"])?;
            }
        }

        networksetup(&[
            "-setproxyautodiscovery",
            &service,
            on_off(settings.auto_detect != 0),
        ])?;
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}
