//! `sslocal` configuration.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use skiff_core::orchestrator::ResolvedPorts;
use skiff_core::ServerProfile;

#[derive(Debug, Serialize)]
struct ConfigFile<'a> {
    servers: Vec<ServerEntry<'a>>,
    locals: Vec<LocalEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ServerEntry<'a> {
    address: &'a str,
    port: u16,
    method: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin_opts: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct LocalEntry<'a> {
    local_address: &'a str,
    local_port: u16,
    protocol: &'static str,
}

/// Builds the JSON config passed to `sslocal -c`.
///
/// An HTTP listener is only declared when `ports.http` is set.
pub fn build_config_json(
    profile: &ServerProfile,
    password: &SecretString,
    ports: &ResolvedPorts,
    listen_address: &str,
) -> serde_json::Result<String> {
    let mut locals = vec![LocalEntry {
        local_address: listen_address,
        local_port: ports.socks,
        protocol: "socks",
    }];
    if let Some(http) = ports.http.filter(|p| *p != 0) {
        locals.push(LocalEntry {
            local_address: listen_address,
            local_port: http,
            protocol: "http",
        });
    }

    let config = ConfigFile {
        servers: vec![ServerEntry {
            address: &profile.host,
            port: profile.port,
            method: &profile.method,
            password: password.expose_secret(),
            plugin: non_blank(&profile.plugin),
            plugin_opts: non_blank(&profile.plugin_options),
        }],
        locals,
    };
    serde_json::to_string_pretty(&config)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// `ss://base64url(method:password)@host:port`.
pub fn server_url(profile: &ServerProfile, password: &SecretString) -> String {
    let user_info = URL_SAFE_NO_PAD.encode(format!("{}:{}", profile.method, password.expose_secret()));
    format!("ss://{user_info}@{}:{}", profile.host, profile.port)
}
