//! `ss://` URI import and export.
//!
//! Accepted forms:
//!
//! ```text
//! ss://base64url(method:password)@host:port[/][?plugin=...][#remarks]   SIP002
//! ss://method:password@host:port[#remarks]                             plain userinfo
//! ss://base64(method:password@host:port)[#remarks]                     legacy
//! ```

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{CoreError, Result};
use crate::models::ServerProfile;

const DEFAULT_REMARKS: &str = "Imported";

/// Parses an `ss://` URI into a new profile and its password.
pub fn parse_ss_uri(uri: &str) -> Result<(ServerProfile, SecretString)> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(invalid("ss uri is empty"));
    }
    let body = uri
        .get(..5)
        .filter(|scheme| scheme.eq_ignore_ascii_case("ss://"))
        .and_then(|_| uri.get(5..))
        .ok_or_else(|| invalid("URI must start with ss://"))?;

    let (before_fragment, remarks) = match body.split_once('#') {
        Some((head, fragment)) => (head, percent_decode(fragment)),
        None => (body, DEFAULT_REMARKS.to_string()),
    };
    let (endpoint, query) = before_fragment
        .split_once('?')
        .unwrap_or((before_fragment, ""));

    let (user_info, host_part) = match endpoint.rsplit_once('@') {
        Some((user, host)) => (user.to_string(), host.trim_end_matches('/').to_string()),
        None => {
            let decoded = decode_base64(endpoint)?;
            match decoded.rsplit_once('@') {
                Some((user, host)) if !user.is_empty() => (user.to_string(), host.to_string()),
                _ => return Err(invalid("Invalid SIP002 payload.")),
            }
        }
    };

    let user_info = if user_info.contains(':') {
        percent_decode(&user_info)
    } else {
        decode_base64(&user_info)?
    };
    let (method, password) = user_info
        .split_once(':')
        .ok_or_else(|| invalid("Invalid method/password block."))?;

    let (host, port) = split_host_port(&host_part)?;
    let (plugin, plugin_options) = parse_plugin(query);

    let name = if remarks.trim().is_empty() {
        host.clone()
    } else {
        remarks
    };

    let profile = ServerProfile {
        name,
        host,
        port,
        method: method.to_string(),
        plugin,
        plugin_options,
        ..ServerProfile::default()
    };
    Ok((profile, SecretString::from(password.to_string())))
}

/// Formats a profile as a SIP002 `ss://` URI.
pub fn export_ss_uri(profile: &ServerProfile, password: &SecretString) -> String {
    let user_info = URL_SAFE_NO_PAD.encode(format!(
        "{}:{}",
        profile.method,
        password.expose_secret()
    ));
    let host = if profile.host.contains(':') && !profile.host.starts_with('[') {
        format!("[{}]", profile.host)
    } else {
        profile.host.clone()
    };

    let mut uri = format!("ss://{user_info}@{host}:{}", profile.port);

    if let Some(plugin) = profile.plugin.as_deref().filter(|p| !p.trim().is_empty()) {
        let value = match profile.plugin_options.as_deref().filter(|o| !o.trim().is_empty()) {
            Some(options) => format!("{plugin};{options}"),
            None => plugin.to_string(),
        };
        uri.push_str("/?plugin=");
        uri.push_str(&utf8_percent_encode(&value, NON_ALPHANUMERIC).to_string());
    }

    uri.push('#');
    uri.push_str(&utf8_percent_encode(&profile.name, NON_ALPHANUMERIC).to_string());
    uri
}

fn invalid(message: &str) -> CoreError {
    CoreError::InvalidUri(message.to_string())
}

fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Accepts standard or URL-safe alphabets, with or without padding.
fn decode_base64(value: &str) -> Result<String> {
    let normalized: String = value
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();

    let bytes = URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .or_else(|_| STANDARD.decode(value.trim().as_bytes()))
        .map_err(|e| CoreError::InvalidUri(format!("Invalid base64 payload: {e}")))?;
    String::from_utf8(bytes).map_err(|_| invalid("Payload is not valid UTF-8."))
}

fn split_host_port(value: &str) -> Result<(String, u16)> {
    let bad = || invalid("Invalid host/port block.");

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(bad)?;
        (host, rest.strip_prefix(':').ok_or_else(bad)?)
    } else {
        value.rsplit_once(':').ok_or_else(bad)?
    };

    let port: u16 = port.parse().map_err(|_| bad())?;
    if host.is_empty() || port == 0 {
        return Err(bad());
    }
    Ok((host.to_string(), port))
}

fn parse_plugin(query: &str) -> (Option<String>, Option<String>) {
    let value = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("plugin"))
        .map(|(_, value)| percent_decode(value));

    match value {
        Some(value) if !value.trim().is_empty() => match value.split_once(';') {
            Some((plugin, options)) => (
                Some(plugin.to_string()),
                (!options.is_empty()).then(|| options.to_string()),
            ),
            None => (Some(value), None),
        },
        _ => (None, None),
    }
}
