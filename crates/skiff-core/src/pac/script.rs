//! PAC script generation.
//!
//! The emitted `FindProxyForURL` walks [`PRECEDENCE`] in order, one `if`
//! per enabled check, so the script and the local evaluator agree. Helpers
//! never touch DNS: private addresses are recognised as IPv4 literals only.

use std::fmt::Write as _;

use super::evaluator::{proxy_directive, PacAction, RuleCheck, PRECEDENCE};
use super::rules::PacRuleSet;
use crate::error::{CoreError, Result};
use crate::models::PacDefaultAction;

const HELPERS: &str = r#"function dnsDomainIsAny(host, domains) {
  for (var i = 0; i < domains.length; i++) {
    var d = domains[i];
    if (host === d) return true;
    if (host.length > d.length && host.substring(host.length - d.length - 1) === '.' + d) return true;
  }
  return false;
}

function globToRegExp(glob) {
  var escaped = glob.replace(/[.+?^${}()|[\]\\]/g, '\\$&').replace(/\*/g, '.*');
  return new RegExp('^' + escaped + '$', 'i');
}

function globAnyMatch(host, url, globs) {
  for (var i = 0; i < globs.length; i++) {
    var re = globToRegExp(globs[i]);
    if (re.test(host) || re.test(url)) return true;
  }
  return false;
}

function regexAnyMatch(host, url, patterns) {
  for (var i = 0; i < patterns.length; i++) {
    try {
      var re = new RegExp(patterns[i], 'i');
      if (re.test(host) || re.test(url)) return true;
    } catch (e) {
    }
  }
  return false;
}

function isPrivateIpv4(host) {
  var m = /^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$/.exec(host);
  if (!m) return false;
  var o = [];
  for (var i = 1; i <= 4; i++) {
    if (m[i].length > 1 && m[i].charAt(0) === '0') return false;
    var n = parseInt(m[i], 10);
    if (n > 255) return false;
    o.push(n);
  }
  return o[0] === 10 || o[0] === 127 ||
    (o[0] === 172 && o[1] >= 16 && o[1] <= 31) ||
    (o[0] === 192 && o[1] === 168);
}
"#;

/// Generates a standalone PAC script for the rule set.
pub fn generate_script(
    rules: &PacRuleSet,
    socks_port: u16,
    default_action: PacDefaultAction,
) -> Result<String> {
    if socks_port == 0 {
        return Err(CoreError::Pac("SOCKS port must be in range 1..65535.".to_string()));
    }

    let proxy = js_string(&proxy_directive(socks_port));
    let direct = js_string("DIRECT");

    let mut script = String::with_capacity(4096);
    script.push_str("// Generated by Skiff. Do not edit.\n");
    let _ = writeln!(script, "var PROXY_RESULT = {proxy};");
    let _ = writeln!(script, "var DIRECT_RESULT = {direct};");
    for check in PRECEDENCE {
        if let Some(name) = array_name(check) {
            let _ = writeln!(script, "var {name} = {};", js_array(&check.usable_patterns(rules)));
        }
    }
    script.push('\n');
    script.push_str(HELPERS);
    script.push('\n');

    script.push_str("function FindProxyForURL(url, host) {\n");
    script.push_str("  host = (host || '').toLowerCase();\n");
    for check in PRECEDENCE.iter().filter(|c| c.enabled(rules)) {
        let _ = writeln!(
            script,
            "  if ({}) return {}; // {}",
            condition(*check),
            result_var(check.action() == PacAction::Proxy),
            check.reason()
        );
    }
    let _ = writeln!(
        script,
        "  return {};",
        result_var(default_action == PacDefaultAction::Proxy)
    );
    script.push_str("}\n");

    Ok(script)
}

fn result_var(proxy: bool) -> &'static str {
    if proxy {
        "PROXY_RESULT"
    } else {
        "DIRECT_RESULT"
    }
}

fn array_name(check: RuleCheck) -> Option<&'static str> {
    match check {
        RuleCheck::PlainHostname | RuleCheck::PrivateAddress => None,
        RuleCheck::DirectDomain => Some("DIRECT_DOMAINS"),
        RuleCheck::ProxyDomain => Some("PROXY_DOMAINS"),
        RuleCheck::DirectGlob => Some("DIRECT_GLOBS"),
        RuleCheck::ProxyGlob => Some("PROXY_GLOBS"),
        RuleCheck::DirectRegex => Some("DIRECT_REGEX"),
        RuleCheck::ProxyRegex => Some("PROXY_REGEX"),
    }
}

fn condition(check: RuleCheck) -> String {
    match check {
        RuleCheck::PlainHostname => "host.indexOf('.') < 0".to_string(),
        RuleCheck::PrivateAddress => "isPrivateIpv4(host)".to_string(),
        RuleCheck::DirectDomain | RuleCheck::ProxyDomain => {
            format!("dnsDomainIsAny(host, {})", array_name(check).unwrap_or_default())
        }
        RuleCheck::DirectGlob | RuleCheck::ProxyGlob => {
            format!("globAnyMatch(host, url, {})", array_name(check).unwrap_or_default())
        }
        RuleCheck::DirectRegex | RuleCheck::ProxyRegex => {
            format!("regexAnyMatch(host, url, {})", array_name(check).unwrap_or_default())
        }
    }
}

fn js_array(values: &[&str]) -> String {
    let items: Vec<String> = values.iter().map(|v| js_string(v)).collect();
    format!("[{}]", items.join(", "))
}

/// Quotes a value as a single-quoted JavaScript string literal.
pub fn js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
