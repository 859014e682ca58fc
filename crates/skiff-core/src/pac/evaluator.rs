//! PAC decision evaluation.
//!
//! ## Precedence
//!
//! ```text
//! plain hostname ─► private IPv4 ─► direct domain ─► proxy domain
//!   ─► direct glob ─► proxy glob ─► direct regex ─► proxy regex ─► default
//! ```
//!
//! The first matching check wins. The same table drives the script
//! generator, so the generated script and [`evaluate`] agree on every input.
//!
//! Patterns are limited to the subset of regex syntax that reads the same
//! here and in a JavaScript `RegExp`; see [`check_portable_pattern`].

use std::net::Ipv4Addr;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use url::Url;

use super::rules::PacRuleSet;
use crate::models::PacDefaultAction;

/// Compiled-size ceiling for glob and regex patterns.
pub const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Routing action of a PAC decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacAction {
    Direct,
    Proxy,
}

impl PacAction {
    /// Returns the action as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proxy => "proxy",
        }
    }
}

impl From<PacDefaultAction> for PacAction {
    fn from(action: PacDefaultAction) -> Self {
        match action {
            PacDefaultAction::Proxy => Self::Proxy,
            PacDefaultAction::Direct => Self::Direct,
        }
    }
}

/// One row of the precedence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCheck {
    PlainHostname,
    PrivateAddress,
    DirectDomain,
    ProxyDomain,
    DirectGlob,
    ProxyGlob,
    DirectRegex,
    ProxyRegex,
}

/// Checks in evaluation order, before the default action.
pub const PRECEDENCE: [RuleCheck; 8] = [
    RuleCheck::PlainHostname,
    RuleCheck::PrivateAddress,
    RuleCheck::DirectDomain,
    RuleCheck::ProxyDomain,
    RuleCheck::DirectGlob,
    RuleCheck::ProxyGlob,
    RuleCheck::DirectRegex,
    RuleCheck::ProxyRegex,
];

impl RuleCheck {
    /// Action taken when this check matches.
    pub fn action(&self) -> PacAction {
        match self {
            Self::ProxyDomain | Self::ProxyGlob | Self::ProxyRegex => PacAction::Proxy,
            _ => PacAction::Direct,
        }
    }

    /// Reason reported when this check matches.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PlainHostname => "plain hostname bypass",
            Self::PrivateAddress => "private network bypass",
            Self::DirectDomain => "direct domain rule",
            Self::ProxyDomain => "proxy domain rule",
            Self::DirectGlob => "direct glob rule",
            Self::ProxyGlob => "proxy glob rule",
            Self::DirectRegex => "direct regex rule",
            Self::ProxyRegex => "proxy regex rule",
        }
    }

    /// Whether the check participates for this rule set.
    pub fn enabled(&self, rules: &PacRuleSet) -> bool {
        match self {
            Self::PlainHostname => rules.bypass_simple_hostnames,
            Self::PrivateAddress => rules.bypass_private_addresses,
            _ => true,
        }
    }

    /// Pattern list the check consults, if any.
    pub fn patterns<'a>(&self, rules: &'a PacRuleSet) -> &'a [String] {
        match self {
            Self::PlainHostname | Self::PrivateAddress => &[],
            Self::DirectDomain => &rules.direct_domains,
            Self::ProxyDomain => &rules.proxy_domains,
            Self::DirectGlob => &rules.direct_globs,
            Self::ProxyGlob => &rules.proxy_globs,
            Self::DirectRegex => &rules.direct_regex,
            Self::ProxyRegex => &rules.proxy_regex,
        }
    }

    /// Whether `pattern` takes part in this check.
    ///
    /// Globs and regexes that the script could read differently are skipped
    /// by both the evaluator and the generator.
    pub fn accepts(&self, pattern: &str) -> bool {
        match self {
            Self::DirectGlob | Self::ProxyGlob => pattern.is_ascii(),
            Self::DirectRegex | Self::ProxyRegex => {
                check_portable_pattern(pattern).is_ok() && compile_pattern(pattern).is_ok()
            }
            _ => true,
        }
    }

    /// Patterns from [`RuleCheck::patterns`] that pass [`RuleCheck::accepts`].
    pub fn usable_patterns<'a>(&self, rules: &'a PacRuleSet) -> Vec<&'a str> {
        self.patterns(rules)
            .iter()
            .map(String::as_str)
            .filter(|p| self.accepts(p))
            .collect()
    }

    fn matches(&self, rules: &PacRuleSet, host: &str, url: &str) -> bool {
        match self {
            Self::PlainHostname => !host.contains('.'),
            Self::PrivateAddress => is_private_ipv4(host),
            Self::DirectDomain | Self::ProxyDomain => self
                .patterns(rules)
                .iter()
                .any(|domain| domain_matches(host, domain)),
            Self::DirectGlob | Self::ProxyGlob => self
                .usable_patterns(rules)
                .into_iter()
                .any(|glob| glob_matches(glob, host) || glob_matches(glob, url)),
            Self::DirectRegex | Self::ProxyRegex => self
                .usable_patterns(rules)
                .into_iter()
                .any(|re| regex_matches(re, host) || regex_matches(re, url)),
        }
    }
}

/// Result of evaluating one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacEvaluation {
    /// Input as given.
    pub input: String,
    /// Host extracted from the input.
    pub host: String,
    /// `None` when the profile cannot be evaluated locally.
    pub action: Option<PacAction>,
    /// PAC directive: `DIRECT`, `SOCKS5 127.0.0.1:<port>`, or `N/A`.
    pub decision: String,
    /// Which rule decided.
    pub reason: String,
}

impl PacEvaluation {
    /// Result for profiles that are not evaluated locally.
    pub fn not_applicable(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            host: input.to_string(),
            action: None,
            decision: "N/A".to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if traffic goes direct.
    pub fn is_direct(&self) -> bool {
        self.action == Some(PacAction::Direct)
    }
}

/// PAC directive for the local SOCKS listener.
pub fn proxy_directive(socks_port: u16) -> String {
    format!("SOCKS5 127.0.0.1:{socks_port}")
}

/// Evaluates a URL or bare host against a rule set.
pub fn evaluate(
    rules: &PacRuleSet,
    input: &str,
    socks_port: u16,
    default_action: PacDefaultAction,
) -> PacEvaluation {
    let (url, host) = normalize_input(input);

    let (action, reason) = PRECEDENCE
        .iter()
        .filter(|check| check.enabled(rules))
        .find(|check| check.matches(rules, &host, &url))
        .map(|check| (check.action(), check.reason()))
        .unwrap_or_else(|| match default_action {
            PacDefaultAction::Proxy => (PacAction::Proxy, "default proxy"),
            PacDefaultAction::Direct => (PacAction::Direct, "default direct"),
        });

    let decision = match action {
        PacAction::Direct => "DIRECT".to_string(),
        PacAction::Proxy => proxy_directive(socks_port),
    };

    PacEvaluation {
        input: input.to_string(),
        host,
        action: Some(action),
        decision,
        reason: reason.to_string(),
    }
}

/// Splits an input into `(normalized url, lowercase host)`.
///
/// Absolute URLs keep their own form; anything else is treated as a host
/// (optionally followed by a path) reached over `http://`.
pub fn normalize_input(input: &str) -> (String, String) {
    let trimmed = input.trim();

    if let Ok(url) = Url::parse(trimmed) {
        if let Some(host) = url.host_str() {
            let host = host.to_lowercase();
            return (url.to_string(), host);
        }
    }

    let bare = trimmed.trim_start_matches('/');
    let normalized = format!("http://{bare}");
    let host = Url::parse(&normalized)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| bare.to_string());
    (normalized, host.to_lowercase())
}

/// Exact or subdomain match, case-insensitive.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    let host = host.to_lowercase();
    let domain = domain.to_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Returns true for 10/8, 172.16/12, 192.168/16, and 127/8 literals.
pub fn is_private_ipv4(host: &str) -> bool {
    let Ok(ip) = host.parse::<Ipv4Addr>() else {
        return false;
    };
    let [a, b, _, _] = ip.octets();
    a == 10 || a == 127 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

/// Compiles a case-insensitive pattern with the size ceiling applied.
pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
}

/// Rejects regex syntax that a JavaScript `RegExp` reads differently.
///
/// Allowed: ASCII text, `(?:` groups, classes without nesting or set
/// operators, `\xHH`, `\uHHHH`, the `\d \w \s \b` families, the
/// `\t \n \r \f \v` escapes and escaped punctuation.
pub fn check_portable_pattern(pattern: &str) -> Result<(), String> {
    if !pattern.is_ascii() {
        return Err("only ASCII patterns are supported".to_string());
    }

    let bytes = pattern.as_bytes();
    let mut in_class = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();

        if b == b'\\' {
            let Some(escaped) = next else {
                return Err("trailing backslash".to_string());
            };
            let width = escape_width(escaped, &bytes[i + 2..], in_class)
                .ok_or_else(|| format!("unsupported escape '\\{}'", escaped as char))?;
            i += 2 + width;
            continue;
        }

        if in_class {
            match b {
                b'[' => return Err("nested or POSIX character classes are not supported".to_string()),
                b'&' | b'-' | b'~' if next == Some(b) => {
                    return Err("character class set operations are not supported".to_string())
                }
                b']' => in_class = false,
                _ => {}
            }
            i += 1;
            continue;
        }

        match b {
            b'[' => {
                in_class = true;
                i += 1;
                if bytes.get(i) == Some(&b'^') {
                    i += 1;
                }
                if bytes.get(i) == Some(&b']') {
                    return Err("empty or ']'-leading character classes are not supported".to_string());
                }
                continue;
            }
            b'(' if next == Some(b'?') && bytes.get(i + 2) != Some(&b':') => {
                return Err("inline flags and special groups are not supported".to_string())
            }
            b'{' if next == Some(b',') => {
                return Err("'{,n}' repetition is not supported".to_string())
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

/// Bytes consumed after `\<escaped>`, or `None` if the escape is not portable.
fn escape_width(escaped: u8, rest: &[u8], in_class: bool) -> Option<usize> {
    let hex_run = |n: usize| rest.len() >= n && rest[..n].iter().all(u8::is_ascii_hexdigit);
    match escaped {
        b'd' | b'D' | b'w' | b'W' | b's' | b'S' | b't' | b'n' | b'r' | b'f' | b'v' => Some(0),
        b'b' | b'B' if !in_class && rest.first() != Some(&b'{') => Some(0),
        b'x' if hex_run(2) => Some(2),
        b'u' if hex_run(4) => Some(4),
        b'<' | b'>' => None,
        c if c.is_ascii_punctuation() || c == b' ' => Some(0),
        _ => None,
    }
}

/// Converts a `*` glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> String {
    format!("^{}$", regex::escape(glob).replace(r"\*", ".*"))
}

fn glob_matches(glob: &str, input: &str) -> bool {
    compile_pattern(&glob_to_regex(glob))
        .map(|re| re.is_match(input))
        .unwrap_or(false)
}

fn regex_matches(pattern: &str, input: &str) -> bool {
    compile_pattern(pattern)
        .map(|re| re.is_match(input))
        .unwrap_or(false)
}
