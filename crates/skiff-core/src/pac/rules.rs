//! PAC rule sets and the rule-text parser.
//!
//! ## Syntax
//!
//! | Line | Meaning |
//! |---|---|
//! | `\|\|example.com` | proxy domain (and its subdomains) |
//! | `@@\|\|intranet.local` | direct domain |
//! | `PROXY <token>` / `DIRECT <token>` | classify token explicitly |
//! | `<token>` | same as `PROXY <token>` |
//! | `/pattern/` | regex token |
//! | `*.example.*` | glob token (any token containing `*`) |
//! | `#`, `!`, `//` | comment |
//!
//! Every set is de-duplicated case-insensitively and sorted, so the same
//! text always produces the same rule set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::evaluator::{check_portable_pattern, compile_pattern};
use crate::error::{CoreError, Result};

/// Immutable, normalized PAC rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacRuleSet {
    pub direct_domains: Vec<String>,
    pub proxy_domains: Vec<String>,
    pub direct_globs: Vec<String>,
    pub proxy_globs: Vec<String>,
    pub direct_regex: Vec<String>,
    pub proxy_regex: Vec<String>,
    pub bypass_private_addresses: bool,
    pub bypass_simple_hostnames: bool,
}

impl Default for PacRuleSet {
    fn default() -> Self {
        Self {
            direct_domains: Vec::new(),
            proxy_domains: Vec::new(),
            direct_globs: Vec::new(),
            proxy_globs: Vec::new(),
            direct_regex: Vec::new(),
            proxy_regex: Vec::new(),
            bypass_private_addresses: true,
            bypass_simple_hostnames: true,
        }
    }
}

impl PacRuleSet {
    /// Parses rule text.
    ///
    /// Fails when a `/regex/` token does not compile or uses syntax a PAC
    /// client would read differently, or when a glob is not ASCII.
    pub fn parse(
        text: &str,
        bypass_private_addresses: bool,
        bypass_simple_hostnames: bool,
    ) -> Result<Self> {
        let mut direct = Buckets::default();
        let mut proxy = Buckets::default();

        for raw in text.split('\n') {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') || line.starts_with("//")
            {
                continue;
            }

            if let Some(rest) = line.strip_prefix("@@||") {
                direct.add_domain(rest);
            } else if let Some(rest) = line.strip_prefix("||") {
                proxy.add_domain(rest);
            } else if let Some(rest) = strip_prefix_ignore_case(line, "DIRECT ") {
                direct.add_token(rest)?;
            } else if let Some(rest) = strip_prefix_ignore_case(line, "PROXY ") {
                proxy.add_token(rest)?;
            } else {
                proxy.add_token(line)?;
            }
        }

        Ok(Self {
            direct_domains: direct.domains.into_sorted(),
            proxy_domains: proxy.domains.into_sorted(),
            direct_globs: direct.globs.into_sorted(),
            proxy_globs: proxy.globs.into_sorted(),
            direct_regex: direct.regex.into_sorted(),
            proxy_regex: proxy.regex.into_sorted(),
            bypass_private_addresses,
            bypass_simple_hostnames,
        })
    }

    /// Returns true if any rule routes traffic through the proxy.
    pub fn has_proxy_rules(&self) -> bool {
        !self.proxy_domains.is_empty() || !self.proxy_globs.is_empty() || !self.proxy_regex.is_empty()
    }

    /// Total number of rules across all sets.
    pub fn rule_count(&self) -> usize {
        self.direct_domains.len()
            + self.proxy_domains.len()
            + self.direct_globs.len()
            + self.proxy_globs.len()
            + self.direct_regex.len()
            + self.proxy_regex.len()
    }

    /// Re-emits the rules as parseable text.
    pub fn to_rules_text(&self) -> String {
        let mut lines = Vec::with_capacity(self.rule_count());
        lines.extend(self.direct_domains.iter().map(|d| format!("@@||{d}")));
        lines.extend(self.proxy_domains.iter().map(|d| format!("||{d}")));
        lines.extend(self.direct_globs.iter().map(|g| format!("DIRECT {g}")));
        lines.extend(self.proxy_globs.iter().map(|g| format!("PROXY {g}")));
        lines.extend(self.direct_regex.iter().map(|r| format!("DIRECT /{r}/")));
        lines.extend(self.proxy_regex.iter().map(|r| format!("PROXY /{r}/")));
        lines.join("\n")
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        line.get(prefix.len()..)
    } else {
        None
    }
}

/// Case-insensitive set that keeps the first spelling seen.
#[derive(Default)]
struct CaselessSet(BTreeMap<String, String>);

impl CaselessSet {
    fn insert(&mut self, value: String) {
        self.0.entry(value.to_lowercase()).or_insert(value);
    }

    fn into_sorted(self) -> Vec<String> {
        self.0.into_values().collect()
    }
}

#[derive(Default)]
struct Buckets {
    domains: CaselessSet,
    globs: CaselessSet,
    regex: CaselessSet,
}

impl Buckets {
    fn add_token(&mut self, raw: &str) -> Result<()> {
        let token = raw.trim();
        if token.is_empty() {
            return Ok(());
        }

        if token.len() > 2 && token.starts_with('/') && token.ends_with('/') {
            let pattern = &token[1..token.len() - 1];
            check_portable_pattern(pattern).map_err(|e| {
                CoreError::Pac(format!("Unsupported regex rule '{token}': {e}"))
            })?;
            compile_pattern(pattern).map_err(|e| {
                CoreError::Pac(format!("Invalid regex rule '{token}': {e}"))
            })?;
            self.regex.insert(pattern.to_string());
            return Ok(());
        }

        if token.contains('*') {
            if !token.is_ascii() {
                return Err(CoreError::Pac(format!(
                    "Unsupported glob rule '{token}': only ASCII globs are supported"
                )));
            }
            self.globs.insert(token.to_string());
            return Ok(());
        }

        self.add_domain(token);
        Ok(())
    }

    fn add_domain(&mut self, raw: &str) {
        let normalized = raw
            .trim()
            .trim_start_matches('.')
            .trim_end_matches('/')
            .trim();
        if !normalized.is_empty() {
            self.domains.insert(normalized.to_lowercase());
        }
    }
}
