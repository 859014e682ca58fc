//! Last known-good PAC artifacts.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

use super::rules::PacRuleSet;

/// Script served before any managed profile has been generated.
pub const FALLBACK_PAC_SCRIPT: &str = "function FindProxyForURL(url, host) { return 'DIRECT'; }";

/// Rule set and script produced by one successful regeneration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacArtifacts {
    pub rules: PacRuleSet,
    pub script: String,
    /// Profile the rules came from; `None` for the fallback.
    pub profile_id: Option<String>,
    /// SOCKS port baked into the script's proxy directive.
    pub socks_port: u16,
    pub generated_at: DateTime<Utc>,
}

impl PacArtifacts {
    /// Creates artifacts stamped with the current time.
    pub fn new(rules: PacRuleSet, script: impl Into<String>) -> Self {
        Self {
            rules,
            script: script.into(),
            profile_id: None,
            socks_port: 0,
            generated_at: Utc::now(),
        }
    }

    /// Records which profile and SOCKS port the script was generated for.
    pub fn generated_for(mut self, profile_id: impl Into<String>, socks_port: u16) -> Self {
        self.profile_id = Some(profile_id.into());
        self.socks_port = socks_port;
        self
    }

    pub fn is_from_profile(&self, profile_id: &str) -> bool {
        self.profile_id.as_deref() == Some(profile_id)
    }
}

impl Default for PacArtifacts {
    fn default() -> Self {
        Self::new(PacRuleSet::default(), FALLBACK_PAC_SCRIPT)
    }
}

/// Holder of the artifacts currently in effect.
///
/// Readers never block; a store replaces the whole value at once, so a
/// reader sees either the previous or the new artifacts, never a mix.
#[derive(Debug, Default)]
pub struct LastGoodPac {
    current: ArcSwap<PacArtifacts>,
}

impl LastGoodPac {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the artifacts in effect.
    pub fn load(&self) -> Arc<PacArtifacts> {
        self.current.load_full()
    }

    /// Replaces the artifacts in effect.
    pub fn store(&self, artifacts: PacArtifacts) {
        self.current.store(Arc::new(artifacts));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_fallback() {
        let holder = LastGoodPac::new();
        let current = holder.load();
        assert_eq!(current.script, FALLBACK_PAC_SCRIPT);
        assert!(!current.rules.has_proxy_rules());
    }

    #[test]
    fn test_store_replaces_and_old_readers_keep_snapshot() {
        let holder = LastGoodPac::new();
        let before = holder.load();

        let rules = PacRuleSet::parse("||a.com", true, true).unwrap();
        holder.store(PacArtifacts::new(rules.clone(), "script-2"));

        assert_eq!(before.script, FALLBACK_PAC_SCRIPT);
        assert_eq!(holder.load().script, "script-2");
        assert_eq!(holder.load().rules, rules);
    }

    #[test]
    fn test_artifacts_remember_origin() {
        let fallback = PacArtifacts::default();
        assert!(fallback.profile_id.is_none());
        assert!(!fallback.is_from_profile("p1"));

        let artifacts = PacArtifacts::new(PacRuleSet::default(), "s").generated_for("p1", 1081);
        assert!(artifacts.is_from_profile("p1"));
        assert!(!artifacts.is_from_profile("p2"));
        assert_eq!(artifacts.socks_port, 1081);
    }
}
