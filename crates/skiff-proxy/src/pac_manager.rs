//! Managed PAC pipeline.
//!
//! ```text
//! inline rules ─┐
//! local file   ─┼─► PacRuleSet::parse ─► generate_script ─► LastGoodPac ─► PacServer
//! rules URL    ─┘   (through HttpCache)
//! ```
//!
//! A failed regeneration leaves the last-good artifacts untouched.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use skiff_core::orchestrator::{PacEngine, PacUpdate};
use skiff_core::pac::{evaluate, generate_script, LastGoodPac, PacArtifacts, PacEvaluation, PacRuleSet};
use skiff_core::{PacPreset, PacProfile};
use skiff_server::PacServer;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::http_cache::HttpCache;
use crate::presets::PresetCatalog;

/// Ceiling for a remote rules list.
pub const RULES_MAX_BYTES: u64 = 3_000_000;

/// Regenerates, serves and evaluates PAC scripts.
pub struct PacManager {
    server: Arc<PacServer>,
    cache: Arc<HttpCache>,
    last_good: Arc<LastGoodPac>,
    presets: PresetCatalog,
    gate: Mutex<()>,
}

impl PacManager {
    pub fn new(server: Arc<PacServer>, cache: Arc<HttpCache>, last_good: Arc<LastGoodPac>) -> Self {
        let presets = PresetCatalog::new(Arc::clone(&cache));
        Self {
            server,
            cache,
            last_good,
            presets,
            gate: Mutex::new(()),
        }
    }

    pub fn with_presets(mut self, presets: PresetCatalog) -> Self {
        self.presets = presets;
        self
    }

    pub fn server(&self) -> &Arc<PacServer> {
        &self.server
    }

    pub fn last_good(&self) -> &Arc<LastGoodPac> {
        &self.last_good
    }

    /// Regenerates the managed script for `profile`.
    pub async fn update(&self, profile: &PacProfile, socks_port: u16) -> PacUpdate {
        if !profile.is_managed() {
            return PacUpdate::rejected("PAC profile is not managed.");
        }

        let _guard = self.gate.lock().await;
        match self.regenerate(profile, socks_port).await {
            Ok(rule_count) => {
                info!(profile = %profile.name, rule_count, "Managed PAC regenerated");
                PacUpdate::applied(rule_count)
            }
            Err(e) => {
                warn!(profile = %profile.name, error = %e, "Managed PAC update failed, keeping previous version");
                PacUpdate::rejected(format!("Managed PAC update failed: {e}"))
            }
        }
    }

    async fn regenerate(&self, profile: &PacProfile, socks_port: u16) -> Result<usize> {
        let text = self.load_rules_text(profile).await?;
        let rules = PacRuleSet::parse(
            &text,
            profile.bypass_private_addresses,
            profile.bypass_simple_hostnames,
        )
        .map_err(|e| ProxyError::Pac(e.to_string()))?;
        let script = generate_script(&rules, socks_port, profile.default_action)
            .map_err(|e| ProxyError::Pac(e.to_string()))?;

        let rule_count = rules.rule_count();
        self.last_good
            .store(PacArtifacts::new(rules, script.clone()).generated_for(&profile.id, socks_port));
        if self.server.is_running().await {
            self.server.update_script(script);
        }
        Ok(rule_count)
    }

    async fn load_rules_text(&self, profile: &PacProfile) -> Result<String> {
        let mut text = String::new();

        if !profile.inline_rules.trim().is_empty() {
            text.push_str(&profile.inline_rules);
            text.push('\n');
        }

        if let Some(path) = profile
            .local_rules_file_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            match tokio::fs::read_to_string(path).await {
                Ok(local) => {
                    text.push_str(&local);
                    text.push('\n');
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path, "Local PAC rules file not found, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(url) = profile.rules_url.as_deref().filter(|u| !u.trim().is_empty()) {
            let key = format!("pac-rules:{url}");
            let remote = self.cache.get_string(url, &key, RULES_MAX_BYTES).await?;
            text.push_str(&remote.content);
            text.push('\n');
        }

        Ok(text)
    }

    /// URI the OS should load the script from.
    ///
    /// Remote profiles return their HTTPS URL. Managed profiles start the
    /// local server on `pac_port` and return its versioned URI. Last-good
    /// rules are reused only when they belong to `profile`; a different
    /// `socks_port` regenerates the script from those rules.
    pub async fn resolve(&self, profile: &PacProfile, socks_port: u16, pac_port: u16) -> Result<String> {
        if !profile.is_managed() {
            return remote_pac_url(profile);
        }

        self.server
            .start(pac_port)
            .await
            .map_err(|e| ProxyError::Pac(e.to_string()))?;

        let current = self.last_good.load();
        if current.is_from_profile(&profile.id) && current.rules.has_proxy_rules() {
            if current.socks_port != socks_port {
                self.retarget(profile, &current.rules, socks_port).await?;
            }
            self.server.update_script(self.last_good.load().script.clone());
        } else {
            let update = self.update(profile, socks_port).await;
            if !update.applied {
                return Err(ProxyError::Pac(update.message));
            }
        }

        self.server
            .current_uri()
            .await
            .ok_or_else(|| ProxyError::Pac("PAC server is not running.".into()))
    }

    /// Regenerates the script for a new SOCKS port without refetching rules.
    async fn retarget(&self, profile: &PacProfile, rules: &PacRuleSet, socks_port: u16) -> Result<()> {
        let _guard = self.gate.lock().await;
        let script = generate_script(rules, socks_port, profile.default_action)
            .map_err(|e| ProxyError::Pac(e.to_string()))?;
        self.last_good
            .store(PacArtifacts::new(rules.clone(), script).generated_for(&profile.id, socks_port));
        info!(profile = %profile.name, socks_port, "Managed PAC retargeted to new SOCKS port");
        Ok(())
    }

    /// Script currently in effect.
    pub fn preview(&self) -> String {
        self.last_good.load().script.clone()
    }

    /// Evaluates `input` against the last-good rules.
    pub fn test(&self, profile: &PacProfile, input: &str, socks_port: u16) -> PacEvaluation {
        if !profile.is_managed() {
            return PacEvaluation::not_applicable(input, "Remote PAC cannot be evaluated locally.");
        }
        evaluate(&self.last_good.load().rules, input, socks_port, profile.default_action)
    }

    pub async fn presets(&self) -> Vec<PacPreset> {
        self.presets.presets().await
    }
}

fn remote_pac_url(profile: &PacProfile) -> Result<String> {
    let raw = profile
        .remote_pac_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ProxyError::Pac("Remote PAC URL is empty.".into()))?;
    let url = Url::parse(raw).map_err(|e| ProxyError::Pac(format!("Remote PAC URL is invalid: {e}")))?;
    if url.scheme() != "https" {
        return Err(ProxyError::Pac("Remote PAC must use HTTPS.".into()));
    }
    Ok(url.to_string())
}

#[async_trait]
impl PacEngine for PacManager {
    async fn update_managed(&self, profile: &PacProfile, socks_port: u16) -> PacUpdate {
        self.update(profile, socks_port).await
    }

    async fn resolve_uri(
        &self,
        profile: &PacProfile,
        socks_port: u16,
        pac_port: u16,
    ) -> skiff_core::Result<String> {
        Ok(self.resolve(profile, socks_port, pac_port).await?)
    }

    async fn stop(&self) -> skiff_core::Result<()> {
        self.server.stop().await;
        Ok(())
    }
}
