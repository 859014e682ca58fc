//! Shared PAC server state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use skiff_core::pac::FALLBACK_PAC_SCRIPT;

/// Script being served plus its version counter.
///
/// Cloned into every request handler; swapping the script never touches
/// the listener.
#[derive(Clone)]
pub struct PacState {
    script: Arc<ArcSwap<String>>,
    version: Arc<AtomicU64>,
}

impl Default for PacState {
    fn default() -> Self {
        Self::new(FALLBACK_PAC_SCRIPT)
    }
}

impl PacState {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: Arc::new(ArcSwap::from_pointee(script.into())),
            version: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn script(&self) -> Arc<String> {
        self.script.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Replaces the script and bumps the version. Returns the new version.
    pub fn replace(&self, script: impl Into<String>) -> u64 {
        self.script.store(Arc::new(script.into()));
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}
