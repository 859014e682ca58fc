//! Recording backend for tests and unsupported platforms.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{ProxySettings, ProxySettingsBackend};
use crate::error::{ProxyError, Result};

/// Keeps proxy settings in memory and counts calls.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    settings: Mutex<ProxySettings>,
    writes: AtomicUsize,
    refreshes: AtomicUsize,
    fail_writes: AtomicBool,
    write_delay: Mutex<Duration>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: ProxySettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            ..Self::default()
        }
    }

    pub fn current(&self) -> ProxySettings {
        self.settings.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Makes every later write block for `delay` before it lands.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Makes every later write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl ProxySettingsBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read(&self) -> Result<ProxySettings> {
        Ok(self.current())
    }

    fn write(&self, settings: &ProxySettings) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ProxyError::Backend("write rejected".into()));
        }
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        *self.settings.lock() = settings.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
