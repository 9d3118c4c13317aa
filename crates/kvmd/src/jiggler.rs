//! Inactivity jiggler (C6): periodically nudges the mouse when no operator
//! input has been seen for a configured span, so the host doesn't sleep or
//! lock during idle KVM sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::hid::HidFanOut;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(20);

pub struct JigglerConfig {
    pub interval: Duration,
    pub inactivity_limit: Duration,
    /// Uniform random fraction (0.0-1.0) of `interval` added as jitter before
    /// each check, so runs aren't perfectly periodic.
    pub jitter_percentage: f64,
}

impl Default for JigglerConfig {
    fn default() -> Self {
        Self { interval: DEFAULT_INTERVAL, inactivity_limit: Duration::from_secs(600), jitter_percentage: 0.0 }
    }
}

/// Tracks the last time the operator sent a HID event, shared with whatever
/// RPC handlers process `keyboardReport`/`absMouseReport`/`wheelReport`.
#[derive(Clone)]
pub struct ActivityTracker {
    last_input: Arc<AtomicU64>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self { last_input: Arc::new(AtomicU64::new(now_secs())) }
    }

    pub fn touch(&self) {
        self.last_input.store(now_secs(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_input.load(Ordering::Relaxed);
        Duration::from_secs(now_secs().saturating_sub(last))
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Sleeps `interval` plus a uniform random jitter up to `jitter_percentage`
/// of it, then emits a two-report jiggle if the tracker has been idle past
/// `inactivity_limit`.
pub async fn run(config: JigglerConfig, tracker: ActivityTracker, hid: Arc<HidFanOut>) {
    loop {
        let jitter = if config.jitter_percentage > 0.0 {
            let fraction: f64 = rand::thread_rng().gen_range(0.0..config.jitter_percentage);
            Duration::from_secs_f64(config.interval.as_secs_f64() * fraction)
        } else {
            Duration::ZERO
        };
        tokio::time::sleep(config.interval + jitter).await;

        if tracker.idle_for() > config.inactivity_limit {
            if let Err(e) = jiggle(&hid).await {
                tracing::warn!(error = %e, "Jiggler failed to emit mouse movement");
            }
        }
    }
}

async fn jiggle(hid: &HidFanOut) -> anyhow::Result<()> {
    hid.abs_mouse_report(1, 1, 0).await?;
    hid.abs_mouse_report(0, 0, 0).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_tracker_starts_not_idle() {
        let tracker = ActivityTracker::new();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn touch_resets_idle_duration() {
        let tracker = ActivityTracker::new();
        tracker.last_input.store(now_secs() - 1000, Ordering::Relaxed);
        assert!(tracker.idle_for() >= Duration::from_secs(999));
        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn default_config_has_sane_values() {
        let config = JigglerConfig::default();
        assert_eq!(config.interval, DEFAULT_INTERVAL);
        assert!(config.inactivity_limit > Duration::ZERO);
    }
}
