use chrono::Utc;
use log::{debug, warn};

use super::LocationProvider;
use crate::config::AlertConfig;
use crate::types::LocationFix;

/// True when the fix is young and tight enough to send without asking again.
pub fn is_usable(fix: &LocationFix, config: &AlertConfig) -> bool {
    let age = Utc::now().signed_duration_since(fix.time);
    let max_age = chrono::Duration::from_std(config.location_max_age)
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
    age <= max_age && fix.accuracy <= config.location_max_accuracy_m
}

/// Emergency location policy: a recent accurate cached fix, otherwise a fresh
/// fix within `fresh_fix_timeout`, otherwise whatever was cached.
pub async fn emergency_location(
    provider: &dyn LocationProvider,
    config: &AlertConfig,
) -> Option<LocationFix> {
    let last = provider.last_known().await;
    if let Some(fix) = &last {
        if is_usable(fix, config) {
            return last;
        }
        debug!(
            "[location] Cached fix rejected (accuracy {:.1}m, taken {})",
            fix.accuracy, fix.time
        );
    }

    match provider.fresh_fix(config.fresh_fix_timeout).await {
        Some(fix) => Some(fix),
        None => {
            warn!("[location] No fresh fix, falling back to cached location");
            last
        }
    }
}
