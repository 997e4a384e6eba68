//! Fixed-window RPM/RPD limiter keyed by virtual key. Windows reset on
//! the minute and day boundary relative to first use; the computed
//! `Retry-After` is the time left in the violated window.

use conduit_core::{GatewayError, Result, VirtualKey, VirtualKeyId};
use dashmap::DashMap;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

#[derive(Debug)]
struct Windows {
    minute_start: Instant,
    minute_count: u32,
    day_start: Instant,
    day_count: u32,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<VirtualKeyId, Windows>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against the key's limits, failing with a
    /// `Retry-After` when a window is exhausted.
    pub fn check(&self, key: &VirtualKey) -> Result<()> {
        if key.rpm_limit.is_none() && key.rpd_limit.is_none() {
            return Ok(());
        }

        let now = Instant::now();
        let mut entry = self.windows.entry(key.id.clone()).or_insert_with(|| Windows {
            minute_start: now,
            minute_count: 0,
            day_start: now,
            day_count: 0,
        });

        if now.duration_since(entry.minute_start) >= MINUTE {
            entry.minute_start = now;
            entry.minute_count = 0;
        }
        if now.duration_since(entry.day_start) >= DAY {
            entry.day_start = now;
            entry.day_count = 0;
        }

        if let Some(rpm) = key.rpm_limit {
            if entry.minute_count >= rpm {
                let remaining = MINUTE.saturating_sub(now.duration_since(entry.minute_start));
                return Err(GatewayError::RateLimitExceeded {
                    retry_after_seconds: Some(remaining.as_secs().max(1)),
                });
            }
        }
        if let Some(rpd) = key.rpd_limit {
            if entry.day_count >= rpd {
                let remaining = DAY.saturating_sub(now.duration_since(entry.day_start));
                return Err(GatewayError::RateLimitExceeded {
                    retry_after_seconds: Some(remaining.as_secs().max(1)),
                });
            }
        }

        entry.minute_count += 1;
        entry.day_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::GroupId;

    fn key(rpm: Option<u32>, rpd: Option<u32>) -> VirtualKey {
        VirtualKey {
            id: VirtualKeyId::from("vk1".to_string()),
            token_hash: String::new(),
            name: "k".to_string(),
            allowed_models: vec![],
            group_id: GroupId::from("g1".to_string()),
            expires_at: None,
            rpm_limit: rpm,
            rpd_limit: rpd,
            enabled: true,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn unlimited_key_passes() {
        let limiter = RateLimiter::new();
        let key = key(None, None);
        for _ in 0..1000 {
            assert!(limiter.check(&key).is_ok());
        }
    }

    #[test]
    fn rpm_exhaustion_sets_retry_after() {
        let limiter = RateLimiter::new();
        let key = key(Some(2), None);
        assert!(limiter.check(&key).is_ok());
        assert!(limiter.check(&key).is_ok());

        match limiter.check(&key).unwrap_err() {
            GatewayError::RateLimitExceeded {
                retry_after_seconds: Some(secs),
            } => assert!(secs >= 1 && secs <= 60),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rpd_counts_across_minutes() {
        let limiter = RateLimiter::new();
        let key = key(None, Some(1));
        assert!(limiter.check(&key).is_ok());
        assert!(matches!(
            limiter.check(&key).unwrap_err(),
            GatewayError::RateLimitExceeded { .. }
        ));
    }
}
