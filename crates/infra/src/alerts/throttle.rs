//! Sliding-window alert throttling.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::config::ThrottlePolicy;
use crate::store::{Record, kinds};

/// Send history of one throttle key (`alertName` or `alertName:jobId`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThrottle {
    pub key: String,
    pub last_sent_at: DateTime<Utc>,
    /// Sends inside the current window.
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl Record for AlertThrottle {
    const KIND: &'static str = kinds::ALERT_THROTTLES;

    fn key(&self) -> String {
        self.key.clone()
    }
}

/// Why an alert was held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Sent less than `min_interval_secs` ago.
    MinInterval,
    /// The current hour window is full.
    HourlyCap,
}

pub fn throttle_key(alert_name: &str, job_id: Option<&str>) -> String {
    match job_id {
        Some(job_id) => format!("{alert_name}:{job_id}"),
        None => alert_name.to_string(),
    }
}

fn window() -> Duration {
    Duration::hours(1)
}

impl AlertThrottle {
    pub fn first(key: String, now: DateTime<Utc>) -> Self {
        Self {
            key,
            last_sent_at: now,
            count: 1,
            window_start: now,
        }
    }

    /// `None` when a send is allowed right now.
    pub fn check(&self, policy: &ThrottlePolicy, now: DateTime<Utc>) -> Option<Suppression> {
        if now - self.last_sent_at < Duration::seconds(policy.min_interval_secs) {
            return Some(Suppression::MinInterval);
        }
        let window_open = now - self.window_start < window();
        if window_open && self.count >= policy.max_alerts_per_job_per_hour {
            return Some(Suppression::HourlyCap);
        }
        None
    }

    /// Account for a delivered alert.
    pub fn record_send(&mut self, now: DateTime<Utc>) {
        if now - self.window_start >= window() {
            self.window_start = now;
            self.count = 1;
        } else {
            self.count += 1;
        }
        self.last_sent_at = now;
    }
}
