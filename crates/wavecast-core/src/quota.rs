//! External rate/quota tracking.
//!
//! Buckets hold a capacity per fixed window. Reservations are taken before a
//! quota-consuming executor call and released if the call does not go through.

use std::future::Future;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reservation {
    Granted,
    Denied,
}

impl Reservation {
    pub fn is_granted(&self) -> bool {
        matches!(self, Reservation::Granted)
    }
}

/// Snapshot of one quota bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBucket {
    pub resource_key: String,
    pub capacity: i64,
    pub used: i64,
    pub window_secs: i64,
    pub window_started_at: DateTime<Utc>,
}

impl QuotaBucket {
    pub fn new(resource_key: impl Into<String>, capacity: i64, window_secs: i64, now: DateTime<Utc>) -> Self {
        Self {
            resource_key: resource_key.into(),
            capacity,
            used: 0,
            window_secs,
            window_started_at: now,
        }
    }

    /// A window too long to represent never elapses.
    fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        TimeDelta::try_seconds(self.window_secs)
            .and_then(|window| self.window_started_at.checked_add_signed(window))
            .is_some_and(|end| end <= now)
    }

    /// Usage as seen at `now`, accounting for a window that has rolled over.
    pub fn used_at(&self, now: DateTime<Utc>) -> i64 {
        if self.window_elapsed(now) { 0 } else { self.used }
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> i64 {
        (self.capacity - self.used_at(now)).max(0)
    }

    /// Take `cost` units if they fit; rolls the window over first.
    pub fn try_reserve(&mut self, cost: i64, now: DateTime<Utc>) -> Reservation {
        if self.window_elapsed(now) {
            self.used = 0;
            self.window_started_at = now;
        }
        if self.used + cost > self.capacity {
            return Reservation::Denied;
        }
        self.used += cost;
        Reservation::Granted
    }

    pub fn release(&mut self, cost: i64) {
        self.used = (self.used - cost).max(0);
    }

    /// Refund units charged to the window that started at `window_started_at`.
    /// Nothing is returned once the bucket has moved to a later window.
    pub fn release_from(&mut self, cost: i64, window_started_at: DateTime<Utc>) {
        if self.window_started_at == window_started_at {
            self.release(cost);
        }
    }
}

/// Per-resource quota counter shared by every worker process.
///
/// Implementations must make `reserve` a single atomic conditional update
/// in the shared store. Keys without a configured bucket are unlimited.
pub trait QuotaTracker: Send + Sync + Clone {
    /// Create or resize a bucket. Existing usage is kept.
    fn configure(
        &self,
        resource_key: &str,
        capacity: i64,
        window_secs: i64,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn reserve(
        &self,
        resource_key: &str,
        cost: i64,
    ) -> impl Future<Output = Result<Reservation, AppError>> + Send;

    fn release(
        &self,
        resource_key: &str,
        cost: i64,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Units still available, or `None` when the key has no bucket.
    fn remaining(
        &self,
        resource_key: &str,
    ) -> impl Future<Output = Result<Option<i64>, AppError>> + Send;
}
