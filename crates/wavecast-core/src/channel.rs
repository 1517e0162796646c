//! Publication channels and their posting schedules.
//!
//! A channel is an independently credentialed destination. Its schedule
//! restricts when publications may start: preferred windows evaluated in the
//! channel's own timezone, plus a minimum spacing between publications.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Opaque handle to a channel's credentials.
///
/// The orchestrator only passes it to the publication executor; it never
/// reads or stores the secret behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialScope(String);

impl CredentialScope {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A daily time range in the channel's local time.
///
/// `start > end` describes an overnight window (e.g. 22:00 - 02:00).
/// An empty `days` list means every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[serde(default)]
    pub days: Vec<Weekday>,
}

impl PostingWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            days: Vec::new(),
        }
    }

    pub fn on_days(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.days = days.into_iter().collect();
        self
    }

    fn contains(&self, weekday: Weekday, time: NaiveTime) -> bool {
        if !self.days.is_empty() && !self.days.contains(&weekday) {
            return false;
        }
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Longest accepted rate window or publication spacing (one leap year).
pub const MAX_WINDOW_SECS: i64 = 366 * 24 * 60 * 60;

/// When a channel may publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingSchedule {
    /// IANA timezone name the windows are expressed in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Preferred windows; empty means "any time".
    #[serde(default)]
    pub windows: Vec<PostingWindow>,
    /// Minimum spacing between two publications on this channel.
    #[serde(default)]
    pub min_interval_secs: Option<u64>,
}

impl Default for PostingSchedule {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            windows: Vec::new(),
            min_interval_secs: None,
        }
    }
}

impl PostingSchedule {
    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    pub fn with_window(mut self, window: PostingWindow) -> Self {
        self.windows.push(window);
        self
    }

    pub fn with_min_interval(mut self, secs: u64) -> Self {
        self.min_interval_secs = Some(secs);
        self
    }

    pub fn tz(&self) -> Result<Tz, AppError> {
        self.timezone.parse().map_err(|_| {
            AppError::InvalidInput(format!(
                "'{}' is not a valid IANA timezone",
                self.timezone
            ))
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.tz()?;
        if self
            .min_interval_secs
            .is_some_and(|secs| secs > MAX_WINDOW_SECS as u64)
        {
            return Err(AppError::InvalidInput(format!(
                "min interval must be at most {MAX_WINDOW_SECS} seconds"
            )));
        }
        Ok(())
    }

    /// Whether `now` falls inside a preferred window (always true without windows).
    pub fn is_open_at(&self, now: DateTime<Utc>) -> Result<bool, AppError> {
        if self.windows.is_empty() {
            return Ok(true);
        }
        let local = now.with_timezone(&self.tz()?);
        let weekday = local.weekday();
        let time = local.time();
        Ok(self.windows.iter().any(|w| w.contains(weekday, time)))
    }

    /// Earliest time the next publication may start given the previous one.
    pub fn next_allowed_after(&self, last_published_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.min_interval_secs?).ok()?;
        Some(last_published_at + TimeDelta::try_seconds(secs)?)
    }
}

/// Per-channel publication budget, enforced through the quota tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudget {
    /// Units available per window.
    pub capacity: i64,
    /// Window length in seconds.
    pub window_secs: i64,
    /// Units consumed by one publication.
    pub publish_cost: i64,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            capacity: 6,
            window_secs: 24 * 60 * 60,
            publish_cost: 1,
        }
    }
}

impl RateBudget {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.capacity < 0 || self.publish_cost < 0 {
            return Err(AppError::InvalidInput(
                "rate budget capacity and cost must be non-negative".into(),
            ));
        }
        if self.window_secs <= 0 || self.window_secs > MAX_WINDOW_SECS {
            return Err(AppError::InvalidInput(format!(
                "rate budget window must be between 1 and {MAX_WINDOW_SECS} seconds"
            )));
        }
        Ok(())
    }
}

/// Why a channel can or cannot take a publication right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    UnknownChannel,
    Inactive,
    OutsideWindow,
    TooSoon { until: DateTime<Utc> },
    QuotaExhausted,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eligibility::Eligible => write!(f, "eligible"),
            Eligibility::UnknownChannel => write!(f, "unknown channel"),
            Eligibility::Inactive => write!(f, "channel inactive"),
            Eligibility::OutsideWindow => write!(f, "outside posting window"),
            Eligibility::TooSoon { until } => write!(f, "too soon, next slot at {until}"),
            Eligibility::QuotaExhausted => write!(f, "rate budget exhausted"),
        }
    }
}

/// A publication destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub credential_scope: CredentialScope,
    pub schedule: PostingSchedule,
    pub rate_budget: RateBudget,
    pub last_published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// Quota tracker key holding this channel's rate budget.
    pub fn quota_key(&self) -> String {
        quota_key_for(self.id)
    }

    /// Everything except the quota check: activation, window and spacing.
    pub fn schedule_eligibility(&self, now: DateTime<Utc>) -> Eligibility {
        if !self.active {
            return Eligibility::Inactive;
        }
        match self.schedule.is_open_at(now) {
            Ok(true) => {}
            Ok(false) => return Eligibility::OutsideWindow,
            Err(e) => {
                tracing::warn!(channel_id = %self.id, error = %e, "Unusable posting schedule");
                return Eligibility::OutsideWindow;
            }
        }
        if let Some(last) = self.last_published_at
            && let Some(until) = self.schedule.next_allowed_after(last)
            && now < until
        {
            return Eligibility::TooSoon { until };
        }
        Eligibility::Eligible
    }
}

pub fn quota_key_for(channel_id: Uuid) -> String {
    format!("channel:{channel_id}")
}

/// Request to create a channel. Channels are always created inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub credential_scope: CredentialScope,
    #[serde(default)]
    pub schedule: PostingSchedule,
    #[serde(default)]
    pub rate_budget: RateBudget,
}

impl NewChannel {
    pub fn new(name: impl Into<String>, credential_scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential_scope: CredentialScope::new(credential_scope),
            schedule: PostingSchedule::default(),
            rate_budget: RateBudget::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: PostingSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_rate_budget(mut self, budget: RateBudget) -> Self {
        self.rate_budget = budget;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::InvalidInput("channel name is required".into()));
        }
        if self.credential_scope.as_str().trim().is_empty() {
            return Err(AppError::InvalidInput(
                "channel credential scope is required".into(),
            ));
        }
        self.schedule.validate()?;
        self.rate_budget.validate()
    }
}
