//! Throughput meter, per-server byte totals and download quota

use crate::config::{QuotaConfig, QuotaPeriod};
use crate::types::ServerId;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Span of the rolling throughput window
const WINDOW: Duration = Duration::from_secs(10);

/// Weight of the newest window rate in the smoothed speed
const SMOOTHING: f64 = 0.5;

/// Byte counters of one server
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTotals {
    pub total: u64,
    pub day: u64,
    pub week: u64,
    pub month: u64,
}

/// Persisted meter state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterState {
    pub servers: HashMap<ServerId, ServerTotals>,
    pub quota_used: u64,
    pub quota_period_start: Option<DateTime<Utc>>,
    pub day_start: Option<DateTime<Utc>>,
    pub week_start: Option<DateTime<Utc>>,
    pub month_start: Option<DateTime<Utc>>,
}

/// Something the scheduling loop must act on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaSignal {
    /// Usage just crossed the quota
    Exceeded,
    /// A new period started; `resume` when the quota had paused downloading
    Reset { resume: bool },
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Start of the period containing `now`
pub fn period_start(period: QuotaPeriod, reset_day: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    match period {
        QuotaPeriod::Day => midnight(today),
        QuotaPeriod::Week => {
            let wanted = reset_day.clamp(1, 7);
            let current = today.weekday().number_from_monday();
            let back = (current + 7 - wanted) % 7;
            midnight(today - ChronoDuration::days(i64::from(back)))
        }
        QuotaPeriod::Month => {
            let day = reset_day.clamp(1, 28);
            let this_month = today.with_day(day).unwrap_or(today);
            if today.day() >= day {
                midnight(this_month)
            } else {
                let (y, m) = if today.month() == 1 {
                    (today.year() - 1, 12)
                } else {
                    (today.year(), today.month() - 1)
                };
                midnight(NaiveDate::from_ymd_opt(y, m, day).unwrap_or(today))
            }
        }
    }
}

/// Throughput, per-server totals and quota accounting
#[derive(Debug)]
pub struct BpsMeter {
    samples: VecDeque<(Instant, u64)>,
    speed: f64,
    state: MeterState,
    quota: QuotaConfig,
    quota_paused: bool,
}

impl BpsMeter {
    /// Fresh meter
    pub fn new(quota: QuotaConfig, now: DateTime<Utc>) -> Self {
        let mut meter = Self {
            samples: VecDeque::new(),
            speed: 0.0,
            state: MeterState::default(),
            quota,
            quota_paused: false,
        };
        meter.roll(now);
        meter
    }

    /// Continue from persisted counters
    pub fn restore(quota: QuotaConfig, state: MeterState, now: DateTime<Utc>) -> Self {
        let mut meter = Self::new(quota, now);
        meter.state = state;
        meter.roll(now);
        meter
    }

    /// Counters to persist
    pub fn state(&self) -> &MeterState {
        &self.state
    }

    /// Record bytes received from `server`. Returns `Exceeded` when this
    /// delivery crossed the quota.
    pub fn update(&mut self, server: &str, bytes: u64, now: Instant) -> Option<QuotaSignal> {
        self.samples.push_back((now, bytes));
        let totals = self.state.servers.entry(server.to_string()).or_default();
        totals.total += bytes;
        totals.day += bytes;
        totals.week += bytes;
        totals.month += bytes;

        let before = self.state.quota_used;
        self.state.quota_used += bytes;
        match self.quota.size {
            Some(limit) if before < limit && self.state.quota_used >= limit => {
                tracing::warn!(limit, used = self.state.quota_used, "download quota reached");
                self.quota_paused = true;
                Some(QuotaSignal::Exceeded)
            }
            _ => None,
        }
    }

    /// Trim the window, smooth the speed and roll periods over
    pub fn tick(&mut self, now: Instant, wall: DateTime<Utc>) -> Option<QuotaSignal> {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let rate = bytes as f64 / WINDOW.as_secs_f64();
        self.speed = SMOOTHING * rate + (1.0 - SMOOTHING) * self.speed;
        if self.speed < 1.0 {
            self.speed = 0.0;
        }
        self.roll(wall)
    }

    fn roll(&mut self, now: DateTime<Utc>) -> Option<QuotaSignal> {
        let day = period_start(QuotaPeriod::Day, 1, now);
        let week = period_start(QuotaPeriod::Week, 1, now);
        let month = period_start(QuotaPeriod::Month, 1, now);
        let s = &mut self.state;
        if s.day_start.is_some_and(|d| d < day) {
            s.servers.values_mut().for_each(|t| t.day = 0);
        }
        if s.week_start.is_some_and(|w| w < week) {
            s.servers.values_mut().for_each(|t| t.week = 0);
        }
        if s.month_start.is_some_and(|m| m < month) {
            s.servers.values_mut().for_each(|t| t.month = 0);
        }
        s.day_start = Some(day);
        s.week_start = Some(week);
        s.month_start = Some(month);

        let quota_start = period_start(self.quota.period, self.quota.reset_day, now);
        let rolled = s.quota_period_start.is_some_and(|q| q < quota_start);
        s.quota_period_start = Some(quota_start);
        if !rolled {
            return None;
        }
        s.quota_used = 0;
        let resume = std::mem::take(&mut self.quota_paused) && self.quota.resume;
        tracing::info!(resume, "quota period rolled over");
        Some(QuotaSignal::Reset { resume })
    }

    /// Smoothed bytes per second
    pub fn speed(&self) -> u64 {
        self.speed as u64
    }

    /// Counters of one server
    pub fn totals(&self, server: &str) -> ServerTotals {
        self.state.servers.get(server).cloned().unwrap_or_default()
    }

    /// Quota bytes left, when a quota is set
    pub fn quota_left(&self) -> Option<u64> {
        self.quota
            .size
            .map(|limit| limit.saturating_sub(self.state.quota_used))
    }

    /// Quota is used up
    pub fn quota_exceeded(&self) -> bool {
        self.quota_left() == Some(0)
    }

    /// Replace the quota settings
    pub fn set_quota(&mut self, quota: QuotaConfig) {
        self.quota = quota;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 15, 30, 0).unwrap()
    }

    #[test]
    fn period_starts() {
        // 2025-03-12 is a Wednesday
        let now = at(2025, 3, 12);
        assert_eq!(period_start(QuotaPeriod::Day, 1, now), midnight(now.date_naive()));
        assert_eq!(
            period_start(QuotaPeriod::Week, 1, now).date_naive(),
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
        );
        assert_eq!(
            period_start(QuotaPeriod::Week, 3, now).date_naive(),
            NaiveDate::from_ymd_opt(2025, 3, 12).unwrap()
        );
        assert_eq!(
            period_start(QuotaPeriod::Month, 15, now).date_naive(),
            NaiveDate::from_ymd_opt(2025, 2, 15).unwrap()
        );
        assert_eq!(
            period_start(QuotaPeriod::Month, 15, at(2025, 1, 3)).date_naive(),
            NaiveDate::from_ymd_opt(2024, 12, 15).unwrap()
        );
    }

    #[test]
    fn speed_follows_the_window() {
        let wall = at(2025, 3, 12);
        let mut meter = BpsMeter::new(QuotaConfig::default(), wall);
        let t0 = Instant::now();
        meter.update("s1", 1_000_000, t0);
        meter.tick(t0, wall);
        assert_eq!(meter.speed(), 50_000);
        meter.tick(t0 + Duration::from_secs(11), wall);
        assert_eq!(meter.speed(), 25_000);
        assert_eq!(meter.totals("s1").total, 1_000_000);
    }

    #[test]
    fn quota_crossing_and_rollover() {
        let quota = QuotaConfig {
            size: Some(1000),
            period: QuotaPeriod::Day,
            reset_day: 1,
            resume: true,
        };
        let day1 = at(2025, 3, 12);
        let mut meter = BpsMeter::new(quota, day1);
        let now = Instant::now();
        assert_eq!(meter.update("s1", 600, now), None);
        assert_eq!(meter.update("s1", 600, now), Some(QuotaSignal::Exceeded));
        assert!(meter.quota_exceeded());
        assert_eq!(meter.update("s1", 10, now), None);

        assert_eq!(meter.tick(now, day1), None);
        assert_eq!(
            meter.tick(now, at(2025, 3, 13)),
            Some(QuotaSignal::Reset { resume: true })
        );
        assert_eq!(meter.quota_left(), Some(1000));
        assert_eq!(meter.totals("s1").day, 0);
        assert_eq!(meter.totals("s1").total, 1210);
    }

    #[test]
    fn restore_keeps_counters() {
        let wall = at(2025, 3, 12);
        let mut meter = BpsMeter::new(QuotaConfig::default(), wall);
        meter.update("s1", 42, Instant::now());
        let state = meter.state().clone();
        let restored = BpsMeter::restore(QuotaConfig::default(), state, wall);
        assert_eq!(restored.totals("s1").month, 42);
    }
}
