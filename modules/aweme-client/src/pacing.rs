//! Per-session request cadence.
//!
//! A session's visits are counted; every visit whose count is a multiple of a
//! checkpoint threshold earns a long pause, everything else a short one.
//! Pauses are jittered and measured from the previous scheduled instant, so a
//! caller that was busy elsewhere does not pay twice.

use std::collections::VecDeque;
use std::time::Duration;

use aweme_common::PacingConfig;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{FetchError, Result};

/// Number of recent visit instants the burst window looks back over.
pub const HISTORY_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    pub every: u64,
    pub sleep: Duration,
}

impl Checkpoint {
    /// A threshold earns a pause of twice its value in seconds.
    pub fn doubling(every: u64) -> Self {
        Self {
            every,
            sleep: Duration::from_secs(every * 2),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacingProfile {
    pub name: String,
    /// Largest threshold first.
    pub checkpoints: Vec<Checkpoint>,
    pub default_sleep: Duration,
    pub jitter: (f64, f64),
    pub idle_reset: Duration,
    /// When set, the last `HISTORY_DEPTH` visits must span at least this long.
    pub burst_floor: Option<Duration>,
}

impl PacingProfile {
    pub fn classic() -> Self {
        Self {
            name: "classic".to_string(),
            checkpoints: [2048, 1024, 256, 64, 32, 16]
                .into_iter()
                .map(Checkpoint::doubling)
                .collect(),
            default_sleep: Duration::from_secs(4),
            jitter: (0.75, 1.25),
            idle_reset: Duration::from_secs(3600),
            burst_floor: None,
        }
    }

    pub fn smoothed() -> Self {
        Self {
            name: "smoothed".to_string(),
            burst_floor: Some(Duration::from_secs(300)),
            ..Self::classic()
        }
    }

    pub fn named(name: &str) -> Option<Self> {
        match name {
            "classic" => Some(Self::classic()),
            "smoothed" => Some(Self::smoothed()),
            _ => None,
        }
    }

    pub fn from_config(config: &PacingConfig) -> Result<Self> {
        let mut profile = Self::named(&config.profile).ok_or_else(|| {
            FetchError::Config(format!("unknown pacing profile '{}'", config.profile))
        })?;

        if let Some(thresholds) = &config.checkpoints {
            if thresholds.iter().any(|t| *t == 0) {
                return Err(FetchError::Config("pacing checkpoint of 0".into()));
            }
            let mut thresholds = thresholds.clone();
            thresholds.sort_unstable_by(|a, b| b.cmp(a));
            thresholds.dedup();
            profile.checkpoints = thresholds.into_iter().map(Checkpoint::doubling).collect();
        }
        if let Some(secs) = config.default_sleep_secs {
            profile.default_sleep = Duration::try_from_secs_f64(secs)
                .map_err(|e| FetchError::Config(format!("default_sleep_secs: {e}")))?;
        }
        if let Some([lo, hi]) = config.jitter {
            if !(lo > 0.0 && lo <= hi) {
                return Err(FetchError::Config(format!("jitter bounds [{lo}, {hi}]")));
            }
            profile.jitter = (lo, hi);
        }
        if let Some(secs) = config.idle_reset_secs {
            profile.idle_reset = Duration::from_secs(secs);
        }
        if let Some(secs) = config.burst_floor_secs {
            profile.burst_floor = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(profile)
    }

    fn base_sleep(&self, visit_count: u64) -> Duration {
        self.checkpoints
            .iter()
            .find(|c| visit_count % c.every == 0)
            .map(|c| c.sleep)
            .unwrap_or(self.default_sleep)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacingState {
    pub visit_count: u64,
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub recent: VecDeque<DateTime<Utc>>,
    /// Every visit since the process started, idle resets included.
    pub total_visits: u64,
}

/// What `schedule` decided for one visit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pace {
    /// First visit on this session.
    Fresh,
    /// The session sat idle long enough to count as new.
    IdleReset { idle: Duration },
    /// The scheduled instant is already in the past.
    Immediate { behind: Duration },
    Wait { wait: Duration },
}

impl Pace {
    pub fn wait(&self) -> Duration {
        match self {
            Pace::Wait { wait } => *wait,
            _ => Duration::ZERO,
        }
    }
}

pub struct PacingGovernor {
    profile: PacingProfile,
    rng: StdRng,
    state: PacingState,
}

impl PacingGovernor {
    pub fn new(profile: PacingProfile) -> Self {
        Self {
            profile,
            rng: StdRng::from_os_rng(),
            state: PacingState::default(),
        }
    }

    pub fn seeded(profile: PacingProfile, seed: u64) -> Self {
        Self {
            profile,
            rng: StdRng::seed_from_u64(seed),
            state: PacingState::default(),
        }
    }

    pub fn state(&self) -> &PacingState {
        &self.state
    }

    pub fn profile(&self) -> &PacingProfile {
        &self.profile
    }

    /// Decide how long the caller must block before the next visit. Call
    /// `complete` once the wait is over.
    pub fn schedule(&mut self, now: DateTime<Utc>) -> Pace {
        self.state.total_visits += 1;

        let last = match self.state.last_scheduled_at {
            Some(last) if self.state.visit_count > 0 => last,
            _ => {
                self.state.last_scheduled_at = Some(now);
                return Pace::Fresh;
            }
        };

        let base = self.profile.base_sleep(self.state.visit_count);
        let (lo, hi) = self.profile.jitter;
        let factor = if lo < hi {
            self.rng.random_range(lo..=hi)
        } else {
            lo
        };
        let mut scheduled = last + to_delta(base.mul_f64(factor));

        if let Some(floor) = self.profile.burst_floor {
            if self.state.recent.len() >= HISTORY_DEPTH {
                if let Some(oldest) = self.state.recent.front() {
                    scheduled = scheduled.max(*oldest + to_delta(floor));
                }
            }
        }

        self.state.last_scheduled_at = Some(scheduled);

        let lead = scheduled - now;
        if lead > TimeDelta::zero() {
            return Pace::Wait {
                wait: lead.to_std().unwrap_or_default(),
            };
        }

        let behind = (-lead).to_std().unwrap_or_default();
        if behind > self.profile.idle_reset {
            self.state.visit_count = 0;
            return Pace::IdleReset { idle: behind };
        }
        Pace::Immediate { behind }
    }

    /// Record that the visit happened at `now`.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state.last_scheduled_at = Some(now);
        self.state.visit_count += 1;
        self.state.recent.push_back(now);
        while self.state.recent.len() > HISTORY_DEPTH {
            self.state.recent.pop_front();
        }
    }
}

pub(crate) fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// Drive a governor through `n` visits, completing each at its scheduled
    /// instant. Returns the waits.
    fn drive(gov: &mut PacingGovernor, n: usize) -> Vec<Duration> {
        let mut now = t0();
        let mut waits = Vec::new();
        for _ in 0..n {
            let pace = gov.schedule(now);
            now += to_delta(pace.wait());
            gov.complete(now);
            waits.push(pace.wait());
        }
        waits
    }

    #[test]
    fn first_visit_is_free() {
        let mut gov = PacingGovernor::seeded(PacingProfile::classic(), 1);
        assert_eq!(gov.schedule(t0()), Pace::Fresh);
        assert_eq!(gov.state().last_scheduled_at, Some(t0()));
    }

    #[test]
    fn same_seed_same_waits() {
        let mut a = PacingGovernor::seeded(PacingProfile::classic(), 7);
        let mut b = PacingGovernor::seeded(PacingProfile::classic(), 7);
        assert_eq!(drive(&mut a, 40), drive(&mut b, 40));
    }

    #[test]
    fn last_scheduled_never_goes_backwards() {
        let mut gov = PacingGovernor::seeded(PacingProfile::smoothed(), 3);
        let mut now = t0();
        let mut previous = None;
        for i in 0..50 {
            let pace = gov.schedule(now);
            let scheduled = gov.state().last_scheduled_at.unwrap();
            if let Some(prev) = previous {
                assert!(scheduled >= prev, "visit {i} moved backwards");
            }
            now += to_delta(pace.wait()) + TimeDelta::seconds(1);
            gov.complete(now);
            previous = gov.state().last_scheduled_at;
        }
    }

    #[test]
    fn checkpoint_visits_sleep_longer() {
        let mut gov = PacingGovernor::seeded(PacingProfile::classic(), 11);
        let waits = drive(&mut gov, 70);
        // waits[n] is scheduled with visit_count == n.
        for (n, wait) in waits.iter().enumerate().skip(1) {
            let base = if n % 64 == 0 {
                128.0
            } else if n % 32 == 0 {
                64.0
            } else if n % 16 == 0 {
                32.0
            } else {
                4.0
            };
            let secs = wait.as_secs_f64();
            assert!(
                secs >= base * 0.75 - 1e-6 && secs <= base * 1.25 + 1e-6,
                "visit {n}: {secs}s outside jitter band of {base}s"
            );
        }
    }

    #[test]
    fn idle_gap_resets_count() {
        let mut gov = PacingGovernor::seeded(PacingProfile::classic(), 5);
        drive(&mut gov, 10);
        assert_eq!(gov.state().visit_count, 10);

        let later = gov.state().last_scheduled_at.unwrap() + TimeDelta::seconds(3700);
        let pace = gov.schedule(later);
        assert!(matches!(pace, Pace::IdleReset { .. }));
        assert_eq!(pace.wait(), Duration::ZERO);
        assert_eq!(gov.state().visit_count, 0);

        gov.complete(later);
        assert_eq!(gov.state().visit_count, 1);
        assert_eq!(gov.state().total_visits, 11);
    }

    #[test]
    fn short_gap_keeps_count() {
        let mut gov = PacingGovernor::seeded(PacingProfile::classic(), 5);
        drive(&mut gov, 3);
        let later = gov.state().last_scheduled_at.unwrap() + TimeDelta::seconds(600);
        assert!(matches!(gov.schedule(later), Pace::Immediate { .. }));
        assert_eq!(gov.state().visit_count, 3);
    }

    #[test]
    fn burst_floor_spreads_visits() {
        let mut gov = PacingGovernor::seeded(PacingProfile::smoothed(), 9);
        let mut now = t0();
        let mut visits = Vec::new();
        for _ in 0..12 {
            let pace = gov.schedule(now);
            now += to_delta(pace.wait());
            gov.complete(now);
            visits.push(now);
        }
        for window in visits.windows(HISTORY_DEPTH + 1).skip(1) {
            let span = window[HISTORY_DEPTH] - window[0];
            assert!(span >= TimeDelta::seconds(300), "span {span} under floor");
        }
    }

    #[test]
    fn config_overrides_profile() {
        let config = PacingConfig {
            profile: "smoothed".into(),
            checkpoints: Some(vec![8, 100]),
            default_sleep_secs: Some(2.0),
            jitter: Some([1.0, 1.0]),
            idle_reset_secs: None,
            burst_floor_secs: Some(0),
        };
        let profile = PacingProfile::from_config(&config).unwrap();
        assert_eq!(profile.checkpoints[0], Checkpoint::doubling(100));
        assert_eq!(profile.checkpoints[1].sleep, Duration::from_secs(16));
        assert_eq!(profile.burst_floor, None);

        let mut gov = PacingGovernor::seeded(profile, 0);
        let waits = drive(&mut gov, 9);
        assert_eq!(waits[1], Duration::from_secs(2));
        assert_eq!(waits[8], Duration::from_secs(16));
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let config = PacingConfig {
            profile: "turbo".into(),
            ..PacingConfig::default()
        };
        assert!(PacingProfile::from_config(&config).is_err());
    }
}
