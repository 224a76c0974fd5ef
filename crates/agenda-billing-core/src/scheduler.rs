//! Job scheduler
//!
//! Fires each job at its cadence in its own task. A run that starts while the
//! previous run of the same job is still going is skipped, not queued. The
//! in-process flag catches overlaps between ticks; the database job lock catches
//! overlaps with other processes running the same job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use agenda_db::JobLockRepository;

use crate::error::BillingError;
use crate::sweeper::{SweepReport, Sweeper};

/// Scheduled jobs; names are an operator contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Process,
    CheckPreapprovals,
    ProcessDaily,
    Cleanup,
}

impl Job {
    pub const ALL: [Self; 4] = [
        Self::Process,
        Self::CheckPreapprovals,
        Self::ProcessDaily,
        Self::Cleanup,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Process => "subscriptions:process",
            Self::CheckPreapprovals => "subscriptions:check-preapprovals",
            Self::ProcessDaily => "subscriptions:process-daily",
            Self::Cleanup => "subscriptions:cleanup",
        }
    }

    pub const fn cadence(&self) -> Cadence {
        match self {
            Self::Process => Cadence::Hourly,
            Self::CheckPreapprovals => Cadence::EveryThirtyMinutes,
            Self::ProcessDaily | Self::Cleanup => Cadence::DailyAt { hour: 2, minute: 0 },
        }
    }

    const fn index(&self) -> usize {
        match self {
            Self::Process => 0,
            Self::CheckPreapprovals => 1,
            Self::ProcessDaily => 2,
            Self::Cleanup => 3,
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Job {
    type Err = String;

    /// Accepts `subscriptions:process` as well as the bare `process`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix("subscriptions:").unwrap_or(s);
        Self::ALL
            .into_iter()
            .find(|job| job.name().strip_prefix("subscriptions:") == Some(bare))
            .ok_or_else(|| format!("unknown job: {s}"))
    }
}

/// When a job fires (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Hourly,
    EveryThirtyMinutes,
    DailyAt { hour: u32, minute: u32 },
}

impl Cadence {
    /// First firing time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hourly => next_multiple(now, 3_600),
            Self::EveryThirtyMinutes => next_multiple(now, 1_800),
            Self::DailyAt { hour, minute } => {
                let at = NaiveTime::from_hms_opt(*hour, *minute, 0).unwrap_or(NaiveTime::MIN);
                let today = now.date_naive().and_time(at).and_utc();
                if today > now {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
        }
    }
}

fn next_multiple(now: DateTime<Utc>, period_secs: i64) -> DateTime<Utc> {
    let next = (now.timestamp().div_euclid(period_secs) + 1) * period_secs;
    DateTime::from_timestamp(next, 0).unwrap_or(now + Duration::seconds(period_secs))
}

/// Per-job "already running" flags
#[derive(Clone, Default)]
pub struct OverlapGuard {
    running: Arc<[AtomicBool; 4]>,
}

/// Held while a job runs; releases the job on drop
pub struct JobPermit {
    running: Arc<[AtomicBool; 4]>,
    index: usize,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.running[self.index].store(false, Ordering::Release);
    }
}

impl OverlapGuard {
    /// `None` if the job is already running
    pub fn try_acquire(&self, job: Job) -> Option<JobPermit> {
        let index = job.index();
        self.running[index]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| JobPermit {
                running: Arc::clone(&self.running),
                index,
            })
    }
}

fn skipped(job: Job, holder: &'static str) {
    metrics::counter!("billing_sweeps_skipped_total", "job" => job.name(), "holder" => holder)
        .increment(1);
}

/// Runs jobs on their cadences
#[derive(Clone)]
pub struct Scheduler {
    sweeper: Sweeper,
    guard: OverlapGuard,
    locks: Arc<dyn JobLockRepository>,
}

impl Scheduler {
    /// Scheduler sharing the job locks of the sweeper's stores
    pub fn new(sweeper: Sweeper) -> Self {
        let locks = Arc::clone(&sweeper.service().stores().job_locks);
        Self {
            sweeper,
            guard: OverlapGuard::default(),
            locks,
        }
    }

    /// Run a job now unless it is already running here or elsewhere.
    ///
    /// Returns `None` when the run was skipped.
    pub async fn run_once(&self, job: Job) -> Option<Result<SweepReport, BillingError>> {
        let Some(_permit) = self.guard.try_acquire(job) else {
            warn!(job = job.name(), "Previous run still in progress, skipping");
            skipped(job, "local");
            return None;
        };

        let lease = match self.locks.try_lock(job.name()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                warn!(job = job.name(), "Job running in another process, skipping");
                skipped(job, "remote");
                return None;
            }
            Err(e) => return Some(Err(e.into())),
        };

        let result = self.sweeper.run(job).await;
        if let Err(e) = lease.release().await {
            warn!(job = job.name(), error = %e, "Failed to release job lock");
        }
        Some(result)
    }

    /// Start one timer loop per job; loops exit when `shutdown` flips or closes
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        Job::ALL
            .into_iter()
            .map(|job| {
                let scheduler = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.job_loop(job, shutdown).await })
            })
            .collect()
    }

    async fn job_loop(self, job: Job, mut shutdown: watch::Receiver<bool>) {
        info!(job = job.name(), cadence = ?job.cadence(), "Scheduling job");

        loop {
            let now = Utc::now();
            let next = job.cadence().next_after(now);
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(job = job.name(), "Job loop stopped");
                        return;
                    }
                    continue;
                }
            }

            // Each run gets its own task so an overrunning sweep does not delay
            // the next tick's overlap check
            let scheduler = self.clone();
            tokio::spawn(async move {
                let _ = scheduler.run_once(job).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn job_names_parse_with_or_without_prefix() {
        assert_eq!("subscriptions:process".parse::<Job>().unwrap(), Job::Process);
        assert_eq!("check-preapprovals".parse::<Job>().unwrap(), Job::CheckPreapprovals);
        assert_eq!("subscriptions:cleanup".parse::<Job>().unwrap(), Job::Cleanup);
        assert!("subscriptions:unknown".parse::<Job>().is_err());
        for job in Job::ALL {
            assert_eq!(job.name().parse::<Job>().unwrap(), job);
        }
    }

    #[test]
    fn hourly_fires_on_the_next_hour() {
        let next = Cadence::Hourly.next_after(at("2025-01-01T10:15:30Z"));
        assert_eq!(next, at("2025-01-01T11:00:00Z"));

        let on_boundary = Cadence::Hourly.next_after(at("2025-01-01T11:00:00Z"));
        assert_eq!(on_boundary, at("2025-01-01T12:00:00Z"));
    }

    #[test]
    fn half_hourly_fires_on_half_hours() {
        assert_eq!(
            Cadence::EveryThirtyMinutes.next_after(at("2025-01-01T10:15:00Z")),
            at("2025-01-01T10:30:00Z")
        );
        assert_eq!(
            Cadence::EveryThirtyMinutes.next_after(at("2025-01-01T10:30:00Z")),
            at("2025-01-01T11:00:00Z")
        );
    }

    #[test]
    fn daily_fires_at_two_am_utc() {
        let cadence = Job::ProcessDaily.cadence();
        assert_eq!(
            cadence.next_after(at("2025-01-01T01:59:00Z")),
            at("2025-01-01T02:00:00Z")
        );
        assert_eq!(
            cadence.next_after(at("2025-01-01T02:00:00Z")),
            at("2025-01-02T02:00:00Z")
        );
        assert_eq!(
            cadence.next_after(at("2025-12-31T23:00:00Z")),
            at("2026-01-01T02:00:00Z")
        );
    }

    #[test]
    fn overlap_guard_allows_one_run_per_job() {
        let guard = OverlapGuard::default();

        let permit = guard.try_acquire(Job::Process).unwrap();
        assert!(guard.try_acquire(Job::Process).is_none());
        assert!(guard.try_acquire(Job::Cleanup).is_some());

        drop(permit);
        assert!(guard.try_acquire(Job::Process).is_some());
    }
}
