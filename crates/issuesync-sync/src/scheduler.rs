//! Single-flight cycle scheduler. Every driver (heartbeat interval, coarse
//! cron refresh, manual trigger) goes through [`CycleScheduler::trigger`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

use crate::{CycleReport, SyncPipeline, TriggerSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
}

impl SchedulerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Ran(CycleReport),
    /// A cycle was already running; this trigger was dropped.
    Skipped,
}

impl TriggerOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Releases the running flag even if the cycle future is dropped or panics.
struct RunningGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.state.store(SchedulerState::Idle as u8, Ordering::Release);
    }
}

pub struct CycleScheduler {
    pipeline: Arc<SyncPipeline>,
    state: AtomicU8,
    cycles_started: AtomicU64,
    triggers_skipped: AtomicU64,
    last_report: Mutex<Option<CycleReport>>,
}

impl CycleScheduler {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline,
            state: AtomicU8::new(SchedulerState::Idle as u8),
            cycles_started: AtomicU64::new(0),
            triggers_skipped: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<SyncPipeline> {
        &self.pipeline
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::Relaxed)
    }

    pub fn triggers_skipped(&self) -> u64 {
        self.triggers_skipped.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }

    /// Run a cycle unless one is already running. Never queues.
    pub async fn trigger(&self, source: TriggerSource) -> TriggerOutcome {
        if self
            .state
            .compare_exchange(
                SchedulerState::Idle as u8,
                SchedulerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.triggers_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(%source, "cycle already running; trigger dropped");
            return TriggerOutcome::Skipped;
        }
        let _guard = RunningGuard { state: &self.state };
        self.cycles_started.fetch_add(1, Ordering::Relaxed);

        let report = self.pipeline.run_cycle(source).await;
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
        TriggerOutcome::Ran(report)
    }

    /// Heartbeat driver. The first tick fires immediately; each tick is
    /// spawned so a long cycle surfaces as a skipped trigger, not a delay.
    pub fn spawn_heartbeat(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    scheduler.trigger(TriggerSource::Heartbeat).await;
                });
            }
        })
    }

    /// Coarse refresh driver sharing the same arbiter as the heartbeat.
    pub async fn build_refresh_scheduler(self: &Arc<Self>, cron: &String) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let scheduler = Arc::clone(&scheduler);
            Box::pin(async move {
                scheduler.trigger(TriggerSource::Refresh).await;
            })
        })
        .with_context(|| format!("creating refresh job for cron {cron}"))?;
        sched.add(job).await.context("adding refresh job")?;
        Ok(sched)
    }

    pub async fn start_drivers(
        self: &Arc<Self>,
        heartbeat: Duration,
        refresh_cron: Option<&String>,
    ) -> Result<SchedulerDrivers> {
        let refresh = match refresh_cron {
            Some(cron) => {
                let sched = self.build_refresh_scheduler(cron).await?;
                sched.start().await.context("starting refresh scheduler")?;
                Some(sched)
            }
            None => None,
        };
        let heartbeat_task = self.spawn_heartbeat(heartbeat);
        info!(
            heartbeat_secs = heartbeat.as_secs(),
            refresh = refresh_cron.map(String::as_str).unwrap_or("disabled"),
            "sync scheduler started"
        );
        Ok(SchedulerDrivers {
            heartbeat: heartbeat_task,
            refresh,
        })
    }
}

pub struct SchedulerDrivers {
    heartbeat: JoinHandle<()>,
    refresh: Option<JobScheduler>,
}

impl SchedulerDrivers {
    pub async fn shutdown(mut self) -> Result<()> {
        self.heartbeat.abort();
        if let Some(sched) = self.refresh.as_mut() {
            sched.shutdown().await.context("stopping refresh scheduler")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{page_of, ScriptedSearch};
    use async_trait::async_trait;
    use issuesync_github::{CredentialPool, FetcherConfig, PageRequest, SearchApi, SearchError, SearchPage};
    use issuesync_storage::{IssueStore, MemoryIssueStore};
    use tokio::sync::Notify;

    /// Blocks every request until the gate is opened.
    struct GatedSearch {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl SearchApi for GatedSearch {
        async fn search_page(&self, _token: &str, _request: &PageRequest) -> Result<SearchPage, SearchError> {
            self.gate.notified().await;
            Ok(page_of(&[1]))
        }
    }

    fn fetcher_config(max_pages: u32) -> FetcherConfig {
        FetcherConfig {
            page_size: 10,
            max_pages,
            throttle: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            deadline: None,
        }
    }

    fn scheduler_with(api: Arc<dyn SearchApi>, config: FetcherConfig) -> Arc<CycleScheduler> {
        let pool = CredentialPool::from_tokens(["t"]).unwrap();
        let store: Arc<dyn IssueStore> = Arc::new(MemoryIssueStore::new());
        Arc::new(CycleScheduler::new(Arc::new(SyncPipeline::new(api, pool, config, store))))
    }

    #[tokio::test]
    async fn simultaneous_triggers_start_exactly_one_cycle() {
        let gate = Arc::new(Notify::new());
        let scheduler = scheduler_with(Arc::new(GatedSearch { gate: gate.clone() }), fetcher_config(1));

        let (first, second, _) = tokio::join!(
            scheduler.trigger(TriggerSource::Heartbeat),
            scheduler.trigger(TriggerSource::Refresh),
            async {
                tokio::task::yield_now().await;
                gate.notify_one();
            }
        );

        assert!(matches!(first, TriggerOutcome::Ran(_)));
        assert!(second.is_skipped());
        assert_eq!(scheduler.cycles_started(), 1);
        assert_eq!(scheduler.triggers_skipped(), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn scheduler_returns_to_idle_between_cycles() {
        let api = Arc::new(ScriptedSearch::default());
        api.respond("t", 1, Ok(page_of(&[1, 2])));
        let scheduler = scheduler_with(api, fetcher_config(1));

        let first = scheduler.trigger(TriggerSource::Manual).await;
        let second = scheduler.trigger(TriggerSource::Heartbeat).await;

        assert!(!first.is_skipped());
        assert!(!second.is_skipped());
        assert_eq!(scheduler.cycles_started(), 2);
        let last = scheduler.last_report().unwrap();
        assert_eq!(last.trigger, TriggerSource::Heartbeat);
        assert_eq!(scheduler.pipeline().store().count().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_releases_the_running_flag() {
        struct Hanging;

        #[async_trait]
        impl SearchApi for Hanging {
            async fn search_page(&self, _token: &str, _request: &PageRequest) -> Result<SearchPage, SearchError> {
                std::future::pending().await
            }
        }

        let scheduler = scheduler_with(
            Arc::new(Hanging),
            FetcherConfig {
                deadline: Some(Duration::from_secs(30)),
                ..fetcher_config(3)
            },
        );

        let outcome = scheduler.trigger(TriggerSource::Heartbeat).await;
        match outcome {
            TriggerOutcome::Ran(report) => {
                assert_eq!(report.termination, issuesync_github::Termination::DeadlineExceeded)
            }
            TriggerOutcome::Skipped => panic!("first trigger must run"),
        }
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!scheduler.trigger(TriggerSource::Heartbeat).await.is_skipped());
    }

    #[tokio::test]
    async fn dropped_cycle_future_releases_the_flag() {
        let gate = Arc::new(Notify::new());
        let scheduler = scheduler_with(Arc::new(GatedSearch { gate }), fetcher_config(1));

        let pending = scheduler.trigger(TriggerSource::Manual);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }
}
