use super::orchestrator::{CaptureKind, CaptureOrchestrator};
use crate::{
    devices::software::schedule::ScheduleSource,
    error::Result,
    utils::image::DerivedImage,
};
use chrono::{DateTime, Local, Utc};
use ringbuffer::{AllocRingBuffer, RingBuffer};
use serde::Serialize;
use static_assertions::assert_impl_all;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use strum_macros::{Display, IntoStaticStr};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

/// Who asked for a capture.
#[derive(Display, IntoStaticStr, Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerSource {
    /// An explicit request, from the command listener or the CLI.
    Command,
    /// A due schedule entry.
    Schedule,
}

/// Outcome of one dispatched capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureRecord {
    pub kind: CaptureKind,
    pub source: TriggerSource,
    pub started: DateTime<Utc>,
    /// Stored file name on success, error text on failure.
    pub outcome: std::result::Result<String, String>,
}

fn locked<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Front door of the capture subsystem. Explicit commands and the daily
/// schedule both end up in [`TriggerRouter::dispatch_from`], which lets
/// one orchestrator run at a time through, in arrival order.
pub struct TriggerRouter {
    orchestrator: Arc<CaptureOrchestrator>,
    /// Single run slot, tokio's mutex queues waiters fairly.
    slot: tokio::sync::Mutex<()>,
    schedule: Mutex<Box<dyn ScheduleSource>>,
    history: Mutex<AllocRingBuffer<CaptureRecord>>,
    /// Longest the schedule loop sleeps before looking at the clock again.
    idle_ceiling: Duration,
}

assert_impl_all!(TriggerRouter: Send, Sync);

impl TriggerRouter {
    /// Number of capture outcomes kept.
    pub const HISTORY_LEN: usize = 64;

    /// Create a router around `orchestrator` firing `schedule`.
    pub fn new(orchestrator: Arc<CaptureOrchestrator>, schedule: Box<dyn ScheduleSource>) -> Self {
        Self {
            orchestrator,
            slot: tokio::sync::Mutex::new(()),
            schedule: Mutex::new(schedule),
            history: Mutex::new(AllocRingBuffer::new(Self::HISTORY_LEN)),
            idle_ceiling: Duration::from_secs(60),
        }
    }

    /// Cap the time the schedule loop sleeps, so wall clock jumps are
    /// noticed.
    pub fn with_idle_ceiling(mut self, idle_ceiling: Duration) -> Self {
        self.idle_ceiling = idle_ceiling;
        self
    }

    pub fn orchestrator(&self) -> &Arc<CaptureOrchestrator> {
        &self.orchestrator
    }

    /// Run the capture named by `command`, one of `uncontrolled`,
    /// `regular`, `nir` or `ndvi`.
    pub async fn do_command(&self, command: &str) -> Result<DerivedImage> {
        let kind = CaptureKind::parse(command)?;
        self.dispatch_from(kind, TriggerSource::Command).await
    }

    /// Run an explicitly requested capture.
    pub async fn dispatch(&self, kind: CaptureKind) -> Result<DerivedImage> {
        self.dispatch_from(kind, TriggerSource::Command).await
    }

    /// Wait for the run slot, then run the capture and record the outcome.
    pub async fn dispatch_from(&self, kind: CaptureKind, source: TriggerSource) -> Result<DerivedImage> {
        let _slot = self.slot.lock().await;
        let started = Utc::now();
        info!(%kind, %source, "Dispatching capture");

        let result = self.orchestrator.capture(kind).await;
        let outcome = match &result {
            Ok(image) => Ok(image.filename()),
            Err(e) => Err(e.to_string()),
        };
        locked(&self.history).push(CaptureRecord {
            kind,
            source,
            started,
            outcome,
        });
        result
    }

    /// Most recent capture outcomes, oldest first.
    pub fn history(&self) -> Vec<CaptureRecord> {
        locked(&self.history).to_vec()
    }

    /// Fire schedule entries as they fall due until `shutdown` is
    /// cancelled. Due captures queue on the run slot like explicit ones.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Schedule loop started");
        let dispatches = TaskTracker::new();
        loop {
            let now = Local::now().naive_local();
            let (due, next) = {
                let mut schedule = locked(&self.schedule);
                (schedule.next_due_entries(now), schedule.next_due_time())
            };

            // One task per batch keeps entries due together in schedule order.
            if !due.is_empty() {
                let router = self.clone();
                dispatches.spawn(async move {
                    for entry in due {
                        info!(time = %entry.time, kind = %entry.command, "Scheduled capture due");
                        if let Err(e) = router
                            .dispatch_from(entry.command, TriggerSource::Schedule)
                            .await
                        {
                            warn!(kind = %entry.command, error = %e, "Scheduled capture failed");
                        }
                    }
                });
            }

            let idle = next
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(self.idle_ceiling)
                .min(self.idle_ceiling);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
        dispatches.close();
        dispatches.wait().await;
        info!("Schedule loop stopped");
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::components::kit::actuating::lighting::{
        LeasePolicy, PeripheralRegistry, SharedActuator,
    };
    use crate::components::kit::sensing::orchestrator::CaptureSettings;
    use crate::devices::hardware::led_panel::LightingPreset;
    use crate::devices::software::schedule::{ScheduleEntry, TimeOfDay};
    use crate::error::Error;
    use crate::utils::image::Resolution;
    use crate::utils::mock::{
        EventLog, MockEvent, MockLedPanel, RecordingPublisher, ScriptedSchedule, SyntheticCamera,
    };
    use chrono::Duration as ChronoDuration;
    use tokio::time::Instant;

    const WORKING: Resolution = Resolution::new(64, 48);

    fn router(with_panel: bool, schedule: Box<dyn ScheduleSource>) -> (Arc<TriggerRouter>, EventLog) {
        let settings = CaptureSettings {
            working_resolution: WORKING,
            ..CaptureSettings::default()
        };
        router_with(with_panel, settings, Duration::ZERO, schedule)
    }

    fn router_with(
        with_panel: bool,
        settings: CaptureSettings,
        exposure: Duration,
        schedule: Box<dyn ScheduleSource>,
    ) -> (Arc<TriggerRouter>, EventLog) {
        let log = EventLog::default();
        let panel = Arc::new(MockLedPanel::new(log.clone()));
        let camera = SyntheticCamera::new(log.clone(), Resolution::new(32, 24))
            .with_exposure(exposure)
            .observing(panel.clone());
        let mut registry = PeripheralRegistry::new();
        if with_panel {
            registry = registry.with_actuator(SharedActuator::new("led_panel", panel, LeasePolicy::Block));
        }
        let orchestrator = CaptureOrchestrator::new(
            Arc::new(camera),
            Arc::new(registry),
            Arc::new(RecordingPublisher::new()),
            settings,
        );
        (Arc::new(TriggerRouter::new(Arc::new(orchestrator), schedule)), log)
    }

    fn idle_router() -> (Arc<TriggerRouter>, EventLog) {
        router(true, Box::new(ScriptedSchedule::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_regular_captures_do_not_interleave() {
        let (router, log) = idle_router();
        let first = tokio::spawn({
            let router = router.clone();
            async move { router.dispatch(CaptureKind::Regular).await }
        });
        let second = tokio::spawn({
            let router = router.clone();
            async move { router.dispatch(CaptureKind::Regular).await }
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let run = [
            MockEvent::Lighting(LightingPreset::WHITE),
            MockEvent::Capture(None),
            MockEvent::Lighting(LightingPreset::OFF),
        ];
        assert_eq!(log.events(), [run, run].concat());
        assert_eq!(log.captures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncontrolled_captures_queue_on_the_slot() {
        let (router, log) = idle_router();
        let start = Instant::now();

        let (a, b) = tokio::join!(
            router.dispatch(CaptureKind::Uncontrolled),
            router.dispatch(CaptureKind::Uncontrolled)
        );
        a.unwrap();
        b.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(4000));
        assert_eq!(log.captures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_dispatches_run_in_arrival_order() {
        let (router, log) = idle_router();
        let handles: Vec<_> = [
            CaptureKind::VegetationIndex,
            CaptureKind::Uncontrolled,
            CaptureKind::Regular,
        ]
        .into_iter()
        .map(|kind| {
            let router = router.clone();
            tokio::spawn(async move { router.dispatch(kind).await })
        })
        .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(
            log.events(),
            vec![
                MockEvent::Lighting(LightingPreset::RED),
                MockEvent::Capture(Some(WORKING)),
                MockEvent::Lighting(LightingPreset::FAR_RED),
                MockEvent::Capture(Some(WORKING)),
                MockEvent::Lighting(LightingPreset::OFF),
                MockEvent::Capture(None),
                MockEvent::Lighting(LightingPreset::WHITE),
                MockEvent::Capture(None),
                MockEvent::Lighting(LightingPreset::OFF),
            ]
        );
        let kinds: Vec<_> = router.history().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CaptureKind::VegetationIndex,
                CaptureKind::Uncontrolled,
                CaptureKind::Regular
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (router, log) = idle_router();
        let result = router.do_command("flash").await;
        assert!(matches!(result, Err(Error::UnknownCommand(c)) if c == "flash"));
        assert!(log.events().is_empty());
        assert!(router.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_do_command_records_outcomes() {
        let (router, _log) = router(false, Box::new(ScriptedSchedule::default()));

        let image = router.do_command("uncontrolled").await.unwrap();
        assert!(router.do_command("nir").await.is_err());

        let history = router.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, Ok(image.filename()));
        assert_eq!(history[0].source, TriggerSource::Command);
        assert_eq!(history[1].kind, CaptureKind::NearInfrared);
        assert!(
            matches!(&history[1].outcome, Err(e) if e.starts_with("Incompatible configuration"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fires_due_entries_until_cancelled() {
        let now = Local::now().naive_local();
        let schedule = ScriptedSchedule::new(vec![
            (
                now - ChronoDuration::seconds(1),
                ScheduleEntry::new(TimeOfDay(now.time()), CaptureKind::Uncontrolled),
            ),
            (
                now + ChronoDuration::days(1),
                ScheduleEntry::new(TimeOfDay(now.time()), CaptureKind::Regular),
            ),
        ]);
        let (router, log) = router(true, Box::new(schedule));
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(router.clone().run(shutdown.clone()));

        for _ in 0..10_000 {
            if !router.history().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        shutdown.cancel();
        loop_handle.await.unwrap();

        let history = router.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, CaptureKind::Uncontrolled);
        assert_eq!(history[0].source, TriggerSource::Schedule);
        assert!(history[0].outcome.is_ok());
        assert_eq!(log.events(), vec![MockEvent::Capture(None)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_dispatches_entries_due_together_in_schedule_order() {
        let now = Local::now().naive_local();
        let due = now - ChronoDuration::seconds(1);
        let kinds = [
            CaptureKind::Regular,
            CaptureKind::Uncontrolled,
            CaptureKind::VegetationIndex,
            CaptureKind::NearInfrared,
            CaptureKind::Regular,
        ];
        let schedule = ScriptedSchedule::new(
            kinds
                .iter()
                .map(|kind| (due, ScheduleEntry::new(TimeOfDay(due.time()), *kind)))
                .collect(),
        );
        let settings = CaptureSettings {
            uncontrolled_settle_ms: 1,
            lighting_settle_ms: 1,
            working_resolution: WORKING,
            ..CaptureSettings::default()
        };
        let (router, _log) =
            router_with(true, settings, Duration::from_millis(2), Box::new(schedule));
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(router.clone().run(shutdown.clone()));

        for _ in 0..500 {
            if router.history().len() == kinds.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        loop_handle.await.unwrap();

        let fired: Vec<_> = router.history().iter().map(|r| r.kind).collect();
        assert_eq!(fired, kinds);
        assert!(router.history().iter().all(|r| r.outcome.is_ok()));
    }
}
