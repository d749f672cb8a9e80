//! In-memory stand-ins for the kit hardware. Used by the tests and by the
//! `--simulate` mode of the kit camera binary.

use crate::{
    devices::{
        hardware::{
            camera::FrameSource,
            led_panel::{ActuatorCapability, LightingPreset},
        },
        software::{
            publisher::Publisher,
            schedule::{ScheduleEntry, ScheduleSource},
        },
    },
    error::{Error, Result},
    utils::image::{DerivedImage, RawFrame, Resolution},
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use image::{Rgb, RgbImage};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something a mock device did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockEvent {
    /// Intensities written to the panel.
    Lighting(LightingPreset),
    /// A frame was requested from the camera.
    Capture(Option<Resolution>),
}

/// Ordered record of hardware interactions, shared between mocks.
#[derive(Clone, Debug, Default)]
pub struct EventLog(Arc<Mutex<Vec<MockEvent>>>);

impl EventLog {
    pub fn push(&self, event: MockEvent) {
        locked(&self.0).push(event);
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<MockEvent> {
        locked(&self.0).clone()
    }

    /// Only the lighting writes.
    pub fn lighting(&self) -> Vec<LightingPreset> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Lighting(preset) => Some(preset),
                MockEvent::Capture(_) => None,
            })
            .collect()
    }

    /// Number of frames requested.
    pub fn captures(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, MockEvent::Capture(_)))
            .count()
    }
}

/// LED panel that remembers what it was told.
#[derive(Debug)]
pub struct MockLedPanel {
    log: EventLog,
    current: Mutex<LightingPreset>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MockLedPanel {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            current: Mutex::new(LightingPreset::OFF),
            failing: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Intensities the panel is showing.
    pub fn current(&self) -> LightingPreset {
        *locked(&self.current)
    }

    /// Make every following write fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl ActuatorCapability for MockLedPanel {
    fn set_intensities(&self, preset: LightingPreset) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::ActuatorIo("simulated PWM write failure".into()));
        }
        *locked(&self.current) = preset;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.log.push(MockEvent::Lighting(preset));
        Ok(())
    }
}

/// Camera producing a synthetic scene: a plant in the middle of the frame
/// on a soil background. When it can see a [`MockLedPanel`] the plant
/// reflects far red strongly and absorbs red, like real foliage.
pub struct SyntheticCamera {
    log: EventLog,
    resolution: Resolution,
    panel: Option<Arc<MockLedPanel>>,
    exposure: Duration,
    captures: AtomicUsize,
    fail_on: AtomicUsize,
}

impl SyntheticCamera {
    pub fn new(log: EventLog, resolution: Resolution) -> Self {
        Self {
            log,
            resolution,
            panel: None,
            exposure: Duration::ZERO,
            captures: AtomicUsize::new(0),
            fail_on: AtomicUsize::new(0),
        }
    }

    /// Light the scene with whatever `panel` shows.
    pub fn observing(mut self, panel: Arc<MockLedPanel>) -> Self {
        self.panel = Some(panel);
        self
    }

    /// Block for `exposure` on every capture.
    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    /// Fail the `nth` capture, counting from one. Zero disables.
    pub fn fail_on_capture(&self, nth: usize) {
        self.fail_on.store(nth, Ordering::SeqCst);
    }

    /// Number of frames requested so far.
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    fn pixel(&self, lighting: LightingPreset, plant: bool) -> Rgb<u8> {
        let (red, green, blue) = match (plant, lighting) {
            (true, l) if l.far_red > 0 && l.red == 0 => (200, 40, 20),
            (true, l) if l.red > 0 && l.blue == 0 => (40, 20, 10),
            (true, _) => (60, 160, 50),
            (false, _) => (60, 50, 40),
        };
        Rgb([red, green, blue])
    }
}

impl FrameSource for SyntheticCamera {
    fn capture_frame(&self, resolution: Option<Resolution>) -> Result<RawFrame> {
        self.log.push(MockEvent::Capture(resolution));
        let nth = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.exposure.is_zero() {
            std::thread::sleep(self.exposure);
        }
        if nth == self.fail_on.load(Ordering::SeqCst) {
            return Err(Error::Camera(format!("simulated failure on capture {nth}")));
        }

        let size = resolution.unwrap_or(self.resolution);
        let lighting = self
            .panel
            .as_ref()
            .map(|panel| panel.current())
            .unwrap_or(LightingPreset::WHITE);
        let (w, h) = (size.width, size.height);
        let image = RgbImage::from_fn(w, h, |x, y| {
            let plant = x >= w / 4 && x < w * 3 / 4 && y >= h / 4 && y < h * 3 / 4;
            self.pixel(lighting, plant)
        });
        Ok(RawFrame::from_rgb(image))
    }
}

/// Publisher that keeps everything in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    images: Mutex<Vec<DerivedImage>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn images(&self) -> Vec<DerivedImage> {
        locked(&self.images).clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, image: &DerivedImage) -> Result<()> {
        locked(&self.images).push(image.clone());
        Ok(())
    }
}

/// Schedule firing a fixed list of entries at fixed instants.
#[derive(Debug, Default)]
pub struct ScriptedSchedule {
    pending: Vec<(NaiveDateTime, ScheduleEntry)>,
}

impl ScriptedSchedule {
    pub fn new(mut pending: Vec<(NaiveDateTime, ScheduleEntry)>) -> Self {
        pending.sort_by_key(|(at, _)| *at);
        Self { pending }
    }
}

impl ScheduleSource for ScriptedSchedule {
    fn next_due_entries(&mut self, now: NaiveDateTime) -> Vec<ScheduleEntry> {
        let split = self.pending.partition_point(|(at, _)| *at <= now);
        self.pending.drain(..split).map(|(_, entry)| entry).collect()
    }

    fn next_due_time(&self) -> Option<NaiveDateTime> {
        self.pending.first().map(|(at, _)| *at)
    }
}
