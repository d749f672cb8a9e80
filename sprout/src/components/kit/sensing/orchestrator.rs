use crate::{
    components::kit::actuating::lighting::{ActuatorLease, ActuatorRegistry, LeasePolicy},
    devices::{
        hardware::{camera::FrameSource, led_panel::LightingPreset},
        software::publisher::Publisher,
    },
    error::{Error, Result},
    utils::image::{
        encode_png, isolate_channel, vegetation_index, Channel, DerivedImage, RawFrame,
        Resolution,
    },
};
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use strum_macros::{Display, IntoStaticStr};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use crate::messages::control::capture::CaptureKind;

/// Timing and lease behaviour of capture runs.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureSettings {
    /// Wait before an uncontrolled capture.
    pub uncontrolled_settle_ms: u64,
    /// Wait after every lighting change.
    pub lighting_settle_ms: u64,
    /// Put the panel back the way the lease found it.
    pub reset_on_exit: bool,
    /// Contention policy of the LED panel.
    pub lease_policy: LeasePolicy,
    /// Native sensor mode used for near infrared and index captures.
    pub working_resolution: Resolution,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            uncontrolled_settle_ms: 2000,
            lighting_settle_ms: 4000,
            reset_on_exit: true,
            lease_policy: LeasePolicy::Block,
            working_resolution: Resolution::new(1640, 1232),
        }
    }
}

impl CaptureSettings {
    pub fn uncontrolled_settle(&self) -> Duration {
        Duration::from_millis(self.uncontrolled_settle_ms)
    }

    pub fn lighting_settle(&self) -> Duration {
        Duration::from_millis(self.lighting_settle_ms)
    }
}

/// Where a capture run is in its sequence.
#[derive(Display, IntoStaticStr, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    LeaseAcquisition,
    Illuminating,
    Settling,
    Capturing,
    Processing,
    Publishing,
    Done,
    Errored,
}

/// Frames and encoded bytes a lit sequence leaves behind.
enum Exposure {
    /// Already encoded under the lease.
    Encoded(Vec<u8>, DateTime<Utc>),
    /// Red and far red lit frames still to be combined.
    Pair { red: RawFrame, nir: RawFrame },
}

/// Turns a [`CaptureKind`] into lighting changes, settle waits, frame
/// captures and pixel work, then publishes the result.
pub struct CaptureOrchestrator {
    uuid: Uuid,
    camera: Arc<dyn FrameSource>,
    registry: Arc<dyn ActuatorRegistry>,
    publisher: Arc<dyn Publisher>,
    settings: CaptureSettings,
    shutdown: CancellationToken,
    state: watch::Sender<CaptureState>,
}

impl CaptureOrchestrator {
    /// Wire an orchestrator to its collaborators.
    ///
    /// * `camera`: frame source.
    /// * `registry`: where to look for the LED panel.
    /// * `publisher`: receives every finished image.
    /// * `settings`: timing and lease behaviour.
    pub fn new(
        camera: Arc<dyn FrameSource>,
        registry: Arc<dyn ActuatorRegistry>,
        publisher: Arc<dyn Publisher>,
        settings: CaptureSettings,
    ) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        Self {
            uuid: Uuid::new_v4(),
            camera,
            registry,
            publisher,
            settings,
            shutdown: CancellationToken::new(),
            state,
        }
    }

    /// Abort runs at their next wait once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Return the unique id of the orchestrator.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// State of the latest run.
    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    /// Run one capture end to end and publish its image. Whatever happens,
    /// a lease taken by the run is released before this returns.
    pub async fn capture(&self, kind: CaptureKind) -> Result<DerivedImage> {
        let run_id = Uuid::new_v4();
        let span = info_span!("capture", %run_id, %kind);
        async move {
            self.set_state(CaptureState::Idle);
            match self.run(kind, run_id).await {
                Ok(image) => {
                    self.set_state(CaptureState::Done);
                    info!(file_name = %image.file_name, bytes = image.data.len(), "Capture done");
                    Ok(image)
                }
                Err(e) => {
                    self.set_state(CaptureState::Errored);
                    warn!(error = %e, hardware = e.is_hardware(), "Capture failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn set_state(&self, state: CaptureState) {
        debug!(%state, "Capture state");
        self.state.send_replace(state);
    }

    async fn run(&self, kind: CaptureKind, run_id: Uuid) -> Result<DerivedImage> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (data, captured_at) = if kind.requires_lighting() {
            let actuator = self.registry.find_controllable_actuator().ok_or_else(|| {
                Error::IncompatibleConfiguration(format!(
                    "{kind} capture requires a controllable LED panel"
                ))
            })?;

            self.set_state(CaptureState::LeaseAcquisition);
            let lease = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                lease = ActuatorLease::acquire(&actuator, run_id) => lease?,
            };
            let mut lease = lease.with_reset_on_exit(self.settings.reset_on_exit);

            let outcome = self.lit_sequence(kind, &mut lease).await;
            let released = lease.release().await;
            let exposure = outcome?;
            released?;

            match exposure {
                Exposure::Encoded(data, captured_at) => (data, captured_at),
                Exposure::Pair { red, nir } => {
                    self.set_state(CaptureState::Processing);
                    let captured_at = nir.captured_at();
                    let data = offload(move || {
                        let index = vegetation_index(&red, &nir)?;
                        encode_png(&DynamicImage::ImageLuma8(index))
                    })
                    .await?;
                    (data, captured_at)
                }
            }
        } else {
            self.settle(self.settings.uncontrolled_settle()).await?;
            let frame = self.capture_frame(None).await?;
            self.set_state(CaptureState::Processing);
            let captured_at = frame.captured_at();
            let data = offload(move || encode_png(&DynamicImage::ImageRgb8(frame.into_rgb()))).await?;
            (data, captured_at)
        };

        let image = DerivedImage::png(run_id, kind.file_name(), data).captured_at(captured_at);
        self.set_state(CaptureState::Publishing);
        self.publisher.publish(&image).await?;
        Ok(image)
    }

    /// Everything that has to happen while the lease is held.
    async fn lit_sequence(&self, kind: CaptureKind, lease: &mut ActuatorLease) -> Result<Exposure> {
        let working = self.settings.working_resolution;
        match kind {
            CaptureKind::Regular => {
                self.illuminate(lease, LightingPreset::WHITE).await?;
                let frame = self.capture_frame(None).await?;
                self.set_state(CaptureState::Processing);
                let captured_at = frame.captured_at();
                let data =
                    offload(move || encode_png(&DynamicImage::ImageRgb8(frame.into_rgb()))).await?;
                Ok(Exposure::Encoded(data, captured_at))
            }
            CaptureKind::NearInfrared => {
                self.illuminate(lease, LightingPreset::FAR_RED).await?;
                let frame = self.capture_frame(Some(working)).await?;
                self.set_state(CaptureState::Processing);
                let captured_at = frame.captured_at();
                let data = offload(move || {
                    encode_png(&DynamicImage::ImageLuma8(isolate_channel(&frame, Channel::Red)))
                })
                .await?;
                Ok(Exposure::Encoded(data, captured_at))
            }
            CaptureKind::VegetationIndex => {
                self.illuminate(lease, LightingPreset::RED).await?;
                let red = self.capture_frame(Some(working)).await?;
                self.illuminate(lease, LightingPreset::FAR_RED).await?;
                let nir = self.capture_frame(Some(working)).await?;
                Ok(Exposure::Pair { red, nir })
            }
            CaptureKind::Uncontrolled => Err(Error::IncompatibleConfiguration(
                "uncontrolled captures do not take the LED panel".into(),
            )),
        }
    }

    /// Apply `preset` and wait for the light to settle.
    async fn illuminate(&self, lease: &mut ActuatorLease, preset: LightingPreset) -> Result<()> {
        self.set_state(CaptureState::Illuminating);
        lease.apply(preset).await?;
        self.settle(self.settings.lighting_settle()).await
    }

    async fn settle(&self, delay: Duration) -> Result<()> {
        self.set_state(CaptureState::Settling);
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn capture_frame(&self, resolution: Option<Resolution>) -> Result<RawFrame> {
        self.set_state(CaptureState::Capturing);
        let camera = self.camera.clone();
        offload(move || camera.capture_frame(resolution)).await
    }
}

/// Run blocking hardware or pixel work off the async threads.
async fn offload<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}
