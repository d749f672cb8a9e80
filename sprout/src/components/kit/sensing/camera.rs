use super::{
    orchestrator::{CaptureOrchestrator, CaptureSettings},
    trigger::TriggerRouter,
};
use crate::{
    components::kit::actuating::lighting::{ActuatorLease, PeripheralRegistry, SharedActuator},
    devices::{
        hardware::{
            camera::{FrameSource, PiCamera},
            led_panel::{LedPanel, LightingPreset},
        },
        software::{
            publisher::{DirectoryPublisher, Publisher},
            schedule::{DailySchedule, ScheduleEntry},
        },
    },
    error::{Error, Result},
    messages::control::{
        capture::{CaptureMessage, ControlMessage, ControlResponse},
        light::LightMessage,
    },
    utils::mock::{EventLog, MockLedPanel, SyntheticCamera},
};
use chrono::Local;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    codec::{Framed, LinesCodec, LinesCodecError},
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Longest control message accepted on the command port.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// As with all elements in the sprout system, a configuration struct is
/// consumed to create the component, which in turn controls the devices
/// it is composed of.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct KitCameraConfig {
    /// Id of the kit the camera sits in.
    kit_id: u8,
    /// Where to store images on disk.
    image_path: String,
    /// Port the component listens to control messages on.
    port: u16,
    /// Config file of the camera device.
    camera_config_file: PathBuf,
    /// Config file of the LED panel, kits without one only take
    /// uncontrolled captures.
    #[serde(default)]
    led_panel_config_file: Option<PathBuf>,
    /// Captures to take every day.
    #[serde(default)]
    schedule: Vec<ScheduleEntry>,
    #[serde(default)]
    capture: CaptureSettings,
}

impl KitCameraConfig {
    /// Create a new config without LED panel or schedule.
    ///
    /// * `kit_id`: id of the kit.
    /// * `image_path`: parent directory for stored images.
    /// * `port`: control port.
    /// * `camera_config_file`: path to the camera device config.
    pub fn new<F: AsRef<OsStr>>(kit_id: u8, image_path: String, port: u16, camera_config_file: F) -> Self {
        Self {
            kit_id,
            image_path,
            port,
            camera_config_file: (&camera_config_file).into(),
            led_panel_config_file: None,
            schedule: Vec::new(),
            capture: CaptureSettings::default(),
        }
    }

    /// Attach an LED panel to the kit.
    ///
    /// * `filepath`: path to the LED panel device config.
    pub fn add_led_panel_config_file<F: AsRef<OsStr>>(mut self, filepath: F) -> Self {
        self.led_panel_config_file = Some((&filepath).into());
        self
    }

    /// Take a capture every day.
    pub fn add_schedule_entry(mut self, entry: ScheduleEntry) -> Self {
        self.schedule.push(entry);
        self
    }

    /// Replace the capture timing and lease settings.
    pub fn with_capture_settings(mut self, capture: CaptureSettings) -> Self {
        self.capture = capture;
        self
    }

    pub fn kit_id(&self) -> u8 {
        self.kit_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn schedule(&self) -> &[ScheduleEntry] {
        &self.schedule
    }

    pub fn capture(&self) -> &CaptureSettings {
        &self.capture
    }

    /// Directory images of this kit are written to.
    pub fn kit_image_path(&self) -> PathBuf {
        Path::new(&self.image_path).join(self.kit_id.to_string())
    }

    /// Read the component config from a YAML file.
    ///
    /// * `filepath`: path to the kit camera config.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self> {
        let file = Path::new(&filepath);
        let config = config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .build()?;
        Ok(config.try_deserialize::<Self>()?)
    }
}

/// Component grouping the kit camera with the LED panel that lights its
/// field of view. Captures go through a [`TriggerRouter`], the panel is
/// shared with manual light commands through leases.
pub struct KitCamera {
    /// Unique id of the component.
    uuid: Uuid,
    kit_id: u8,
    port: u16,
    /// LED panel, if the kit has one.
    actuator: Option<SharedActuator>,
    router: Arc<TriggerRouter>,
    /// Stops the schedule, the listener and any capture in flight.
    shutdown: CancellationToken,
}

impl KitCamera {
    /// Build the component and its devices from a config. The LED panel
    /// PWM channels are exported and switched off here.
    ///
    /// * `config`: `KitCameraConfig`
    pub fn new(config: KitCameraConfig) -> Result<Self> {
        let camera = PiCamera::from_config_file(&config.camera_config_file)?;
        let actuator = match &config.led_panel_config_file {
            Some(filepath) => {
                let panel = LedPanel::from_config_file(filepath)?;
                panel.initialise()?;
                Some(SharedActuator::new(
                    format!("kit_{}_led_panel", config.kit_id),
                    Arc::new(panel),
                    config.capture.lease_policy,
                ))
            }
            None => None,
        };
        let publisher = DirectoryPublisher::new(config.kit_image_path());
        Ok(Self::with_devices(
            config,
            Arc::new(camera),
            actuator,
            Arc::new(publisher),
        ))
    }

    /// Build the component by reading a config file.
    ///
    /// * `filepath`: path to the config.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self> {
        Self::new(KitCameraConfig::from_file(filepath)?)
    }

    /// Build the component on simulated devices. Nothing on the machine is
    /// touched apart from the image directory.
    pub fn simulated(config: KitCameraConfig) -> Self {
        let log = EventLog::default();
        let panel = Arc::new(MockLedPanel::new(log.clone()));
        let camera = SyntheticCamera::new(log, config.capture.working_resolution)
            .observing(panel.clone());
        let actuator = SharedActuator::new(
            format!("kit_{}_simulated_led_panel", config.kit_id),
            panel,
            config.capture.lease_policy,
        );
        let publisher = DirectoryPublisher::new(config.kit_image_path());
        Self::with_devices(config, Arc::new(camera), Some(actuator), Arc::new(publisher))
    }

    /// Wire the component around devices that have already been set up.
    pub fn with_devices(
        config: KitCameraConfig,
        camera: Arc<dyn FrameSource>,
        actuator: Option<SharedActuator>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let registry = actuator
            .iter()
            .cloned()
            .fold(PeripheralRegistry::new(), PeripheralRegistry::with_actuator);
        let orchestrator =
            CaptureOrchestrator::new(camera, Arc::new(registry), publisher, config.capture)
                .with_shutdown(shutdown.clone());
        let schedule = DailySchedule::new(config.schedule, Local::now().naive_local());
        let router = TriggerRouter::new(Arc::new(orchestrator), Box::new(schedule));

        Self {
            uuid: Uuid::new_v4(),
            kit_id: config.kit_id,
            port: config.port,
            actuator,
            router: Arc::new(router),
            shutdown,
        }
    }

    /// Return the unique id of the component.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn kit_id(&self) -> u8 {
        self.kit_id
    }

    pub fn router(&self) -> &Arc<TriggerRouter> {
        &self.router
    }

    pub fn actuator(&self) -> Option<&SharedActuator> {
        self.actuator.as_ref()
    }

    /// Cancel this token to stop the component.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Set the LED panel by hand. Channels the message leaves out keep
    /// their intensity and the result stays in force after the lease ends.
    pub async fn set_lighting(&self, message: LightMessage) -> Result<LightingPreset> {
        let actuator = self.actuator.as_ref().ok_or(Error::ActuatorUnavailable)?;
        let mut lease = ActuatorLease::acquire(actuator, Uuid::new_v4()).await?;

        let outcome: Result<LightingPreset> = async {
            let preset = message.merge(lease.prior())?;
            lease.apply(preset).await?;
            Ok(preset)
        }
        .await;
        let released = lease.release().await;
        let preset = outcome?;
        released?;
        info!(%preset, "Lighting set by hand");
        Ok(preset)
    }

    /// Act on one control message.
    pub async fn handle_message(&self, message: ControlMessage) -> ControlResponse {
        match message {
            ControlMessage::Capture(CaptureMessage { command }) => {
                match self.router.do_command(&command).await {
                    Ok(image) => ControlResponse::captured(&image),
                    Err(e) => ControlResponse::failure(e),
                }
            }
            ControlMessage::Light(light) => match self.set_lighting(light).await {
                Ok(preset) => ControlResponse::lit(preset),
                Err(e) => ControlResponse::failure(e),
            },
        }
    }
}

/// Unit struct for running the kit camera component.
pub struct KitCameraController;

impl KitCameraController {
    /// Listen on the configured port and run the schedule until the
    /// component's shutdown token is cancelled.
    ///
    /// * `kit_camera`: component to run.
    pub async fn start(kit_camera: KitCamera) -> Result<()> {
        // Bind on every interface so the port is reachable from outside the container.
        let listener = TcpListener::bind(("0.0.0.0", kit_camera.port)).await?;
        Self::serve(kit_camera, listener).await
    }

    /// Same as [`KitCameraController::start`] on an already bound listener.
    pub async fn serve(kit_camera: KitCamera, listener: TcpListener) -> Result<()> {
        let shutdown = kit_camera.shutdown_token();
        info!(
            kit_id = kit_camera.kit_id,
            address = ?listener.local_addr().ok(),
            "Kit camera listening"
        );
        let scheduler = tokio::spawn(kit_camera.router.clone().run(shutdown.clone()));
        let kit_camera = Arc::new(kit_camera);
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        info!(%peer, "Control connection opened");
                        let connection = kit_camera.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(socket, connection).await {
                                warn!(%peer, error = %e, "Control connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                },
            }
        }

        // Captures in flight still hold the lease and restore the panel on exit.
        connections.close();
        connections.wait().await;
        scheduler.await?;
        if let Some(actuator) = kit_camera.actuator() {
            actuator.close();
        }
        info!(kit_id = kit_camera.kit_id, "Kit camera stopped");
        Ok(())
    }
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        other => Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, other)),
    }
}

/// Read newline delimited JSON control messages and answer each with one
/// JSON line, until the peer hangs up or the component shuts down.
///
/// * `socket`: accepted connection.
/// * `kit_camera`: component.
async fn handle_connection(socket: TcpStream, kit_camera: Arc<KitCamera>) -> Result<()> {
    let shutdown = kit_camera.shutdown_token();
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next() => match line {
                Some(line) => line.map_err(codec_error)?,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ControlMessage>(&line) {
            Ok(message) => kit_camera.handle_message(message).await,
            Err(e) => {
                warn!(error = %e, data = %line, "Received a malformed request");
                ControlResponse::failure(Error::from(e))
            }
        };
        lines
            .send(serde_json::to_string(&response)?)
            .await
            .map_err(codec_error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::components::kit::actuating::lighting::LeasePolicy;
    use crate::devices::software::schedule::TimeOfDay;
    use crate::messages::control::capture::CaptureKind;
    use crate::test_file_path;
    use crate::utils::image::Resolution;
    use crate::utils::mock::RecordingPublisher;
    use serial_test::serial;
    use std::{fs::OpenOptions, str::FromStr, time::Duration};

    fn shipped_config() -> KitCameraConfig {
        KitCameraConfig::new(
            0,
            String::from("./images"),
            17700,
            "./config/devices/kit/camera.yaml",
        )
        .add_led_panel_config_file("./config/devices/kit/led_panel.yaml")
        .add_schedule_entry(ScheduleEntry::new(
            TimeOfDay::from_str("07:00").unwrap(),
            CaptureKind::Regular,
        ))
        .add_schedule_entry(ScheduleEntry::new(
            TimeOfDay::from_str("12:00").unwrap(),
            CaptureKind::VegetationIndex,
        ))
        .add_schedule_entry(ScheduleEntry::new(
            TimeOfDay::from_str("18:30").unwrap(),
            CaptureKind::NearInfrared,
        ))
    }

    #[test]
    #[serial]
    fn test_read_shipped_component_config() {
        let config = KitCameraConfig::from_file(test_file_path!(
            "/config/components/kit/kit_camera.yaml"
        ))
        .unwrap();
        assert_eq!(config, shipped_config());
        assert_eq!(config.port(), 17700);
        assert_eq!(config.schedule().len(), 3);
        assert_eq!(config.capture().lighting_settle_ms, 4000);
    }

    #[test]
    #[serial]
    /// Test writing component configurations to a yaml file, and reading
    /// back to a type safe structure.
    fn test_read_write_component_config_to_file() {
        let write_config = shipped_config().with_capture_settings(CaptureSettings {
            lease_policy: LeasePolicy::FailFast,
            lighting_settle_ms: 1500,
            ..CaptureSettings::default()
        });
        let path = std::env::temp_dir().join(format!("kit_camera_{}.yaml", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .expect("Failed to open file");
        serde_yaml::to_writer(file, &write_config).expect("Failed to write yaml");

        let read_config = KitCameraConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(write_config, read_config, "Failed to read write kit camera config");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(matches!(
            KitCameraConfig::from_file("./config/components/kit/missing.yaml"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_build_component_without_led_panel() {
        let config = KitCameraConfig::new(
            3,
            String::from("./images"),
            0,
            "./config/devices/kit/camera.yaml",
        );
        let kit = KitCamera::new(config).unwrap();
        assert_eq!(kit.kit_id(), 3);
        assert!(kit.actuator().is_none());
    }

    #[tokio::test]
    #[cfg_attr(not(feature = "hardware_test"), ignore)]
    async fn test_build_component_on_kit_hardware() {
        let kit = KitCamera::from_config_file(test_file_path!(
            "/config/components/kit/kit_camera.yaml"
        ))
        .unwrap();
        assert!(kit.actuator().is_some());
        kit.router().do_command("regular").await.unwrap();
    }

    fn fast_kit(with_panel: bool) -> (KitCamera, Arc<MockLedPanel>, Arc<RecordingPublisher>) {
        kit_settling_for(with_panel, 20)
    }

    fn kit_settling_for(
        with_panel: bool,
        lighting_settle_ms: u64,
    ) -> (KitCamera, Arc<MockLedPanel>, Arc<RecordingPublisher>) {
        let config = KitCameraConfig::new(0, String::from("./images"), 0, "unused.yaml")
            .with_capture_settings(CaptureSettings {
                uncontrolled_settle_ms: 10,
                lighting_settle_ms,
                working_resolution: Resolution::new(32, 24),
                ..CaptureSettings::default()
            });
        let log = EventLog::default();
        let panel = Arc::new(MockLedPanel::new(log.clone()));
        let camera = SyntheticCamera::new(log, Resolution::new(32, 24)).observing(panel.clone());
        let actuator = with_panel
            .then(|| SharedActuator::new("led_panel", panel.clone(), LeasePolicy::Block));
        let publisher = Arc::new(RecordingPublisher::new());
        let kit = KitCamera::with_devices(config, Arc::new(camera), actuator, publisher.clone());
        (kit, panel, publisher)
    }

    #[tokio::test]
    async fn test_partial_light_message_keeps_other_channels() {
        let (kit, panel, _) = fast_kit(true);

        let first = kit
            .set_lighting(LightMessage { blue: Some(30), red: Some(40), far_red: None })
            .await
            .unwrap();
        assert_eq!(first, LightingPreset { blue: 30, red: 40, far_red: 0 });

        let second = kit
            .set_lighting(LightMessage { far_red: Some(90), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(second, LightingPreset { blue: 30, red: 40, far_red: 90 });
        assert_eq!(panel.current(), second, "Manual lighting should stay in force");

        assert!(matches!(
            kit.set_lighting(LightMessage { red: Some(120), ..Default::default() }).await,
            Err(Error::InvalidIntensity { .. })
        ));
        assert_eq!(panel.current(), second);
        assert!(!kit.actuator().unwrap().is_leased());
    }

    #[tokio::test]
    async fn test_light_message_without_panel() {
        let (kit, _, _) = fast_kit(false);
        let response = kit
            .handle_message(ControlMessage::Light(LightMessage::default()))
            .await;
        assert!(!response.ok);
        assert_eq!(
            response.error.as_deref(),
            Some("No controllable lighting actuator is available")
        );
    }

    async fn request(
        client: &mut Framed<TcpStream, LinesCodec>,
        line: &str,
    ) -> ControlResponse {
        client.send(line).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_control_port_round_trip() {
        let (kit, panel, publisher) = fast_kit(true);
        let shutdown = kit.shutdown_token();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(KitCameraController::serve(kit, listener));

        let socket = TcpStream::connect(address).await.unwrap();
        let mut client = Framed::new(socket, LinesCodec::new());

        let response = request(&mut client, r#"{"type":"light","red":40}"#).await;
        assert!(response.ok);
        assert_eq!(response.lighting, Some(LightingPreset { blue: 0, red: 40, far_red: 0 }));

        let response = request(&mut client, r#"{"type":"capture","command":"regular"}"#).await;
        assert!(response.ok, "{:?}", response.error);
        assert_eq!(response.file_name.as_deref(), Some("regular.png"));
        assert_eq!(response.media_type.as_deref(), Some("image/png"));
        assert_eq!(publisher.images().len(), 1);
        assert_eq!(
            panel.current(),
            LightingPreset { blue: 0, red: 40, far_red: 0 },
            "Capture should hand back the manual lighting"
        );

        let response = request(&mut client, r#"{"type":"capture","command":"flash"}"#).await;
        assert_eq!(response.error.as_deref(), Some("Unknown command: \"flash\""));

        let response = request(&mut client, "not json").await;
        assert!(!response.ok);
        assert!(response.error.unwrap().starts_with("Serialization error"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_the_panel() {
        let (kit, _, _) = fast_kit(true);
        let actuator = kit.actuator().cloned().unwrap();
        let shutdown = kit.shutdown_token();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(KitCameraController::serve(kit, listener));

        shutdown.cancel();
        server.await.unwrap().unwrap();

        assert!(actuator.is_closed());
        assert!(matches!(
            ActuatorLease::acquire(&actuator, Uuid::new_v4()).await,
            Err(Error::ActuatorUnavailable)
        ));
    }

    #[test]
    fn test_shutdown_mid_capture_turns_the_panel_off() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (kit, panel, publisher) = kit_settling_for(true, 60_000);
        let shutdown = kit.shutdown_token();

        rt.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = listener.local_addr().unwrap();
            let server = tokio::spawn(KitCameraController::serve(kit, listener));

            let socket = TcpStream::connect(address).await.unwrap();
            let mut client = Framed::new(socket, LinesCodec::new());
            client
                .send(r#"{"type":"capture","command":"regular"}"#)
                .await
                .unwrap();
            while panel.current() != LightingPreset::WHITE {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            shutdown.cancel();
            tokio::time::timeout(Duration::from_secs(5), server)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(panel.current(), LightingPreset::OFF);

            let reply = client.next().await.unwrap().unwrap();
            let response: ControlResponse = serde_json::from_str(&reply).unwrap();
            assert_eq!(response.error.as_deref(), Some("Capture cancelled by shutdown"));
        });
        drop(rt);

        assert_eq!(panel.current(), LightingPreset::OFF);
        assert!(publisher.images().is_empty());
    }
}
