use crate::error::{Error, Result};
use crate::utils::image::{RawFrame, Resolution};
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::{ffi::OsStr, path::Path, process::Command, str::FromStr};
use strum_macros::{EnumString, IntoStaticStr};
use tracing::debug;
use uuid::Uuid;

/// Anything that can hand back a raw RGB frame. Calls block for the whole
/// exposure and readout, callers run them on a blocking worker.
pub trait FrameSource: Send + Sync {
    /// Capture one frame.
    ///
    /// * `resolution`: size to capture at, `None` for the source's
    ///   configured still resolution.
    fn capture_frame(&self, resolution: Option<Resolution>) -> Result<RawFrame>;
}

/// Camera models the kit knows how to drive.
#[derive(EnumString, IntoStaticStr, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CameraModel {
    /// Raspberry Pi camera module v2 (IMX219), NoIR variant on the kit.
    #[strum(serialize = "piCameraV2")]
    PiCameraV2,
}

fn default_binary() -> String {
    String::from("rpicam-still")
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Configuration of the kit camera.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PiCameraConfig {
    /// Camera model, i.e. `piCameraV2`.
    camera: String,
    /// Resolution of a plain still capture.
    resolution: Resolution,
    /// Still capture program, must support raw `rgb` encoding to stdout.
    #[serde(default = "default_binary")]
    binary: String,
    /// Time the capture program runs the sensor before taking the still.
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

impl PiCameraConfig {
    /// Create a camera config with the default capture program.
    ///
    /// * `camera`: camera model name.
    /// * `resolution`: still resolution.
    pub fn new(camera: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            camera: camera.into(),
            resolution,
            binary: default_binary(),
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Use a different still capture program.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Generates a new camera config from a file.
    ///
    /// * `filepath`: path to config file.
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

/// The kit camera. Frames are taken by running the still capture program
/// with raw RGB output on stdout.
pub struct PiCamera {
    /// Unique identifier, helpful for trouble shooting and logging.
    uuid: Uuid,
    /// Model the config asked for.
    model: CameraModel,
    /// Capture parameters.
    config: PiCameraConfig,
}

impl PiCamera {
    /// Create a camera by consuming a config. Fails with
    /// [`Error::UnknownCamera`] for models the kit cannot drive.
    pub fn new(config: PiCameraConfig) -> Result<Self> {
        let model = CameraModel::from_str(&config.camera)
            .map_err(|_| Error::UnknownCamera(config.camera.clone()))?;
        Ok(Self {
            uuid: Uuid::new_v4(),
            model,
            config,
        })
    }

    /// Create a camera from a config file.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self> {
        Self::new(PiCameraConfig::from_file(filepath)?)
    }

    /// Return the unique identifier of the camera.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    /// Arguments for one raw capture at the padded resolution.
    fn capture_args(&self, padded: Resolution) -> Vec<String> {
        vec![
            String::from("--nopreview"),
            String::from("--timeout"),
            format!("{}ms", self.config.timeout_ms),
            String::from("--width"),
            padded.width.to_string(),
            String::from("--height"),
            padded.height.to_string(),
            String::from("--encoding"),
            String::from("rgb"),
            String::from("--output"),
            String::from("-"),
        ]
    }
}

impl FrameSource for PiCamera {
    fn capture_frame(&self, resolution: Option<Resolution>) -> Result<RawFrame> {
        let requested = resolution.unwrap_or(self.config.resolution);
        let padded = requested.padded();
        let model: &'static str = self.model.into();
        debug!(uuid = %self.uuid, model, %requested, %padded, "Capturing frame");

        let output = Command::new(&self.config.binary)
            .args(self.capture_args(padded))
            .output()
            .map_err(|e| Error::Camera(format!("Failed to run {}: {e}", self.config.binary)))?;

        if !output.status.success() {
            return Err(Error::Camera(format!(
                "{} exited with {}: {}",
                self.config.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        crop_padded(output.stdout, padded, requested)
    }
}

/// The sensor fills a buffer rounded up to its strides, cut the frame back
/// to what was asked for.
///
/// * `samples`: packed RGB samples of the padded frame.
/// * `padded`: resolution the sensor filled.
/// * `requested`: resolution the caller wanted.
pub fn crop_padded(samples: Vec<u8>, padded: Resolution, requested: Resolution) -> Result<RawFrame> {
    let length = samples.len();
    let full = RgbImage::from_raw(padded.width, padded.height, samples).ok_or_else(|| {
        Error::Camera(format!(
            "Capture returned {length} bytes, expected {} for {padded}",
            padded.pixel_count() * 3
        ))
    })?;
    if requested == padded {
        return Ok(RawFrame::from_rgb(full));
    }
    let cropped = imageops::crop_imm(&full, 0, 0, requested.width, requested.height).to_image();
    Ok(RawFrame::from_rgb(cropped))
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::test_file_path;
    use serial_test::serial;

    #[test]
    fn test_unknown_camera_model_is_rejected() {
        let config = PiCameraConfig::new("webcam", Resolution::new(640, 480));
        assert!(matches!(PiCamera::new(config), Err(Error::UnknownCamera(m)) if m == "webcam"));
    }

    #[test]
    fn test_capture_args_request_padded_raw_rgb() {
        let camera = PiCamera::new(PiCameraConfig::new("piCameraV2", Resolution::new(1640, 1232)))
            .unwrap();
        let args = camera.capture_args(Resolution::new(1640, 1232).padded());
        let joined = args.join(" ");
        assert!(joined.contains("--width 1664 --height 1232"));
        assert!(joined.contains("--encoding rgb --output -"));
    }

    #[test]
    fn test_crop_padded_keeps_top_left_region() {
        let requested = Resolution::new(3, 2);
        let padded = requested.padded();
        let samples: Vec<u8> = (0..padded.pixel_count() * 3).map(|i| (i % 251) as u8).collect();
        let frame = crop_padded(samples.clone(), padded, requested).unwrap();
        assert_eq!(frame.resolution(), requested);
        // Second row starts one padded row into the buffer.
        let row_stride = padded.width as usize * 3;
        assert_eq!(frame.as_rgb().get_pixel(0, 1).0[0], samples[row_stride]);
        assert_eq!(frame.as_rgb().get_pixel(2, 0).0[2], samples[8]);
    }

    #[test]
    fn test_crop_padded_rejects_short_capture() {
        let requested = Resolution::new(32, 16);
        assert!(matches!(
            crop_padded(vec![0; 10], requested, requested),
            Err(Error::Camera(_))
        ));
    }

    #[test]
    fn test_capture_with_missing_binary_is_camera_error() {
        let config = PiCameraConfig::new("piCameraV2", Resolution::new(64, 48))
            .with_binary("/nonexistent/rpicam-still");
        let camera = PiCamera::new(config).unwrap();
        assert!(matches!(camera.capture_frame(None), Err(Error::Camera(_))));
    }

    #[test]
    #[serial]
    fn test_shipped_camera_config_parses() {
        let file = test_file_path!("/config/devices/kit/camera.yaml");
        let config = PiCameraConfig::from_file(file).unwrap();
        assert_eq!(config.resolution, Resolution::new(1640, 1232));
        assert_eq!(config.binary, "rpicam-still");
        assert!(PiCamera::new(config).is_ok());
    }

    #[cfg_attr(not(feature = "hardware_test"), ignore)]
    #[test]
    #[serial]
    /// Take a frame on a real kit at the working resolution.
    fn test_camera_capture_on_kit() {
        let file = test_file_path!("/config/devices/kit/camera.yaml");
        let camera = PiCamera::from_config_file(file).unwrap();
        let frame = camera
            .capture_frame(Some(Resolution::new(1640, 1232)))
            .unwrap();
        assert_eq!(frame.resolution(), Resolution::new(1640, 1232));
    }
}
