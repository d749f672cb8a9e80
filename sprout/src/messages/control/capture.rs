use super::light::LightMessage;
use crate::devices::hardware::led_panel::LightingPreset;
use crate::error::{Error, Result};
use crate::utils::image::DerivedImage;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// The kind of image product a capture produces.
#[derive(
    EnumString,
    EnumIter,
    IntoStaticStr,
    Display,
    Deserialize,
    Serialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
pub enum CaptureKind {
    /// Whatever light happens to be there, the LED panel is left alone.
    #[strum(serialize = "uncontrolled")]
    #[serde(rename = "uncontrolled")]
    Uncontrolled,
    /// White balanced light from the blue and red channels.
    #[strum(serialize = "regular")]
    #[serde(rename = "regular")]
    Regular,
    /// Far red light only, the red plane of the frame is kept.
    #[strum(serialize = "nir")]
    #[serde(rename = "nir")]
    NearInfrared,
    /// Derived from a red lit frame and a far red lit frame.
    #[strum(serialize = "ndvi")]
    #[serde(rename = "ndvi")]
    VegetationIndex,
}

impl CaptureKind {
    /// Parse a command string, failing with [`Error::UnknownCommand`].
    pub fn parse(command: &str) -> Result<Self> {
        Self::from_str(command).map_err(|_| Error::UnknownCommand(command.to_string()))
    }

    /// True when the LED panel has to be under control for the capture.
    pub fn requires_lighting(self) -> bool {
        !matches!(self, CaptureKind::Uncontrolled)
    }

    /// Name of the artifact the capture produces.
    pub fn file_name(self) -> String {
        format!("{self}.png")
    }
}

/// Ask the component to capture an image.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq)]
pub struct CaptureMessage {
    /// One of `uncontrolled`, `regular`, `nir`, `ndvi`.
    pub command: String,
}

/// Everything the component accepts on its command port, one JSON object
/// per line.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Take a picture.
    Capture(CaptureMessage),
    /// Set the LED panel.
    Light(LightMessage),
}

/// Reply written back for every control message.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq)]
pub struct ControlResponse {
    /// Whether the request succeeded.
    pub ok: bool,
    /// Artifact name of a successful capture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Media type of a successful capture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Encoded size of a successful capture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    /// Intensities in force after a light message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lighting: Option<LightingPreset>,
    /// Why the request failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    /// Response for a published capture.
    pub fn captured(image: &DerivedImage) -> Self {
        Self {
            ok: true,
            file_name: Some(image.file_name.clone()),
            media_type: Some(image.media_type.to_string()),
            bytes: Some(image.data.len()),
            ..Default::default()
        }
    }

    /// Response for an applied light message.
    pub fn lit(preset: LightingPreset) -> Self {
        Self {
            ok: true,
            lighting: Some(preset),
            ..Default::default()
        }
    }

    /// Response for a failed request.
    pub fn failure(error: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}
