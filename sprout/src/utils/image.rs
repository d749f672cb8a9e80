use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage, ImageOutputFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, io::Cursor};
use strum_macros::{EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Media type of every artifact the kit camera produces.
pub const PNG_MEDIA_TYPE: &str = "image/png";

/// The sensor pads raw captures out to these strides.
const WIDTH_STRIDE: u32 = 32;
const HEIGHT_STRIDE: u32 = 16;

/// Size of a frame in pixels.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Width in x.
    pub width: u32,
    /// Height in y.
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The resolution the sensor actually fills when asked for `self`:
    /// width rounded up to a multiple of 32 and height to a multiple of 16.
    pub fn padded(&self) -> Self {
        Self {
            width: round_up(self.width, WIDTH_STRIDE),
            height: round_up(self.height, HEIGHT_STRIDE),
        }
    }

    /// Number of pixels in the frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn round_up(value: u32, stride: u32) -> u32 {
    match value % stride {
        0 => value,
        rem => value + (stride - rem),
    }
}

/// Colour planes of an RGB frame.
#[derive(EnumString, EnumIter, IntoStaticStr, Copy, Clone, Debug, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    /// Red plane, also the plane that responds to far red illumination.
    Red,
    /// Green plane.
    Green,
    /// Blue plane.
    Blue,
}

impl Channel {
    /// Offset of the channel inside an RGB pixel.
    pub fn index(self) -> usize {
        match self {
            Channel::Red => 0,
            Channel::Green => 1,
            Channel::Blue => 2,
        }
    }
}

/// An owned RGB frame straight off the camera. Consumed once by the
/// processing step, or encoded as is for the plain capture kinds.
#[derive(Clone, Debug)]
pub struct RawFrame {
    /// Pixel samples, 8 bits per channel, RGB packed.
    image: RgbImage,
    /// When the sensor returned the frame.
    captured_at: DateTime<Utc>,
}

impl RawFrame {
    /// Wrap an RGB image captured now.
    pub fn from_rgb(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    /// Build a frame from a packed RGB sample buffer.
    ///
    /// * `resolution`: size of the frame.
    /// * `samples`: `width * height * 3` bytes.
    pub fn from_raw(resolution: Resolution, samples: Vec<u8>) -> Result<Self> {
        let length = samples.len();
        RgbImage::from_raw(resolution.width, resolution.height, samples)
            .map(Self::from_rgb)
            .ok_or_else(|| {
                Error::Processing(format!(
                    "Buffer of {length} bytes does not hold a {resolution} RGB frame"
                ))
            })
    }

    /// Width and height of the frame.
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.image.width(), self.image.height())
    }

    /// Capture time of the frame.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Borrow the pixel data.
    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }

    /// Give up the frame and keep the pixel data.
    pub fn into_rgb(self) -> RgbImage {
        self.image
    }
}

/// Extract one 8 bit plane of an RGB frame as a grayscale image.
///
/// * `frame`: source frame, left untouched.
/// * `channel`: plane to copy out.
pub fn isolate_channel(frame: &RawFrame, channel: Channel) -> GrayImage {
    let rgb = frame.as_rgb();
    let offset = channel.index();
    let plane = rgb.as_raw().chunks_exact(3).map(|px| px[offset]).collect();
    // The plane has exactly one sample per pixel of the source.
    GrayImage::from_raw(rgb.width(), rgb.height(), plane).unwrap_or_default()
}

/// Normalised difference of one pixel pair. A pair that sums to zero has
/// no defined index and reads as 0.
fn normalized_difference(red: u8, nir: u8) -> f32 {
    let sum = f32::from(red) + f32::from(nir);
    if sum == 0.0 {
        0.0
    } else {
        (f32::from(nir) - f32::from(red)) / sum
    }
}

/// Compute the normalised difference vegetation index from a frame lit with
/// red light and a frame lit with far red light, using the red plane of each.
/// The index is stretched so the observed minimum maps to 0 and the maximum
/// to 255. A flat index (every pixel equal, whatever the value) has no range
/// to stretch and comes out as a uniform mid image of 128.
///
/// * `red_frame`: capture under the red preset.
/// * `nir_frame`: capture under the far red preset.
pub fn vegetation_index(red_frame: &RawFrame, nir_frame: &RawFrame) -> Result<GrayImage> {
    let resolution = red_frame.resolution();
    if resolution != nir_frame.resolution() {
        return Err(Error::Processing(format!(
            "Red frame is {resolution} but near infrared frame is {}",
            nir_frame.resolution()
        )));
    }

    let offset = Channel::Red.index();
    let index: Vec<f32> = red_frame
        .as_rgb()
        .as_raw()
        .chunks_exact(3)
        .zip(nir_frame.as_rgb().as_raw().chunks_exact(3))
        .map(|(red, nir)| normalized_difference(red[offset], nir[offset]))
        .collect();

    let (min, max) = index
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });

    let samples = if max > min {
        let scale = 255.0 / (max - min);
        index.iter().map(|v| to_sample((v - min) * scale)).collect()
    } else {
        vec![FLAT_INDEX_SAMPLE; index.len()]
    };

    GrayImage::from_raw(resolution.width, resolution.height, samples).ok_or_else(|| {
        Error::Processing(format!("Could not assemble a {resolution} index image"))
    })
}

/// Sample of every pixel of an index image without range.
const FLAT_INDEX_SAMPLE: u8 = 128;

fn to_sample(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Encode an image to PNG bytes.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageOutputFormat::Png)?;
    Ok(bytes.into_inner())
}

/// The terminal artifact of a capture, owned by the run that produced it
/// until it is handed to a publisher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedImage {
    /// Id of the capture run that produced the image.
    pub run_id: Uuid,
    /// Name of the artifact such as `ndvi.png`.
    pub file_name: String,
    /// Media type of `data`.
    pub media_type: &'static str,
    /// Encoded image bytes.
    pub data: Vec<u8>,
    /// When the (last) frame was captured.
    pub datetime: DateTime<Utc>,
}

impl DerivedImage {
    /// Wrap encoded PNG bytes.
    pub fn png(run_id: Uuid, file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            run_id,
            file_name: file_name.into(),
            media_type: PNG_MEDIA_TYPE,
            data,
            datetime: Utc::now(),
        }
    }

    /// Set the capture time.
    pub fn captured_at(mut self, datetime: DateTime<Utc>) -> Self {
        self.datetime = datetime;
        self
    }

    /// File name used when storing the artifact on disk, prefixed with the
    /// capture time so repeated captures do not overwrite each other.
    pub fn filename(&self) -> String {
        format!(
            "{}_{}",
            self.datetime.format("%Y%m%dT%H%M%S%.3fZ"),
            self.file_name
        )
    }
}
