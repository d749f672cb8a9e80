use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;
use uuid::Uuid;

/// Intensities of the three LED channels, each a percentage in [0, 100].
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct LightingPreset {
    /// Blue channel.
    pub blue: u8,
    /// Red channel.
    pub red: u8,
    /// Far red channel.
    pub far_red: u8,
}

impl LightingPreset {
    /// Upper bound of a channel intensity.
    pub const MAX_INTENSITY: u8 = 100;
    /// All channels off.
    pub const OFF: Self = Self::new_unchecked(0, 0, 0);
    /// White balanced light for regular photographs.
    pub const WHITE: Self = Self::new_unchecked(75, 75, 0);
    /// Red only, the red half of a vegetation index capture.
    pub const RED: Self = Self::new_unchecked(0, 75, 0);
    /// Far red only, for near infrared captures.
    pub const FAR_RED: Self = Self::new_unchecked(0, 0, 75);

    const fn new_unchecked(blue: u8, red: u8, far_red: u8) -> Self {
        Self { blue, red, far_red }
    }

    /// Create a preset, rejecting intensities above 100.
    pub fn new(blue: u8, red: u8, far_red: u8) -> Result<Self> {
        let preset = Self::new_unchecked(blue, red, far_red);
        preset.validate()?;
        Ok(preset)
    }

    /// Check every channel is within [0, 100].
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("blue", self.blue), ("red", self.red), ("farRed", self.far_red)] {
            if value > Self::MAX_INTENSITY {
                return Err(Error::InvalidIntensity { channel: name, value });
            }
        }
        Ok(())
    }
}

impl Display for LightingPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "blue {}%, red {}%, far red {}%",
            self.blue, self.red, self.far_red
        )
    }
}

/// What a lighting driver has to offer the rest of the system. Calls may
/// touch a bus or the file system and are expected to block, callers run
/// them on a blocking worker.
pub trait ActuatorCapability: Send + Sync {
    /// Set all three channel intensities.
    fn set_intensities(&self, preset: LightingPreset) -> Result<()>;
}

/// Configuration of an LED panel driven from three channels of a
/// sysfs PWM chip, i.e. `/sys/class/pwm/pwmchip0`.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct LedPanelConfig {
    /// Directory of the PWM chip.
    pwm_chip: PathBuf,
    /// PWM channel wired to the blue LEDs.
    blue_channel: u32,
    /// PWM channel wired to the red LEDs.
    red_channel: u32,
    /// PWM channel wired to the far red LEDs.
    far_red_channel: u32,
    /// PWM period in nanoseconds, the duty cycle is a percentage of it.
    period_ns: u64,
}

impl LedPanelConfig {
    /// Create a config with the channels in blue, red, far red order (0, 1, 2).
    ///
    /// * `pwm_chip`: sysfs directory of the chip.
    /// * `period_ns`: PWM period.
    pub fn new<F: AsRef<OsStr>>(pwm_chip: F, period_ns: u64) -> Self {
        Self {
            pwm_chip: (&pwm_chip).into(),
            blue_channel: 0,
            red_channel: 1,
            far_red_channel: 2,
            period_ns,
        }
    }

    /// Set which PWM channels the LED strings are wired to.
    pub fn with_channels(mut self, blue: u32, red: u32, far_red: u32) -> Self {
        self.blue_channel = blue;
        self.red_channel = red;
        self.far_red_channel = far_red;
        self
    }

    /// Read a config from a YAML file.
    ///
    /// * `filepath`: path to the config.
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

/// The LED panel of the kit. Each colour is a PWM channel whose duty cycle
/// is set as a percentage of the period.
pub struct LedPanel {
    /// Unique identifier, helpful for trouble shooting and logging.
    uuid: Uuid,
    /// Wiring and PWM parameters.
    config: LedPanelConfig,
}

impl LedPanel {
    /// Create a new panel by consuming a config. Nothing is written
    /// until [`LedPanel::initialise`] is called.
    pub fn new(config: LedPanelConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            config,
        }
    }

    /// Create a new panel from a config file.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self> {
        Ok(Self::new(LedPanelConfig::from_file(filepath)?))
    }

    /// Return the unique identifier of the panel.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    /// Export the three channels, set their period, switch the LEDs off and
    /// enable the outputs. Blocking.
    pub fn initialise(&self) -> Result<()> {
        for channel in self.channels() {
            let channel_dir = self.channel_dir(channel);
            if !channel_dir.is_dir() {
                fs::write(self.config.pwm_chip.join("export"), channel.to_string())?;
            }
            fs::write(channel_dir.join("period"), self.config.period_ns.to_string())?;
            fs::write(channel_dir.join("duty_cycle"), "0")?;
            fs::write(channel_dir.join("enable"), "1")?;
        }
        debug!(uuid = %self.uuid, chip = ?self.config.pwm_chip, "LED panel initialised");
        Ok(())
    }

    /// Duty cycle in nanoseconds for an intensity percentage.
    fn duty_cycle_ns(&self, intensity: u8) -> u64 {
        self.config.period_ns * u64::from(intensity) / u64::from(LightingPreset::MAX_INTENSITY)
    }

    fn channels(&self) -> [u32; 3] {
        [
            self.config.blue_channel,
            self.config.red_channel,
            self.config.far_red_channel,
        ]
    }

    fn channel_dir(&self, channel: u32) -> PathBuf {
        self.config.pwm_chip.join(format!("pwm{channel}"))
    }
}

impl ActuatorCapability for LedPanel {
    fn set_intensities(&self, preset: LightingPreset) -> Result<()> {
        preset.validate()?;
        let intensities = [preset.blue, preset.red, preset.far_red];
        for (channel, intensity) in self.channels().into_iter().zip(intensities) {
            let path = self.channel_dir(channel).join("duty_cycle");
            fs::write(&path, self.duty_cycle_ns(intensity).to_string()).map_err(|e| {
                Error::ActuatorIo(format!("Failed to write {}: {e}", path.display()))
            })?;
        }
        debug!(uuid = %self.uuid, %preset, "LED panel intensities set");
        Ok(())
    }
}
