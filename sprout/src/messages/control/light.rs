use crate::devices::hardware::led_panel::LightingPreset;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Light message sent by hand or from another system. Channels left out
/// keep whatever intensity they currently have.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct LightMessage {
    /// Blue intensity in percent.
    #[serde(default)]
    pub blue: Option<u8>,
    /// Red intensity in percent.
    #[serde(default)]
    pub red: Option<u8>,
    /// Far red intensity in percent.
    #[serde(default)]
    pub far_red: Option<u8>,
}

impl LightMessage {
    /// Fill the channels the message leaves out from `current` and check
    /// the result is a valid preset.
    pub fn merge(&self, current: LightingPreset) -> Result<LightingPreset> {
        LightingPreset::new(
            self.blue.unwrap_or(current.blue),
            self.red.unwrap_or(current.red),
            self.far_red.unwrap_or(current.far_red),
        )
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::error::Error;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"blue": 10, "red": 20, "farRed": 30}"#)]
    #[case(r#"{"blue": 0}"#)]
    #[case(r#"{"farRed": 100}"#)]
    #[case(r#"{}"#)]
    fn test_parse_light_message(#[case] raw_string: &str) {
        let _parsed: LightMessage = serde_json::from_str(raw_string).unwrap();
    }

    #[rstest]
    #[case((r#"{"red": 5}"#, LightingPreset { blue: 75, red: 5, far_red: 0 }))]
    #[case((r#"{"farRed": 60, "blue": 1}"#, LightingPreset { blue: 1, red: 75, far_red: 60 }))]
    #[case((r#"{}"#, LightingPreset::WHITE))]
    fn test_merge_keeps_unnamed_channels(#[case] args: (&str, LightingPreset)) {
        let parsed: LightMessage = serde_json::from_str(args.0).unwrap();
        assert_eq!(parsed.merge(LightingPreset::WHITE).unwrap(), args.1);
    }

    #[test]
    fn test_merge_rejects_out_of_range() {
        let message = LightMessage {
            red: Some(150),
            ..Default::default()
        };
        assert!(matches!(
            message.merge(LightingPreset::OFF),
            Err(Error::InvalidIntensity { channel: "red", value: 150 })
        ));
    }
}
