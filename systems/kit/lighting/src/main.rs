//! Kit lighting bench binary, sets the LED panel once.
use clap::Parser;
use sprout::{
    components::prelude::*, devices::hardware::led_panel::{LedPanel, LightingPreset},
    messages::control::light::LightMessage,
};
use std::{sync::Arc, time::Duration};
use tracing::info;
use uuid::Uuid;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the LED panel device.
    #[arg(short, long)]
    filepath: String,
    /// Blue intensity in percent.
    #[arg(long)]
    blue: Option<u8>,
    /// Red intensity in percent.
    #[arg(long)]
    red: Option<u8>,
    /// Far red intensity in percent.
    #[arg(long)]
    far_red: Option<u8>,
    /// Hold the setting for this many seconds, then switch the panel back.
    #[arg(long)]
    hold_secs: Option<u64>,
    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> sprout::Result<()> {
    let args = Args::parse();
    sprout::logging::init(&args.log_level);

    let panel = LedPanel::from_config_file(&args.filepath)?;
    panel.initialise()?;
    let actuator = SharedActuator::new("led_panel", Arc::new(panel), LeasePolicy::FailFast);

    let message = LightMessage {
        blue: args.blue,
        red: args.red,
        far_red: args.far_red,
    };
    // Channels left out stay off, initialise has just switched them off.
    let preset = message.merge(LightingPreset::OFF)?;
    let mut lease = ActuatorLease::acquire(&actuator, Uuid::new_v4())
        .await?
        .with_reset_on_exit(args.hold_secs.is_some());
    lease.apply(preset).await?;
    info!(%preset, "Lighting set");

    if let Some(secs) = args.hold_secs {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
    lease.release().await
}
