//! Kit camera system binary
use clap::Parser;
use sprout::components::prelude::*;
use tracing::info;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Kit Camera Component.
    #[arg(short, long)]
    filepath: String,
    /// Run on a simulated camera and LED panel.
    #[arg(long)]
    simulate: bool,
    /// Take one capture (uncontrolled, regular, nir or ndvi) and exit.
    #[arg(short, long)]
    command: Option<String>,
    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> sprout::Result<()> {
    let args = Args::parse();
    sprout::logging::init(&args.log_level);

    let config = KitCameraConfig::from_file(&args.filepath)?;
    let component = if args.simulate {
        KitCamera::simulated(config)
    } else {
        KitCamera::new(config)?
    };

    if let Some(command) = args.command {
        let image = component.router().do_command(&command).await?;
        info!(file = %image.filename(), "Capture stored");
        return Ok(());
    }

    let shutdown = component.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.cancel();
        }
    });
    KitCameraController::start(component).await
}
