// src/main.rs
//! Fake GPS - relay gpsd fixes or scripted moves into a location sink

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fake_gps::{
    config::{parse_move_step, AppSettings},
    sink::{LogNotifier, LogSink},
    LocationCoordinator, LocationPoint,
};
use std::{sync::Arc, thread, time::Duration};
use tracing::info;

#[derive(Parser)]
#[command(name = "fake-gps", version, about = "Location spoofing driven by gpsd or fly-to moves")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay live fixes from a gpsd daemon until Ctrl+C
    Feed {
        /// gpsd address as host:port (defaults to the saved setting)
        #[arg(long)]
        address: Option<String>,

        /// Directional nudge step in degrees
        #[arg(long)]
        move_step: Option<String>,

        /// Persist the address and step for next time
        #[arg(long)]
        save: bool,
    },
    /// Jump to one coordinate and fly smoothly to another
    Fly {
        /// Start as LAT,LON
        #[arg(long, value_parser = parse_lat_lon, allow_hyphen_values = true)]
        from: LocationPoint,

        /// Target as LAT,LON
        #[arg(long, value_parser = parse_lat_lon, allow_hyphen_values = true)]
        to: LocationPoint,

        /// Number of published steps between start and target
        #[arg(long, default_value_t = 30)]
        steps: u32,

        /// Delay between published steps
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

fn parse_lat_lon(text: &str) -> std::result::Result<LocationPoint, String> {
    let (lat, lon) = text
        .split_once(',')
        .ok_or_else(|| format!("expected LAT,LON, got '{}'", text))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("bad latitude: {}", e))?;
    let lon: f64 = lon.trim().parse().map_err(|e| format!("bad longitude: {}", e))?;
    Ok(LocationPoint::new(lat, lon))
}

/// Jump to `from`, then publish each step of the flight to `to`, one per `interval`
fn fly(
    coordinator: &LocationCoordinator,
    from: LocationPoint,
    to: LocationPoint,
    steps: u32,
    interval: Duration,
) -> fake_gps::Result<LocationPoint> {
    coordinator.jump_to_location(from);
    coordinator.fly_to_location(to, steps)?;

    let mut last = from;
    for step in 0..steps.max(1) {
        if step > 0 {
            thread::sleep(interval);
        }
        last = coordinator.publish_interpolated()?;
    }
    coordinator.stop_fly_mode();
    Ok(last)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Fake GPS v{} starting...", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut settings = AppSettings::load().unwrap_or_default();

    let coordinator = Arc::new(LocationCoordinator::new(
        Arc::new(LogSink),
        Arc::new(LogNotifier),
    ));

    match cli.command {
        Commands::Feed {
            address,
            move_step,
            save,
        } => {
            if let Some(address) = address {
                settings.update_address(&address)?;
            }
            if let Some(step) = move_step {
                settings.move_step = parse_move_step(&step)?;
            }
            if save {
                settings.save().context("Failed to save settings")?;
            }

            coordinator.set_move_step(settings.move_step);
            coordinator
                .start(&settings.address)
                .with_context(|| format!("Could not start feed from {}", settings.address))?;

            info!("Press Ctrl+C to exit");
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(tokio::signal::ctrl_c())?;

            info!("Received Ctrl+C, shutting down...");
            coordinator.stop();
        }
        Commands::Fly {
            from,
            to,
            steps,
            interval_ms,
        } => {
            let arrived = fly(&coordinator, from, to, steps, Duration::from_millis(interval_ms))?;
            info!("Arrived at {}", arrived);
        }
    }

    Ok(())
}
