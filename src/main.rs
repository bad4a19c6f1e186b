//! `cashbridged` entry point (§5 Concurrency, §6 CLI/exit codes).

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{info, warn};

use cashbridge::app::App;
use cashbridge::bus::RedisBus;
use cashbridge::config::Args;
use cashbridge::dispatcher;
use cashbridge::poll;
use cashbridge::serial;

/// Poll cadence; the original daemon's main loop slept roughly a second
/// between `POLL` calls on each device (§4.E).
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bus = match RedisBus::connect(&args.host, args.port).await {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("could not connect to pub/sub broker at {}:{}: {e}", args.host, args.port);
            std::process::exit(1);
        }
    };
    let mut requests = RedisBus::subscribe_requests(args.host.clone(), args.port);

    let (hopper, validator) = match serial::open(&args.device) {
        Some(port) => {
            let transport = Arc::new(Mutex::new(port));
            App::bring_up_devices(transport).await
        }
        None => (None, None),
    };

    let mut app = App {
        bus,
        hopper,
        validator,
        shutdown: Arc::new(AtomicBool::new(false)),
    };

    info!(
        hopper_available = app.hopper.is_some(),
        validator_available = app.validator.is_some(),
        "cashbridged started"
    );

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Hopper before validator, always in this order (§4.E).
                if let Some(hopper) = app.hopper.as_mut() {
                    if let Err(e) = poll::poll_device(hopper, &app.bus).await {
                        warn!(device = "hopper", error = %e, "poll failed");
                    }
                }
                if let Some(validator) = app.validator.as_mut() {
                    if let Err(e) = poll::poll_device(validator, &app.bus).await {
                        warn!(device = "validator", error = %e, "poll failed");
                    }
                }
            }
            inbound = requests.recv() => {
                let Some(inbound) = inbound else {
                    warn!("request channel closed, shutting down");
                    break;
                };
                let device = match inbound.topic.as_str() {
                    "hopper-request" => app.hopper.as_mut(),
                    "validator-request" => app.validator.as_mut(),
                    _ => None,
                };
                dispatcher::handle_request(inbound, device, &app.bus, &app.shutdown).await;
                if app.is_shutting_down() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                break;
            }
        }
    }

    info!("cashbridged stopped");
}
