//! rpi2casterd: hardware control daemon for Monotype composition casters
//! and ribbon perforators.
//!
//! Runs on a Raspberry Pi class single-board computer, drives the machine
//! valves over I²C expanders in lockstep with the machine cycle, and
//! exposes a JSON API over HTTP for one or more configured interfaces.

pub mod config;
pub mod daemon;
pub mod externals;
pub mod interface;
pub mod models;
pub mod signals;
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

use crate::config::Configuration;
use crate::daemon::Supervisor;
use crate::externals::gpio::{GpioService, RppalGpioService};
use crate::externals::valves::create_valve_bank;
use crate::interface::Interface;
use crate::web::{router, task_serve_api, ApiState};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_max_level(LevelFilter::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::CONFIGURATION_PATH.to_string());
    let configuration = config::load(&config_path)
        .with_context(|| format!("cannot start: bad configuration in {}", config_path))?;

    let gpio: Arc<dyn GpioService> = match RppalGpioService::new() {
        Ok(gpio) => Arc::new(gpio),
        Err(e) => {
            error!(
                "Not enough privileges to access the GPIO. You have to belong to the \
                 \"gpio\" group or run the daemon as root. Error: {}",
                e
            );
            return Err(e.into());
        }
    };
    let supervisor = Supervisor::new(Arc::clone(&gpio));

    let outcome = run(&configuration, Arc::clone(&gpio), Arc::clone(&supervisor)).await;

    // always release the hardware, whatever brought us down
    supervisor.shutdown_leds();
    gpio.cleanup();
    if let Err(e) = &outcome {
        error!("Daemon exited with an error: {}", e);
    }
    outcome
}

async fn run(
    configuration: &Configuration,
    gpio: Arc<dyn GpioService>,
    supervisor: Arc<Supervisor>,
) -> Result<()> {
    supervisor.setup(&configuration.daemon)?;

    let mut interfaces = HashMap::new();
    for (name, settings) in &configuration.interfaces {
        let valves = create_valve_bank(settings)?;
        let interface =
            Interface::new(name.clone(), settings.clone(), Arc::clone(&gpio), valves)?;
        info!("Configured interface {}: {}.", name, interface.description());
        interfaces.insert(name.clone(), Arc::new(Mutex::new(interface)));
    }
    let interfaces = Arc::new(interfaces);

    let (address, port) = &configuration.daemon.listen_address;
    let listener = TcpListener::bind((address.as_str(), *port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", address, port))?;
    info!("Listening on {}:{}.", address, port);

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let api = router(ApiState { interfaces: Arc::clone(&interfaces) });
    let token_clone = token.clone();
    tracker.spawn(async move { task_serve_api(token_clone, listener, api).await });

    // everything is configured, show the operator we are ready
    supervisor.led("ready", true);

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down.");
        }
        _ = sigterm.recv() => {
            info!("Termination requested, shutting down.");
        }
    }
    token.cancel();
    tracker.close();
    tracker.wait().await;

    // stop every machine before the GPIO goes away
    for (name, interface) in interfaces.iter() {
        if let Err(e) = interface.lock().await.machine_control(Some(false)).await {
            error!("Failed to stop interface {}. Error: {}", name, e);
        }
    }
    Ok(())
}
