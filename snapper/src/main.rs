//! Snapper – takes a camera snapshot whenever a trigger arrives over MQTT
//! and reports the result on a status topic.
//!
//! This binary:
//! 1. Reads configuration from the environment (optionally layered over a
//!    `KEY=VALUE` file given as the first argument)
//! 2. Connects to the MQTT broker, retrying until it succeeds
//! 3. Subscribes to the trigger topic and runs one capture job per trigger
//! 4. Publishes a JSON status message for every finished job

mod capture;
mod connection;
mod dispatcher;
mod listener;
mod publisher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use snapper_common::config::Config;

use crate::connection::{qos_level, ConnectionManager};
use crate::dispatcher::JobDispatcher;
use crate::listener::TriggerListener;
use crate::publisher::StatusPublisher;

#[tokio::main]
async fn main() -> Result<()> {
    // ── load config ──────────────────────────────────────────────────
    let config_file = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::from_env(config_file.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    // ── directories + logging ────────────────────────────────────────
    std::fs::create_dir_all(&config.save_dir)
        .with_context(|| format!("Cannot create {}", config.save_dir.display()))?;
    std::fs::create_dir_all(&config.error_dir)
        .with_context(|| format!("Cannot create {}", config.error_dir.display()))?;
    snapper_common::logging::init(&config.log_level, &config.error_log_path())?;

    info!(
        "Snapper starting (mode={}, broker={}:{}, trigger={}, status={})",
        config.mode.as_str(),
        config.mqtt.broker,
        config.mqtt.port,
        config.mqtt.topic_trigger,
        config.mqtt.topic_status,
    );
    if !config.tls_verify {
        warn!("TLS certificate verification is disabled for camera requests");
    }

    // ── ctrl-c ───────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        shutdown_tx.send_replace(true);
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── wire up the pipeline ─────────────────────────────────────────
    let capture = capture::from_config(&config)?;
    let qos = qos_level(config.mqtt.qos);

    let (client, mut event_loop) = connection::mqtt_client(&config.mqtt);
    let manager = ConnectionManager::new(format!("{}:{}", config.mqtt.broker, config.mqtt.port));
    let channel = manager.handle(Arc::new(client));

    let publisher = Arc::new(StatusPublisher::new(
        channel.clone(),
        &config.mqtt.topic_status,
        qos,
    ));
    let dispatcher = JobDispatcher::new(capture, publisher, config.jobs);
    let listener = TriggerListener::new(channel.clone(), &config.mqtt.topic_trigger, qos, dispatcher);

    // ── run until shutdown ───────────────────────────────────────────
    tokio::select! {
        _ = manager.run(&mut event_loop, &listener) => {}
        _ = shutdown_rx.wait_for(|stop| *stop) => {
            info!("Stopping...");
        }
    }

    if channel.is_connected() {
        channel.disconnect().ok();
        // One more turn so the DISCONNECT packet actually leaves.
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            connection::EventSource::next_event(&mut event_loop),
        )
        .await;
    }

    info!("Snapper stopped");
    Ok(())
}
