//
// Copyright (c) The Rvrd Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod config;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{App, Arg};
use config::{Config, LoggingFileRotation, LoggingFmtStyle};
use pickledb::{PickleDb, PickleDbDumpPolicy, SerializationMethod};
use rvr_controller::api::Controller;
use rvr_controller::master::{self, HaConfig};
use rvr_controller::sim::SimProvisioner;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;

fn init_tracing(config: &config::Logging) {
    // Enable logging to a file.
    let file = config.file.enabled.then(|| {
        let file_appender = match config.file.rotation {
            LoggingFileRotation::Never => {
                rolling::never(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Hourly => {
                rolling::hourly(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Daily => {
                rolling::daily(&config.file.dir, &config.file.name)
            }
        };

        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(false)
            .with_thread_ids(config.file.fmt.show_thread_id)
            .with_file(config.file.fmt.show_source)
            .with_line_number(config.file.fmt.show_source)
            .with_ansi(config.file.fmt.colors);
        let layer = match config.file.fmt.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    // Enable logging to stdout.
    let stdout = config.stdout.enabled.then(|| {
        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(config.stdout.fmt.show_thread_id)
            .with_file(config.stdout.fmt.show_source)
            .with_line_number(config.stdout.fmt.show_source)
            .with_ansi(config.stdout.fmt.colors);
        let layer = match config.stdout.fmt.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("rvr_controller=debug".parse().unwrap())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file)
        .with(stdout)
        .init();
}

fn init_db<P: AsRef<Path>>(
    path: P,
) -> Result<PickleDb, pickledb::error::Error> {
    let dump_policy = PickleDbDumpPolicy::AutoDump;
    let serialization_method = SerializationMethod::Bin;
    match path.as_ref().exists() {
        true => PickleDb::load(path, dump_policy, serialization_method),
        false => Ok(PickleDb::new(path, dump_policy, serialization_method)),
    }
}

fn signal_listener() -> mpsc::Receiver<()> {
    let (signal_tx, signal_rx) = mpsc::channel(1);

    tokio::task::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        let mut sigterm = signal(SignalKind::terminate()).unwrap();

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
                let _ = signal_tx.send(()).await;
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                let _ = signal_tx.send(()).await;
            }
        }
    });

    signal_rx
}

fn build_version() -> String {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    match rustc_tools_util::get_version_info!().commit_hash {
        Some(hash) => format!("{VERSION} ({hash})"),
        None => VERSION.to_owned(),
    }
}

fn ha_config(config: &Config) -> HaConfig {
    HaConfig {
        advert_interval: Duration::from_millis(config.ha.advert_interval_ms),
        silence_multiplier: config.ha.silence_multiplier,
        convergence_interval: Duration::from_millis(
            config.ha.convergence_interval_ms,
        ),
        convergence_retries: config.ha.convergence_retries,
        public_cidr: config
            .ha
            .public_cidr
            .parse()
            .expect("invalid public CIDR in configuration"),
    }
}

// Creates the statically configured offerings and networks.
async fn bootstrap(controller: &Controller, config: &Config) {
    let mut offerings = HashMap::new();
    for offering in &config.bootstrap.offerings {
        match controller
            .create_offering(&offering.name, offering.redundant)
            .await
        {
            Ok(id) => {
                offerings.insert(offering.name.clone(), id);
            }
            Err(error) => {
                error!(%error, name = %offering.name, "failed to create offering");
            }
        }
    }

    for network in &config.bootstrap.networks {
        let Some(offering_id) = offerings.get(&network.offering) else {
            error!(name = %network.name, offering = %network.offering,
                "network references an unknown offering");
            continue;
        };

        let cidr = match &network.cidr {
            Some(cidr) => match cidr.parse() {
                Ok(cidr) => Some(cidr),
                Err(error) => {
                    error!(%error, name = %network.name, "invalid guest CIDR");
                    continue;
                }
            },
            None => None,
        };
        let gateway = match &network.gateway {
            Some(gateway) => match gateway.parse() {
                Ok(gateway) => Some(gateway),
                Err(error) => {
                    error!(%error, name = %network.name, "invalid gateway");
                    continue;
                }
            },
            None => None,
        };

        match controller
            .create_network(&network.name, *offering_id, cidr, gateway)
            .await
        {
            Ok(network_id) => {
                info!(network = %network_id, name = %network.name, "network created");
                if network.implement
                    && let Err(error) =
                        controller.implement_network(network_id).await
                {
                    error!(%error, name = %network.name, "failed to implement network");
                }
            }
            Err(error) => {
                error!(%error, name = %network.name, "failed to create network");
            }
        }
    }
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("Redundant virtual router controller")
        .version(build_version().as_str())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    // Read configuration file.
    let config_file = matches.value_of("config");
    let config = Config::load(config_file);

    // Initialize tracing.
    init_tracing(&config.logging);

    // Initialize non-volatile storage.
    let db = init_db(&config.database_path)
        .expect("failed to initialize non-volatile storage");

    // We're ready to go!
    info!("starting up");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(async {
            // Spawn signal listener.
            let mut signal_rx = signal_listener();

            // Spawn the controller over the simulated compute provisioner.
            let ha = ha_config(&config);
            let (heartbeat_tx, heartbeat_rx) = mpsc::channel(64);
            let provisioner = Arc::new(SimProvisioner::new(
                Arc::new(ha.clone()),
                heartbeat_tx,
            ));
            let controller = master::spawn(
                ha,
                provisioner,
                heartbeat_rx,
                Some(Arc::new(Mutex::new(db))),
            );

            // Create statically configured networks.
            bootstrap(&controller, &config).await;

            // Run until asked to stop.
            let _ = signal_rx.recv().await;
        });

    info!("exiting");
}
