// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! uresourced dynamically assigns resource protections and weights to the
//! active graphical user (system mode) and to the applications the user
//! interacts with (user-session mode).

#[cfg(feature = "pipewire")]
mod audio;
mod config;
mod dropin;
mod game;
mod login;
mod manager;
mod monitor;
mod pending;
mod policy;
mod systemd;

use std::path::Path;

use anyhow::{Context as _, Result};
use clap::Parser;
use slog::{debug, o, warn, Drain, Logger};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::SystemConfig;
use crate::login::LoginMonitor;
use crate::manager::{Event, Manager, UResourcedProxy, UResourcedService};
use crate::monitor::AppMonitor;
use crate::policy::AppPolicy;
use crate::systemd::BUS_CALL_TIMEOUT;

#[derive(Debug, Parser)]
#[command(name = "uresourced", disable_version_flag = true)]
struct Args {
    /// Show program version
    #[arg(long)]
    version: bool,

    /// Run user session part
    #[arg(long)]
    user: bool,
}

fn create_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        eprintln!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let logger = create_logger();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not create runtime")?;
    let local = tokio::task::LocalSet::new();

    if args.user {
        runtime.block_on(local.run_until(user_main(logger)))
    } else {
        runtime.block_on(local.run_until(system_main(logger)))
    }
}

/// The system arbiter: owns the bus name, watches login state and assigns
/// per-user allocations.
async fn system_main(logger: Logger) -> Result<()> {
    let total_ram = match cgroup_path::total_system_memory() {
        Ok(total_ram) => {
            debug!(logger, "detected system memory"; "bytes" => total_ram);
            total_ram
        }
        Err(err) => {
            warn!(logger, "could not determine system memory"; "error" => %err);
            0
        }
    };

    let config = SystemConfig::load(Path::new(config::SYSTEM_CONFIG_PATH), total_ram, &logger);
    dropin::write_session_slice_dropin(&config.session_slice, &logger);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let connection = zbus::ConnectionBuilder::system()?
        .serve_at(
            manager::OBJECT_PATH,
            UResourcedService::new(events_tx.clone()),
        )?
        .name(manager::BUS_NAME)?
        .build()
        .await
        .context("could not acquire bus name")?;

    tokio::task::spawn_local(manager::watch_name_lost(
        connection.clone(),
        events_tx.clone(),
        logger.clone(),
    ));

    // The name is owned now, so it is safe to start reconciling; the login
    // monitor emits the initial state right away.
    let (login, mut snapshots) = LoginMonitor::start(&connection, &logger).await?;
    let mut manager = Manager::new(connection, config, logger.clone()).await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            event = events_rx.recv() => match event {
                Some(Event::ForceUpdate) => manager.force_update(),
                Some(Event::Quit) | None => break,
            },
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => manager.apply_snapshot(snapshot),
                None => break,
            },
        }
    }

    debug!(logger, "exiting main loop");
    login.stop();
    manager.stop();
    manager.release_bus().await;
    manager.flush().await;

    Ok(())
}

/// The user-session daemon: monitors the application slice and re-weights
/// applications by focus and boost state.
async fn user_main(logger: Logger) -> Result<()> {
    let uid = nix::unistd::getuid().as_raw();
    let connection = zbus::Connection::session()
        .await
        .context("could not connect to the session bus")?;

    let monitor = AppMonitor::new(uid, &logger)?;
    monitor
        .start()
        .context("could not start application monitor")?;

    let policy = AppPolicy::start(&connection, monitor.clone(), &logger).await?;

    let game = match game::GameMonitor::start(&connection, monitor.clone(), &logger).await {
        Ok(game) => Some(game),
        Err(err) => {
            warn!(logger, "game-mode integration unavailable"; "error" => %err);
            None
        }
    };

    #[cfg(feature = "pipewire")]
    let audio = match audio::AudioMonitor::start(monitor.clone(), &logger) {
        Ok(audio) => Some(audio),
        Err(err) => {
            warn!(logger, "audio graph integration unavailable"; "error" => %err);
            None
        }
    };

    // Our cgroup exists now; let the system daemon re-check so a slow
    // session startup cannot lose the race against login processing.
    request_system_update(&logger).await;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }

    debug!(logger, "exiting main loop");

    #[cfg(feature = "pipewire")]
    if let Some(audio) = audio {
        audio.stop();
    }
    if let Some(game) = game {
        game.stop();
    }
    policy.stop().await;
    monitor.stop();

    Ok(())
}

async fn request_system_update(logger: &Logger) {
    let result: Result<()> = async {
        let connection = zbus::Connection::system().await?;
        let proxy = UResourcedProxy::new(&connection).await?;
        tokio::time::timeout(BUS_CALL_TIMEOUT, proxy.update())
            .await
            .context("timed out")??;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        debug!(logger, "could not request a resource refresh from the system daemon";
               "error" => %err);
    }
}
