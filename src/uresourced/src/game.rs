// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! GameMode boost source.
//!
//! The game-mode daemon announces registered games by PID on the session
//! bus; each registration boosts the cgroup of the owning application unit.

use anyhow::{Context as _, Result};
use futures::StreamExt;
use slog::{debug, Logger};
use tokio::task::JoinHandle;
use zbus::zvariant::ObjectPath;
use zbus::{dbus_proxy, CacheProperties, Connection};

use crate::monitor::{AppMonitor, BoostFlags};

#[dbus_proxy(
    interface = "com.feralinteractive.GameMode",
    default_service = "com.feralinteractive.GameMode",
    default_path = "/com/feralinteractive/GameMode"
)]
trait GameMode {
    #[dbus_proxy(signal)]
    fn game_registered(&self, pid: i32, path: ObjectPath<'_>) -> zbus::Result<()>;

    #[dbus_proxy(signal)]
    fn game_unregistered(&self, pid: i32, path: ObjectPath<'_>) -> zbus::Result<()>;
}

pub struct GameMonitor {
    task: JoinHandle<()>,
}

impl GameMonitor {
    pub async fn start(
        connection: &Connection,
        monitor: AppMonitor,
        logger: &Logger,
    ) -> Result<Self> {
        let proxy = GameModeProxy::builder(connection)
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .context("could not create game-mode proxy")?;

        let mut registered = proxy
            .receive_game_registered()
            .await
            .context("could not subscribe to game registrations")?;
        let mut unregistered = proxy
            .receive_game_unregistered()
            .await
            .context("could not subscribe to game deregistrations")?;

        let logger = logger.clone();
        let task = tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    signal = registered.next() => match signal {
                        Some(signal) => {
                            if let Ok(args) = signal.args() {
                                boost_game(&monitor, args.pid, true, &logger);
                            }
                        }
                        None => break,
                    },
                    signal = unregistered.next() => match signal {
                        Some(signal) => {
                            if let Ok(args) = signal.args() {
                                boost_game(&monitor, args.pid, false, &logger);
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(GameMonitor { task })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

fn boost_game(monitor: &AppMonitor, pid: i32, registered: bool, logger: &Logger) {
    if pid <= 0 {
        return;
    }

    let path = match cgroup_path::unit_leaf_for_pid(pid) {
        Ok(path) => path,
        Err(err) => {
            debug!(logger, "could not resolve cgroup of game";
                   "pid" => pid, "error" => %err);
            return;
        }
    };

    debug!(logger, "game registration changed";
           "pid" => pid, "registered" => registered, "cgroup" => %path.display());
    monitor.set_boost(&path, BoostFlags::GAME, registered);
}
