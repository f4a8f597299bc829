// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! Application boost policy.
//!
//! Consumes the app monitor's change feed and translates each state into
//! CPU and IO weights for the unit, pushed to the user's service manager
//! instance.

use anyhow::{Context as _, Result};
use slog::{debug, info, Logger};
use tokio::task::JoinHandle;
use zbus::{CacheProperties, Connection};

use crate::config::AppBoostConfig;
use crate::monitor::{AppInfo, AppMonitor};
use crate::pending::PendingCalls;
use crate::systemd::{SystemdManagerProxy, BUS_CALL_TIMEOUT};

/// The weights an application should run with.
///
/// A focused application gets the active weights, everything else the
/// defaults; any boost bit adds the boost increment on top. The configured
/// clamps guarantee the result stays within the valid weight range.
pub fn compute_weights(config: &AppBoostConfig, app: &AppInfo) -> (u64, u64) {
    let mut cpu_weight = if app.is_focused() {
        config.active_cpu_weight
    } else {
        config.default_cpu_weight
    };
    let mut io_weight = if app.is_focused() {
        config.active_io_weight
    } else {
        config.default_io_weight
    };

    if !app.boosted.is_empty() {
        cpu_weight += config.boost_cpu_weight_inc;
        io_weight += config.boost_io_weight_inc;
    }

    (cpu_weight, io_weight)
}

pub struct AppPolicy {
    monitor: AppMonitor,
    pending: PendingCalls,
    task: JoinHandle<()>,
}

impl AppPolicy {
    /// Read the boost configuration and start applying the monitor's
    /// change feed through the given (user) bus connection.
    pub async fn start(
        connection: &Connection,
        monitor: AppMonitor,
        logger: &Logger,
    ) -> Result<Self> {
        let config = AppBoostConfig::load(logger);

        let proxy = SystemdManagerProxy::builder(connection)
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .context("could not create service manager proxy")?;

        let pending = PendingCalls::new();
        let mut events = monitor.subscribe();

        let worker_logger = logger.clone();
        let worker_pending = pending.clone();
        let task = tokio::task::spawn_local(async move {
            while let Some(app) = events.recv().await {
                apply(&proxy, &config, app, &worker_pending, &worker_logger);
            }
        });

        Ok(AppPolicy {
            monitor,
            pending,
            task,
        })
    }

    /// Unwind all boosts, apply the resulting defaults and wait for the
    /// writes to reach the bus.
    pub async fn stop(self) {
        self.monitor.reset_all_apps();
        // Closing the feed lets the worker drain the queued resets and
        // finish.
        self.monitor.close_subscribers();
        let _ = self.task.await;
        self.pending.flush().await;
    }
}

fn apply(
    proxy: &SystemdManagerProxy<'static>,
    config: &AppBoostConfig,
    app: AppInfo,
    pending: &PendingCalls,
    logger: &Logger,
) {
    debug!(logger, "app state changed";
           "app" => %app.name, "timestamp" => app.timestamp,
           "boosted" => app.boosted.bits());

    let (cpu_weight, io_weight) = compute_weights(config, &app);

    info!(logger, "setting application resources";
          "app" => %app.name, "cpu_weight" => cpu_weight, "io_weight" => io_weight);

    let proxy = proxy.clone();
    let logger = logger.clone();
    let guard = pending.guard();

    tokio::task::spawn_local(async move {
        let properties = [
            ("CPUWeight", zbus::zvariant::Value::from(cpu_weight)),
            ("IOWeight", zbus::zvariant::Value::from(io_weight)),
        ];
        let call = proxy.set_unit_properties(&app.name, true, &properties);

        match tokio::time::timeout(BUS_CALL_TIMEOUT, call).await {
            Ok(Ok(())) => {}
            // Expected for units that are already gone again.
            Ok(Err(err)) => {
                debug!(logger, "failed to set resource properties on app";
                       "app" => %app.name, "error" => %err);
            }
            Err(_) => {
                debug!(logger, "timed out setting resource properties on app";
                       "app" => %app.name);
            }
        }

        drop(guard);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::BoostFlags;
    use std::path::PathBuf;

    fn config() -> AppBoostConfig {
        AppBoostConfig {
            default_cpu_weight: 100,
            default_io_weight: 50,
            active_cpu_weight: 300,
            active_io_weight: 200,
            boost_cpu_weight_inc: 150,
            boost_io_weight_inc: 75,
        }
    }

    fn app(timestamp: i64, boosted: BoostFlags) -> AppInfo {
        AppInfo {
            name: "org.example.Editor".to_string(),
            path: PathBuf::from("/sys/fs/cgroup/user.slice/app"),
            cpu_weight: 100,
            io_weight: 100,
            timestamp,
            boosted,
        }
    }

    #[test]
    fn focused_app_gets_active_weights() {
        let (cpu, io) = compute_weights(&config(), &app(-1, BoostFlags::empty()));
        assert_eq!((cpu, io), (300, 200));
    }

    #[test]
    fn unfocused_app_gets_default_weights() {
        let (cpu, io) = compute_weights(&config(), &app(123456, BoostFlags::empty()));
        assert_eq!((cpu, io), (100, 50));
    }

    #[test]
    fn boost_adds_increment_on_top() {
        let (cpu, io) = compute_weights(&config(), &app(-1, BoostFlags::GAME));
        assert_eq!((cpu, io), (450, 275));

        // Several boost bits still add the increment once.
        let (cpu, io) =
            compute_weights(&config(), &app(-1, BoostFlags::GAME | BoostFlags::AUDIO));
        assert_eq!((cpu, io), (450, 275));
    }

    #[test]
    fn boosted_background_app_uses_default_base() {
        let (cpu, io) = compute_weights(&config(), &app(99, BoostFlags::AUDIO));
        assert_eq!((cpu, io), (250, 125));
    }

    #[test]
    fn clamped_config_never_exceeds_weight_range() {
        let config = AppBoostConfig {
            active_cpu_weight: 9000,
            boost_cpu_weight_inc: 1000,
            ..config()
        };

        let (cpu, _) = compute_weights(&config, &app(-1, BoostFlags::GAME));
        assert_eq!(cpu, 10000);
    }
}
