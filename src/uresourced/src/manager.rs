// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! The system resource arbiter.
//!
//! Turns login snapshots into resource allocations on `user.slice`, the
//! per-user slices and the per-user service manager instances, applied
//! through asynchronous `SetUnitProperties` calls.

use anyhow::{Context as _, Result};
use futures::StreamExt;
use slog::{debug, info, warn, Logger};
use tokio::sync::mpsc;
use zbus::{dbus_interface, dbus_proxy, CacheProperties, Connection};

use crate::config::SystemConfig;
use crate::login::LoginSnapshot;
use crate::pending::PendingCalls;
use crate::systemd::{weight_display, Allocation, SystemdManagerProxy, BUS_CALL_TIMEOUT};

pub const BUS_NAME: &str = "org.freedesktop.UResourced";
pub const OBJECT_PATH: &str = "/org/freedesktop/UResourced";

/// Out-of-band events feeding the arbiter's main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Reapply every allocation, requested over the bus.
    ForceUpdate,
    /// The bus name was lost; shut down.
    Quit,
}

/// The bus object other processes poke to force a reapplication. The user
/// daemon does so once at session startup to close the race between login
/// and cgroup creation.
pub struct UResourcedService {
    events: mpsc::UnboundedSender<Event>,
}

impl UResourcedService {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        UResourcedService { events }
    }
}

#[dbus_interface(name = "org.freedesktop.UResourced")]
impl UResourcedService {
    fn update(&self) {
        let _ = self.events.send(Event::ForceUpdate);
    }
}

#[dbus_proxy(
    interface = "org.freedesktop.UResourced",
    default_service = "org.freedesktop.UResourced",
    default_path = "/org/freedesktop/UResourced"
)]
pub trait UResourced {
    fn update(&self) -> zbus::Result<()>;
}

/// One planned `SetUnitProperties` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitUpdate {
    pub unit: String,
    pub allocation: Allocation,
}

fn aggregate_update(config: &SystemConfig, active_users: usize) -> UnitUpdate {
    let count = active_users as u64;

    UnitUpdate {
        unit: "user.slice".to_string(),
        allocation: Allocation {
            memory_min: (count * config.active_user.memory_min).min(config.max_memory_min),
            memory_low: (count * config.active_user.memory_low).min(config.max_memory_low),
            cpu_weight: None,
            io_weight: None,
        },
    }
}

fn user_updates(config: &SystemConfig, uid: u32, active: bool, managed: bool) -> [UnitUpdate; 2] {
    let slice = if active {
        config.active_user
    } else {
        config.inactive_user
    };

    // Delegating the allocation to the user's service manager instance only
    // helps when the graphical session actually runs inside it; otherwise
    // the session memory lives elsewhere in the hierarchy.
    let service = if active && managed {
        config.active_user
    } else {
        config.inactive_user
    };

    [
        UnitUpdate {
            unit: format!("user-{uid}.slice"),
            allocation: slice,
        },
        UnitUpdate {
            unit: format!("user@{uid}.service"),
            allocation: service,
        },
    ]
}

/// Compute the ordered list of writes taking `prev` to `next`.
///
/// The `user.slice` aggregate is raised before and lowered after the
/// per-user writes so a user is never granted more than the ceiling allows.
/// `managed_graphical` reports whether a user runs their graphical session
/// through the service manager.
pub fn plan_updates(
    prev: &LoginSnapshot,
    next: &LoginSnapshot,
    force: bool,
    config: &SystemConfig,
    managed_graphical: impl Fn(u32) -> bool,
) -> Vec<UnitUpdate> {
    let mut plan = Vec::new();

    if next.graphical_users.len() > prev.graphical_users.len() {
        plan.push(aggregate_update(config, next.graphical_users.len()));
    }

    // Revoke first: anyone no longer active, then any newly appeared
    // non-graphical user.
    for uid in prev.graphical_users.iter() {
        if !next.graphical_users.contains(uid) {
            plan.extend(user_updates(config, uid, false, false));
        }
    }

    for uid in next.all_users.iter() {
        if next.graphical_users.contains(uid) {
            continue;
        }
        if !prev.all_users.contains(uid) {
            plan.extend(user_updates(config, uid, false, false));
        }
    }

    for uid in next.graphical_users.iter() {
        if force || !prev.graphical_users.contains(uid) {
            plan.extend(user_updates(config, uid, true, managed_graphical(uid)));
        }
    }

    if next.graphical_users.len() < prev.graphical_users.len() {
        plan.push(aggregate_update(config, next.graphical_users.len()));
    }

    plan
}

/// The shutdown plan: every known user demoted, the aggregate zeroed, so no
/// residual protection survives the daemon.
pub fn shutdown_plan(prev: &LoginSnapshot, config: &SystemConfig) -> Vec<UnitUpdate> {
    let mut plan = Vec::new();

    for uid in prev.all_users.iter() {
        plan.extend(user_updates(config, uid, false, false));
    }
    plan.push(aggregate_update(config, 0));

    plan
}

pub struct Manager {
    logger: Logger,
    connection: Connection,
    proxy: SystemdManagerProxy<'static>,
    config: SystemConfig,
    pending: PendingCalls,
    prev: LoginSnapshot,
}

impl Manager {
    pub async fn new(
        connection: Connection,
        config: SystemConfig,
        logger: Logger,
    ) -> Result<Self> {
        let proxy = SystemdManagerProxy::builder(&connection)
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .context("could not create service manager proxy")?;

        Ok(Manager {
            logger,
            connection,
            proxy,
            config,
            pending: PendingCalls::new(),
            prev: LoginSnapshot::default(),
        })
    }

    /// Reconcile against a settled login snapshot.
    pub fn apply_snapshot(&mut self, next: LoginSnapshot) {
        self.reconcile(next, false);
    }

    /// Reapply all allocations for the current snapshot.
    pub fn force_update(&mut self) {
        debug!(self.logger, "full reapplication requested");
        let next = self.prev.clone();
        self.reconcile(next, true);
    }

    fn reconcile(&mut self, next: LoginSnapshot, force: bool) {
        debug!(self.logger, "updating user resource allocations";
               "graphical_users" => next.graphical_users.len(),
               "all_users" => next.all_users.len());

        let plan = plan_updates(&self.prev, &next, force, &self.config, |uid| {
            cgroup_path::user_daemon_unit_dir(uid).is_dir()
        });
        for update in plan {
            self.set_unit_resources(update);
        }

        self.prev = next;
    }

    /// Demote everything. Called on graceful shutdown so the service
    /// manager is left without residual protections.
    pub fn stop(&mut self) {
        for update in shutdown_plan(&self.prev, &self.config) {
            self.set_unit_resources(update);
        }

        self.prev = LoginSnapshot::default();
    }

    /// Release the bus presence acquired at startup.
    pub async fn release_bus(&self) {
        let _ = self
            .connection
            .object_server()
            .remove::<UResourcedService, _>(OBJECT_PATH)
            .await;
        let _ = self.connection.release_name(BUS_NAME).await;
    }

    /// Wait for every outstanding bus call to complete.
    pub async fn flush(&self) {
        self.pending.flush().await;
    }

    fn set_unit_resources(&self, update: UnitUpdate) {
        let UnitUpdate { unit, allocation } = update;

        info!(self.logger, "setting unit resources";
              "unit" => %unit,
              "memory_min" => allocation.memory_min,
              "memory_low" => allocation.memory_low,
              "cpu_weight" => weight_display(allocation.cpu_weight),
              "io_weight" => weight_display(allocation.io_weight));

        let proxy = self.proxy.clone();
        let logger = self.logger.clone();
        let guard = self.pending.guard();

        tokio::task::spawn_local(async move {
            let properties = allocation.properties();
            let call = proxy.set_unit_properties(&unit, false, &properties);

            match tokio::time::timeout(BUS_CALL_TIMEOUT, call).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(logger, "failed to set resource properties on unit";
                          "unit" => %unit, "error" => %err);
                }
                Err(_) => {
                    warn!(logger, "timed out setting resource properties on unit";
                          "unit" => %unit);
                }
            }

            drop(guard);
        });
    }
}

/// Watch for losing our bus name, which demands an orderly shutdown.
pub async fn watch_name_lost(
    connection: Connection,
    events: mpsc::UnboundedSender<Event>,
    logger: Logger,
) {
    let proxy = match zbus::fdo::DBusProxy::new(&connection).await {
        Ok(proxy) => proxy,
        Err(err) => {
            warn!(logger, "could not watch bus name ownership"; "error" => %err);
            return;
        }
    };

    let mut lost = match proxy.receive_name_lost().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(logger, "could not watch bus name ownership"; "error" => %err);
            return;
        }
    };

    while let Some(signal) = lost.next().await {
        let Ok(args) = signal.args() else { continue };
        if args.name.as_str() == BUS_NAME {
            warn!(logger, "bus name lost; shutting down");
            let _ = events.send(Event::Quit);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::UserSet;

    fn config() -> SystemConfig {
        SystemConfig {
            max_memory_min: 3 << 30,
            max_memory_low: 6u64 << 30,
            active_user: Allocation {
                memory_min: 2 << 30,
                memory_low: 4u64 << 30,
                cpu_weight: None,
                io_weight: None,
            },
            ..SystemConfig::default()
        }
    }

    fn snapshot(all: &[u32], graphical: &[u32]) -> LoginSnapshot {
        LoginSnapshot {
            all_users: all.iter().copied().collect::<UserSet>(),
            graphical_users: graphical.iter().copied().collect::<UserSet>(),
        }
    }

    fn units(plan: &[UnitUpdate]) -> Vec<&str> {
        plan.iter().map(|update| update.unit.as_str()).collect()
    }

    #[test]
    fn first_graphical_login_raises_ceiling_first() {
        let config = config();
        let plan = plan_updates(
            &snapshot(&[], &[]),
            &snapshot(&[1000], &[1000]),
            false,
            &config,
            |_| true,
        );

        assert_eq!(
            units(&plan),
            ["user.slice", "user-1000.slice", "user@1000.service"]
        );
        // One active user, below the ceiling.
        assert_eq!(plan[0].allocation.memory_min, 2 << 30);
        assert_eq!(plan[0].allocation.cpu_weight, None);
        assert_eq!(plan[1].allocation, config.active_user);
        assert_eq!(plan[2].allocation, config.active_user);
    }

    #[test]
    fn unmanaged_graphical_session_keeps_service_inactive() {
        let config = config();
        let plan = plan_updates(
            &snapshot(&[], &[]),
            &snapshot(&[1000], &[1000]),
            false,
            &config,
            |_| false,
        );

        assert_eq!(plan[1].allocation, config.active_user);
        assert_eq!(plan[2].allocation, config.inactive_user);
    }

    #[test]
    fn aggregate_ceiling_is_clamped() {
        let config = config();
        let plan = plan_updates(
            &snapshot(&[], &[]),
            &snapshot(&[1000, 1001], &[1000, 1001]),
            false,
            &config,
            |_| true,
        );

        // 2 users x 2G exceeds the 3G ceiling.
        assert_eq!(plan[0].allocation.memory_min, 3 << 30);
        assert_eq!(plan[0].allocation.memory_low, 6u64 << 30);
    }

    #[test]
    fn session_switch_demotes_before_promoting() {
        let config = config();
        let plan = plan_updates(
            &snapshot(&[1000], &[1000]),
            &snapshot(&[1000, 1001], &[1001]),
            false,
            &config,
            |_| true,
        );

        // Same number of graphical users, so the aggregate is untouched.
        assert_eq!(
            units(&plan),
            [
                "user-1000.slice",
                "user@1000.service",
                "user-1001.slice",
                "user@1001.service",
            ]
        );
        assert_eq!(plan[0].allocation, config.inactive_user);
        assert_eq!(plan[2].allocation, config.active_user);
    }

    #[test]
    fn logout_lowers_ceiling_after_demotion() {
        let config = config();
        let plan = plan_updates(
            &snapshot(&[1000, 1001], &[1000, 1001]),
            &snapshot(&[1000], &[1000]),
            false,
            &config,
            |_| true,
        );

        assert_eq!(
            units(&plan),
            ["user-1001.slice", "user@1001.service", "user.slice"]
        );
        assert_eq!(plan[2].allocation.memory_min, 2 << 30);
    }

    #[test]
    fn new_background_user_is_initialized_inactive() {
        let config = config();
        let plan = plan_updates(
            &snapshot(&[1000], &[1000]),
            &snapshot(&[1000, 1001], &[1000]),
            false,
            &config,
            |_| true,
        );

        assert_eq!(units(&plan), ["user-1001.slice", "user@1001.service"]);
        assert_eq!(plan[0].allocation, config.inactive_user);
    }

    #[test]
    fn force_update_is_idempotent() {
        let config = config();
        let state = snapshot(&[1000, 1001], &[1000]);

        let first = plan_updates(&state, &state, true, &config, |_| true);
        let second = plan_updates(&state, &state, true, &config, |_| true);

        assert_eq!(first, second);
        assert_eq!(units(&first), ["user-1000.slice", "user@1000.service"]);
    }

    #[test]
    fn settled_state_produces_no_traffic() {
        let config = config();
        let state = snapshot(&[1000, 1001], &[1000]);

        assert!(plan_updates(&state, &state, false, &config, |_| true).is_empty());
    }

    #[test]
    fn shutdown_demotes_everyone_and_zeroes_the_aggregate() {
        let config = config();
        let plan = shutdown_plan(&snapshot(&[1000, 1001], &[1000]), &config);

        assert_eq!(
            units(&plan),
            [
                "user-1000.slice",
                "user@1000.service",
                "user-1001.slice",
                "user@1001.service",
                "user.slice",
            ]
        );
        let aggregate = plan.last().unwrap();
        assert_eq!(aggregate.allocation.memory_min, 0);
        assert_eq!(aggregate.allocation.memory_low, 0);
    }
}
