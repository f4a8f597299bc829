// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! cgroupify splits a unit's control group into per-process children.
//!
//! The service manager historically keeps all processes of a unit in one
//! leaf, which makes per-process memory accounting (and targeted
//! out-of-memory handling) impossible. Given a unit, this tool moves every
//! PID found in the unit's leaf into a freshly created child group named
//! after the PID, enables the memory controller for the subtree, and keeps
//! sweeping until no child groups remain. Children are reaped as soon as
//! their `cgroup.events` reports them empty.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use futures::StreamExt;
use inotify::{Inotify, WatchDescriptor, WatchMask, Watches};
use nix::errno::Errno;
use slog::{debug, o, warn, Drain, Logger};
use tokio::time::MissedTickBehavior;
use zbus::zvariant::OwnedObjectPath;
use zbus::{dbus_proxy, CacheProperties, Connection};

/// How often the subtree is re-swept for processes that ended up back in a
/// group leaf, e.g. through fork races.
const RESCAN_PERIOD: Duration = Duration::from_secs(1);

#[dbus_proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn get_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;
}

#[dbus_proxy(
    interface = "org.freedesktop.systemd1.Scope",
    default_service = "org.freedesktop.systemd1"
)]
trait Scope {
    #[dbus_proxy(property)]
    fn control_group(&self) -> zbus::Result<String>;
}

#[dbus_proxy(
    interface = "org.freedesktop.systemd1.Service",
    default_service = "org.freedesktop.systemd1"
)]
trait Service {
    #[dbus_proxy(property)]
    fn control_group(&self) -> zbus::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Scope,
    Service,
}

fn unit_kind(unit: &str) -> Option<UnitKind> {
    if unit.ends_with(".scope") && unit.len() > ".scope".len() {
        Some(UnitKind::Scope)
    } else if unit.ends_with(".service") && unit.len() > ".service".len() {
        Some(UnitKind::Service)
    } else {
        None
    }
}

/// Resolve the unit's control group through the user's service manager.
async fn resolve_cgroup(connection: &Connection, unit: &str, kind: UnitKind) -> Result<PathBuf> {
    let manager = SystemdManagerProxy::builder(connection)
        .cache_properties(CacheProperties::No)
        .build()
        .await?;
    let path = manager
        .get_unit(unit)
        .await
        .with_context(|| format!("could not look up unit {unit}"))?;

    let control_group = match kind {
        UnitKind::Scope => {
            ScopeProxy::builder(connection)
                .path(path)?
                .cache_properties(CacheProperties::No)
                .build()
                .await?
                .control_group()
                .await
        }
        UnitKind::Service => {
            ServiceProxy::builder(connection)
                .path(path)?
                .cache_properties(CacheProperties::No)
                .build()
                .await?
                .control_group()
                .await
        }
    }
    .with_context(|| format!("could not read control group of {unit}"))?;

    Ok(Path::new(cgroup_path::CGROUP_ROOT).join(control_group.trim_start_matches('/')))
}

/// The PIDs listed in a `cgroup.procs` file, minus the name of the group
/// being drained so we do not chase ourselves.
fn pids_to_move<'a>(contents: &'a str, own_name: Option<&str>) -> Vec<&'a str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| own_name != Some(*line))
        .collect()
}

fn is_errno(err: &io::Error, errno: Errno) -> bool {
    err.raw_os_error() == Some(errno as i32)
}

struct Splitter {
    logger: Logger,
    root: PathBuf,
    watches: Watches,
    /// Reap watches: descriptor of a child's `cgroup.events` to the child.
    reap: HashMap<WatchDescriptor, PathBuf>,
}

impl Splitter {
    /// Drain one group (the root leaf for `None`) into per-PID children,
    /// repeating until a pass finds nothing to move; the file can refill
    /// underneath us while processes fork.
    ///
    /// Reading the group's process list at all is the caller's concern: a
    /// group that vanished mid-sweep is normal, an unreadable root leaf is
    /// not.
    fn split_group(&mut self, group: Option<&str>) -> io::Result<()> {
        let procs_path = match group {
            Some(name) => self.root.join(name).join("cgroup.procs"),
            None => self.root.join("cgroup.procs"),
        };

        loop {
            let contents = fs::read_to_string(&procs_path)?;

            let pids = pids_to_move(&contents, group);
            if pids.is_empty() {
                return Ok(());
            }

            let mut moved = 0;
            for pid in pids {
                match self.move_to_child(pid) {
                    Ok(()) => moved += 1,
                    Err(err) => {
                        debug!(self.logger, "could not move pid into child group";
                               "pid" => pid, "error" => %err);
                    }
                }
            }
            if moved == 0 {
                return Ok(());
            }
        }
    }

    /// Move one PID into a fresh child group named after it.
    fn move_to_child(&mut self, pid: &str) -> io::Result<()> {
        let child = self.root.join(pid);

        // The child must not exist yet; a collision skips this PID.
        fs::create_dir(&child)?;

        // Watch for the child draining so it can be reaped.
        let watched = match self.watches.add(child.join("cgroup.events"), WatchMask::MODIFY) {
            Ok(wd) => {
                self.reap.insert(wd.clone(), child.clone());
                Some(wd)
            }
            Err(err) => {
                warn!(self.logger, "could not watch child group";
                      "path" => %child.display(), "error" => %err);
                None
            }
        };

        let mut result = Ok(());
        match fs::write(child.join("cgroup.procs"), pid) {
            Ok(()) => {}
            // The PID exiting first is not an error.
            Err(err) if is_errno(&err, Errno::ESRCH) => {}
            Err(err) => result = Err(err),
        }

        // A zombie or an already-exited PID leaves the child empty without
        // any event ever firing, so try to reap it right away.
        match fs::remove_dir(&child) {
            Ok(()) => self.cancel_reap(watched),
            Err(err) if is_errno(&err, Errno::ENOENT) => self.cancel_reap(watched),
            Err(_) => {}
        }

        result
    }

    fn cancel_reap(&mut self, watched: Option<WatchDescriptor>) {
        if let Some(wd) = watched {
            self.reap.remove(&wd);
            let _ = self.watches.remove(wd);
        }
    }

    /// A child's `cgroup.events` changed; it is probably empty now.
    fn handle_reap_event(&mut self, wd: WatchDescriptor) {
        let Some(child) = self.reap.get(&wd).cloned() else {
            return;
        };

        match fs::remove_dir(&child) {
            // Still populated; keep watching.
            Err(err) if is_errno(&err, Errno::EBUSY) => {}
            Ok(()) => self.cancel_reap(Some(wd)),
            Err(err) if is_errno(&err, Errno::ENOENT) => self.cancel_reap(Some(wd)),
            Err(err) => {
                warn!(self.logger, "could not remove child group, ignoring it from now on";
                      "path" => %child.display(), "error" => %err);
                self.cancel_reap(Some(wd));
            }
        }
    }

    /// Sweep all child groups once. Returns false once no children remain
    /// and the job is done.
    fn rescan(&mut self) -> bool {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return false;
        };

        let mut found = false;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            found = true;
            // The group disappearing underneath the sweep is fine.
            let _ = self.split_group(Some(name));
        }

        found
    }
}

async fn run(unit: &str, logger: &Logger) -> Result<()> {
    let Some(kind) = unit_kind(unit) else {
        bail!("unit {unit:?} is not a scope or service");
    };

    let connection = Connection::session()
        .await
        .context("could not connect to the user service manager")?;
    let root = resolve_cgroup(&connection, unit, kind).await?;
    if !root.is_dir() {
        bail!("control group {} does not exist", root.display());
    }
    debug!(logger, "splitting control group"; "path" => %root.display());

    let inotify = Inotify::init().context("could not initialize inotify")?;
    let mut splitter = Splitter {
        logger: logger.clone(),
        root,
        watches: inotify.watches(),
        reap: HashMap::new(),
    };

    // Move everything out of the main leaf first.
    splitter
        .split_group(None)
        .with_context(|| format!("could not drain {}", splitter.root.display()))?;

    // With children in place the memory controller can be enabled for the
    // subtree, giving each process its own accounting.
    let subtree_control = splitter.root.join("cgroup.subtree_control");
    fs::write(&subtree_control, "+memory").with_context(|| {
        format!(
            "could not enable the memory controller in {}",
            splitter.root.display()
        )
    })?;

    let mut events = inotify
        .into_event_stream(vec![0u8; 4096])
        .context("could not create filesystem event stream")?;

    let start = tokio::time::Instant::now() + RESCAN_PERIOD;
    let mut rescan = tokio::time::interval_at(start, RESCAN_PERIOD);
    rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = rescan.tick() => {
                if !splitter.rescan() {
                    debug!(logger, "no child groups left");
                    break;
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => splitter.handle_reap_event(event.wd),
                Some(Err(err)) => {
                    warn!(logger, "error reading filesystem events"; "error" => %err);
                    break;
                }
                None => break,
            }
        }
    }

    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "cgroupify")]
struct Args {
    /// Unit whose control group should be split into per-process children
    unit: String,
}

fn create_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let logger = create_logger();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not create runtime")?;
    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(run(&args.unit, &logger)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_list_skips_blanks_and_own_name() {
        let contents = "100\n101\n\n321\n";

        assert_eq!(pids_to_move(contents, None), ["100", "101", "321"]);
        assert_eq!(pids_to_move(contents, Some("321")), ["100", "101"]);
        assert_eq!(pids_to_move("", None), Vec::<&str>::new());
        assert_eq!(pids_to_move("\n", None), Vec::<&str>::new());
    }

    #[test]
    fn unit_suffix_detection() {
        assert_eq!(unit_kind("app-session.scope"), Some(UnitKind::Scope));
        assert_eq!(unit_kind("foo.service"), Some(UnitKind::Service));
        assert_eq!(unit_kind("user.slice"), None);
        assert_eq!(unit_kind(".scope"), None);
        assert_eq!(unit_kind("bare"), None);
    }

    fn test_splitter(root: PathBuf) -> Splitter {
        let inotify = Inotify::init().unwrap();
        Splitter {
            logger: Logger::root(slog::Discard, o!()),
            root,
            watches: inotify.watches(),
            reap: HashMap::new(),
        }
    }

    #[test]
    fn child_collision_skips_the_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut splitter = test_splitter(dir.path().to_path_buf());

        fs::create_dir(dir.path().join("100")).unwrap();
        let err = splitter.move_to_child("100").unwrap_err();
        assert!(is_errno(&err, Errno::EEXIST));
    }

    #[test]
    fn rescan_reports_remaining_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut splitter = test_splitter(dir.path().to_path_buf());

        assert!(!splitter.rescan());

        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join("cgroup.procs"), "").unwrap();
        assert!(!splitter.rescan());

        fs::create_dir(dir.path().join("4242")).unwrap();
        fs::write(dir.path().join("4242").join("cgroup.procs"), "").unwrap();
        assert!(splitter.rescan());
    }

    #[test]
    fn rescan_stops_when_the_root_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("leaf");
        let mut splitter = test_splitter(root.clone());

        assert!(!splitter.rescan());
    }
}
