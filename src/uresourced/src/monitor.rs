// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-application cgroup monitoring.
//!
//! Watches the user's `app.slice` subtree. Each application unit directory
//! gets an [`AppInfo`] record tracking its weights, its focus timestamp
//! (from the `xdg.inactive-since` extended attribute the compositor
//! maintains) and boost bits contributed by the audio and game sources.
//! Interested parties subscribe to a change feed of `AppInfo` snapshots.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context as _, Result};
use bitflags::bitflags;
use futures::StreamExt;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use slog::{debug, warn, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sentinel focus timestamp: the application window has focus right now.
pub const TIMESTAMP_FOCUSED: i64 = -1;

/// Extended attribute the compositor stamps on unfocused application
/// cgroups (`xdg.inactive-since`, user namespace).
const INACTIVE_SINCE_XATTR: &str = "user.xdg.inactive-since";

const DEFAULT_WEIGHT: u64 = 100;

const WATCH_MASK: WatchMask = WatchMask::ATTRIB
    .union(WatchMask::CREATE)
    .union(WatchMask::DELETE);

bitflags! {
    /// Boost requests from subsystems other than the compositor focus.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BoostFlags: u32 {
        const AUDIO = 1;
        const GAME = 2;
    }
}

/// The tracked state of one application unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub path: PathBuf,
    pub cpu_weight: u64,
    pub io_weight: u64,
    /// Raw `xdg.inactive-since` value; [`TIMESTAMP_FOCUSED`] while focused.
    pub timestamp: i64,
    pub boosted: BoostFlags,
}

impl AppInfo {
    pub fn is_focused(&self) -> bool {
        self.timestamp == TIMESTAMP_FOCUSED
    }
}

fn monotonic_now_us() -> i64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(now) => now.tv_sec() * 1_000_000 + now.tv_nsec() / 1_000,
        Err(_) => 0,
    }
}

fn ends_in_slice(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(".slice"))
        .unwrap_or(false)
}

fn read_inactive_since(path: &Path) -> Option<i64> {
    let data = xattr::get(path, INACTIVE_SINCE_XATTR).ok()??;
    let text = String::from_utf8(data).ok()?;
    text.trim().parse().ok()
}

struct Inner {
    logger: Logger,
    root: PathBuf,
    inotify: Option<Inotify>,
    watches: Watches,
    path_to_wd: HashMap<PathBuf, WatchDescriptor>,
    wd_to_path: HashMap<WatchDescriptor, PathBuf>,
    apps: HashMap<PathBuf, AppInfo>,
    subscribers: Vec<mpsc::UnboundedSender<AppInfo>>,
    task: Option<JoinHandle<()>>,
}

/// Monitors the application slice of one user.
///
/// Cheap to clone; all clones share the same registry. There is exactly one
/// writer thread, so interior mutability never crosses a suspension point.
#[derive(Clone)]
pub struct AppMonitor {
    inner: Rc<RefCell<Inner>>,
}

impl AppMonitor {
    pub fn new(uid: u32, logger: &Logger) -> Result<Self> {
        Self::with_root(cgroup_path::app_slice_path(uid), logger)
    }

    pub fn with_root(root: PathBuf, logger: &Logger) -> Result<Self> {
        let inotify = Inotify::init().context("could not initialize inotify")?;
        let watches = inotify.watches();

        Ok(AppMonitor {
            inner: Rc::new(RefCell::new(Inner {
                logger: logger.clone(),
                root,
                inotify: Some(inotify),
                watches,
                path_to_wd: HashMap::new(),
                wd_to_path: HashMap::new(),
                apps: HashMap::new(),
                subscribers: Vec::new(),
                task: None,
            })),
        })
    }

    /// Watch the application slice recursively and start delivering change
    /// events. Failing to watch the slice root is fatal; everything below
    /// it is best-effort.
    pub fn start(&self) -> Result<()> {
        let root = self.inner.borrow().root.clone();
        if !self.add_watch(&root) {
            bail!("could not watch application slice {}", root.display());
        }
        self.discover(&root);

        let inotify = self
            .inner
            .borrow_mut()
            .inotify
            .take()
            .context("monitor already started")?;
        let stream = inotify
            .into_event_stream(vec![0u8; 4096])
            .context("could not create filesystem event stream")?;

        let this = self.clone();
        let logger = self.inner.borrow().logger.clone();
        let task = tokio::task::spawn_local(async move {
            let mut stream = stream;
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => this.handle_event(event.mask, event.wd, event.name),
                    Err(err) => {
                        warn!(logger, "error reading filesystem events"; "error" => %err);
                        break;
                    }
                }
            }
        });
        self.inner.borrow_mut().task = Some(task);

        Ok(())
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.borrow_mut().task.take() {
            task.abort();
        }
    }

    /// Subscribe to the change feed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AppInfo> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.borrow_mut().subscribers.push(tx);
        rx
    }

    /// Drop all subscriptions; their receivers will drain and then close.
    pub fn close_subscribers(&self) {
        self.inner.borrow_mut().subscribers.clear();
    }

    /// Re-read (or first admit) the application at `path`.
    ///
    /// Only directories below the slice root that are not themselves slices
    /// are admitted. A freshly admitted application without a readable
    /// inactive-since attribute counts as focused; on re-reads a missing
    /// attribute keeps the previous timestamp.
    pub fn refresh_app(&self, path: &Path) -> Option<AppInfo> {
        if !path.is_dir() {
            return None;
        }

        {
            let inner = self.inner.borrow();
            if !path.starts_with(&inner.root) || path == inner.root.as_path() {
                debug!(inner.logger, "ignoring cgroup outside the managed area";
                       "path" => %path.display());
                return None;
            }
        }
        if ends_in_slice(path) {
            return None;
        }

        let Some(name) = cgroup_path::unit_name_from_path(path) else {
            let inner = self.inner.borrow();
            debug!(inner.logger, "could not derive unit name"; "path" => %path.display());
            return None;
        };

        let cpu_weight =
            cgroup_path::read_weight(&path.join("cpu.weight")).unwrap_or(DEFAULT_WEIGHT);
        let io_weight =
            cgroup_path::read_weight(&path.join("io.weight")).unwrap_or(DEFAULT_WEIGHT);
        let inactive_since = read_inactive_since(path);

        let mut inner = self.inner.borrow_mut();
        let app = inner
            .apps
            .entry(path.to_path_buf())
            .or_insert_with(|| AppInfo {
                name,
                path: path.to_path_buf(),
                cpu_weight: DEFAULT_WEIGHT,
                io_weight: DEFAULT_WEIGHT,
                timestamp: TIMESTAMP_FOCUSED,
                boosted: BoostFlags::empty(),
            });

        app.cpu_weight = cpu_weight;
        app.io_weight = io_weight;
        if let Some(timestamp) = inactive_since {
            app.timestamp = timestamp;
        }

        Some(app.clone())
    }

    /// Toggle a boost bit for the application owning `path`, admitting it
    /// if necessary. A change event is emitted only when the bit flips.
    pub fn set_boost(&self, path: &Path, flag: BoostFlags, on: bool) {
        if self.refresh_app(path).is_none() {
            return;
        }

        let changed = {
            let mut inner = self.inner.borrow_mut();
            let Some(app) = inner.apps.get_mut(path) else {
                return;
            };
            let before = app.boosted;
            app.boosted.set(flag, on);
            (app.boosted != before).then(|| app.clone())
        };

        if let Some(app) = changed {
            self.emit(app);
        }
    }

    /// Unwind every boost and focus state, stamping apps inactive as of
    /// now. Used at shutdown so the configured defaults get re-applied.
    pub fn reset_all_apps(&self) {
        let now = monotonic_now_us();

        let reset: Vec<AppInfo> = {
            let mut inner = self.inner.borrow_mut();
            inner
                .apps
                .values_mut()
                .filter(|app| app.is_focused() || !app.boosted.is_empty())
                .map(|app| {
                    app.timestamp = now;
                    app.boosted = BoostFlags::empty();
                    app.clone()
                })
                .collect()
        };

        for app in reset {
            self.emit(app);
        }
    }

    fn emit(&self, app: AppInfo) {
        let mut inner = self.inner.borrow_mut();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(app.clone()).is_ok());
    }

    /// Watch one directory, replacing any stale descriptor for the same
    /// path, and admit it as an application if it qualifies.
    fn add_watch(&self, path: &Path) -> bool {
        let is_root = {
            let mut inner = self.inner.borrow_mut();

            let wd = match inner.watches.add(path, WATCH_MASK) {
                Ok(wd) => wd,
                Err(err) => {
                    debug!(inner.logger, "could not watch directory";
                           "path" => %path.display(), "error" => %err);
                    return false;
                }
            };

            if let Some(old) = inner.path_to_wd.get(path).cloned() {
                if old != wd {
                    inner.wd_to_path.remove(&old);
                    let _ = inner.watches.remove(old);
                }
            }
            inner.path_to_wd.insert(path.to_path_buf(), wd.clone());
            inner.wd_to_path.insert(wd, path.to_path_buf());

            path == inner.root.as_path()
        };

        if !is_root && !ends_in_slice(path) {
            self.refresh_app(path);
        }

        true
    }

    /// Recursively watch everything below `dir`. The watch is added before
    /// the children are enumerated so no creation event can be missed.
    fn discover(&self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                let inner = self.inner.borrow();
                debug!(inner.logger, "could not enumerate directory";
                       "path" => %dir.display(), "error" => %err);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if self.add_watch(&path) {
                self.discover(&path);
            }
        }
    }

    fn handle_event(&self, mask: EventMask, wd: WatchDescriptor, name: Option<OsString>) {
        let Some(name) = name else { return };

        let parent = self.inner.borrow().wd_to_path.get(&wd).cloned();
        let Some(parent) = parent else { return };
        let path = parent.join(&name);

        if mask == (EventMask::ATTRIB | EventMask::ISDIR) {
            if let Some(app) = self.refresh_app(&path) {
                self.emit(app);
            }
        } else if mask == (EventMask::CREATE | EventMask::ISDIR) {
            // The directory may already be gone again; a pending delete
            // event will clean up after us.
            if self.add_watch(&path) {
                self.discover(&path);
            }
        } else if mask == (EventMask::DELETE | EventMask::ISDIR) {
            let mut inner = self.inner.borrow_mut();
            if let Some(wd) = inner.path_to_wd.remove(&path) {
                inner.wd_to_path.remove(&wd);
                let _ = inner.watches.remove(wd);
            }
            inner.apps.remove(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn monitor_in_tempdir() -> (tempfile::TempDir, AppMonitor) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("user@1000.service").join("app.slice");
        fs::create_dir_all(&root).unwrap();
        let monitor = AppMonitor::with_root(root, &test_logger()).unwrap();
        (dir, monitor)
    }

    fn app_dir(monitor: &AppMonitor, name: &str) -> PathBuf {
        let path = monitor.inner.borrow().root.join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn admits_app_with_defaults() {
        let (_dir, monitor) = monitor_in_tempdir();
        let path = app_dir(&monitor, "org.example.Editor");
        fs::write(path.join("cpu.weight"), "150\n").unwrap();

        let app = monitor.refresh_app(&path).unwrap();
        assert_eq!(app.name, "org.example.Editor");
        assert_eq!(app.cpu_weight, 150);
        // No io.weight file present.
        assert_eq!(app.io_weight, 100);
        assert!(app.is_focused());
        assert!(app.boosted.is_empty());
    }

    #[test]
    fn refresh_does_not_reset_known_timestamp() {
        let (_dir, monitor) = monitor_in_tempdir();
        let path = app_dir(&monitor, "org.example.Editor");

        monitor.refresh_app(&path).unwrap();
        monitor
            .inner
            .borrow_mut()
            .apps
            .get_mut(&path)
            .unwrap()
            .timestamp = 42;

        let app = monitor.refresh_app(&path).unwrap();
        assert_eq!(app.timestamp, 42);
    }

    #[test]
    fn rejects_paths_outside_the_slice() {
        let (dir, monitor) = monitor_in_tempdir();

        let outside = dir.path().join("elsewhere");
        fs::create_dir_all(&outside).unwrap();
        assert!(monitor.refresh_app(&outside).is_none());

        let root = monitor.inner.borrow().root.clone();
        assert!(monitor.refresh_app(&root).is_none());

        let slice = app_dir(&monitor, "app-org.gnome.Terminal.slice");
        assert!(monitor.refresh_app(&slice).is_none());

        assert!(monitor.refresh_app(&root.join("no-such-dir")).is_none());
    }

    #[test]
    fn watch_tables_stay_bijective() {
        let (_dir, monitor) = monitor_in_tempdir();
        let path = app_dir(&monitor, "org.example.Editor");

        assert!(monitor.add_watch(&path));
        assert!(monitor.add_watch(&path));

        {
            let inner = monitor.inner.borrow();
            assert_eq!(inner.path_to_wd.len(), 1);
            assert_eq!(inner.wd_to_path.len(), 1);
            let wd = inner.path_to_wd.get(&path).unwrap();
            assert_eq!(inner.wd_to_path.get(wd), Some(&path));
        }

        let parent_wd = {
            let inner = monitor.inner.borrow();
            let root = inner.root.clone();
            drop(inner);
            assert!(monitor.add_watch(&root));
            monitor.inner.borrow().path_to_wd.get(&root).cloned().unwrap()
        };

        monitor.handle_event(
            EventMask::DELETE | EventMask::ISDIR,
            parent_wd,
            Some(OsString::from("org.example.Editor")),
        );

        let inner = monitor.inner.borrow();
        assert!(!inner.path_to_wd.contains_key(&path));
        assert!(inner.apps.get(&path).is_none());
        assert_eq!(inner.wd_to_path.len(), 1);
    }

    #[test]
    fn boost_emits_only_on_change() {
        let (_dir, monitor) = monitor_in_tempdir();
        let path = app_dir(&monitor, "com.example.Game");
        let mut events = monitor.subscribe();

        monitor.set_boost(&path, BoostFlags::GAME, true);
        let app = events.try_recv().unwrap();
        assert_eq!(app.boosted, BoostFlags::GAME);

        // Setting the same bit again is quiet.
        monitor.set_boost(&path, BoostFlags::GAME, true);
        assert!(events.try_recv().is_err());

        monitor.set_boost(&path, BoostFlags::AUDIO, true);
        let app = events.try_recv().unwrap();
        assert_eq!(app.boosted, BoostFlags::GAME | BoostFlags::AUDIO);

        monitor.set_boost(&path, BoostFlags::GAME, false);
        let app = events.try_recv().unwrap();
        assert_eq!(app.boosted, BoostFlags::AUDIO);
    }

    #[test]
    fn reset_unwinds_focus_and_boosts() {
        let (_dir, monitor) = monitor_in_tempdir();
        let focused = app_dir(&monitor, "org.example.Editor");
        let boosted = app_dir(&monitor, "com.example.Game");

        monitor.refresh_app(&focused).unwrap();
        monitor.set_boost(&boosted, BoostFlags::GAME, true);
        // Make the boosted app unfocused so only the boost keeps it hot.
        monitor.inner.borrow_mut().apps.get_mut(&boosted).unwrap().timestamp = 7;

        let mut events = monitor.subscribe();
        monitor.reset_all_apps();

        let mut seen = Vec::new();
        while let Ok(app) = events.try_recv() {
            assert!(!app.is_focused());
            assert!(app.timestamp > 0);
            assert!(app.boosted.is_empty());
            seen.push(app.name);
        }
        seen.sort();
        assert_eq!(seen, ["com.example.Game", "org.example.Editor"]);

        // A second reset has nothing left to do.
        monitor.reset_all_apps();
        assert!(events.try_recv().is_err());
    }
}
