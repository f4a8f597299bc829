// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! PipeWire boost source.
//!
//! Watches the audio graph registry for nodes created through the
//! PulseAudio compatibility layer. A node that starts running boosts the
//! owning application's cgroup; going idle or suspended drops the boost.
//!
//! PipeWire brings its own event loop. Its fd is registered with the tokio
//! loop and one loop iteration runs per wakeup, keeping everything on the
//! primary thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use pipewire as pw;
use pw::registry::GlobalObject;
use pw::spa::utils::dict::DictRef;
use pw::types::ObjectType;
use slog::{debug, warn, Logger};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;

use crate::monitor::{AppMonitor, BoostFlags};

/// A bound node proxy with its listener; dropped when the global goes away.
struct NodeWatch {
    _proxy: pw::node::Node,
    _listener: pw::node::NodeListener,
}

pub struct AudioMonitor {
    mainloop: pw::main_loop::MainLoop,
    _context: pw::context::Context,
    _core: pw::core::Core,
    _registry: Rc<pw::registry::Registry>,
    _registry_listener: pw::registry::Listener,
    nodes: Rc<RefCell<HashMap<u32, NodeWatch>>>,
    task: Option<JoinHandle<()>>,
}

impl AudioMonitor {
    pub fn start(monitor: AppMonitor, logger: &Logger) -> Result<Self> {
        pw::init();

        let mainloop = pw::main_loop::MainLoop::new(None)
            .context("could not create audio graph loop")?;
        let context = pw::context::Context::new(&mainloop)
            .context("could not create audio graph context")?;
        let core = context
            .connect(None)
            .context("could not connect to the audio graph")?;
        let registry = Rc::new(
            core.get_registry()
                .context("could not subscribe to the audio graph registry")?,
        );

        let nodes: Rc<RefCell<HashMap<u32, NodeWatch>>> = Rc::new(RefCell::new(HashMap::new()));

        let registry_weak = Rc::downgrade(&registry);
        let nodes_added = Rc::clone(&nodes);
        let nodes_removed = Rc::clone(&nodes);
        let added_logger = logger.clone();

        let registry_listener = registry
            .add_listener_local()
            .global(move |global| {
                let Some(registry) = registry_weak.upgrade() else {
                    return;
                };
                if global.type_ != ObjectType::Node {
                    return;
                }
                match bind_node(&registry, global, &monitor, &added_logger) {
                    Ok(watch) => {
                        nodes_added.borrow_mut().insert(global.id, watch);
                    }
                    Err(err) => {
                        warn!(added_logger, "could not bind audio node";
                              "id" => global.id, "error" => %err);
                    }
                }
            })
            .global_remove(move |id| {
                nodes_removed.borrow_mut().remove(&id);
            })
            .register();

        let mut audio = AudioMonitor {
            mainloop,
            _context: context,
            _core: core,
            _registry: registry,
            _registry_listener: registry_listener,
            nodes,
            task: None,
        };
        audio.attach(logger)?;

        Ok(audio)
    }

    /// Drive the foreign loop from the tokio loop.
    fn attach(&mut self, logger: &Logger) -> Result<()> {
        let fd = self.mainloop.loop_().fd().as_raw_fd();
        let mainloop = self.mainloop.clone();
        let logger = logger.clone();

        let task = tokio::task::spawn_local(async move {
            let watcher = match AsyncFd::with_interest(fd, Interest::READABLE) {
                Ok(watcher) => watcher,
                Err(err) => {
                    warn!(logger, "could not watch audio graph fd"; "error" => %err);
                    return;
                }
            };

            loop {
                let mut guard = match watcher.readable().await {
                    Ok(guard) => guard,
                    Err(err) => {
                        warn!(logger, "audio graph fd failed"; "error" => %err);
                        return;
                    }
                };
                mainloop.loop_().iterate(Duration::ZERO);
                guard.clear_ready();
            }
        });
        self.task = Some(task);

        Ok(())
    }

    pub fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.nodes.borrow_mut().clear();
    }
}

fn bind_node(
    registry: &pw::registry::Registry,
    global: &GlobalObject<&DictRef>,
    monitor: &AppMonitor,
    logger: &Logger,
) -> Result<NodeWatch, pw::Error> {
    let node: pw::node::Node = registry.bind(global)?;

    let monitor = monitor.clone();
    let logger = logger.clone();
    let listener = node
        .add_listener_local()
        .info(move |info| {
            let Some(props) = info.props() else { return };

            // Only streams coming in through the PulseAudio shim carry the
            // client process identity we need.
            if props.get("client.api") != Some("pipewire-pulse") {
                return;
            }
            let Some(pid) = props
                .get("application.process.id")
                .and_then(|pid| pid.parse::<i32>().ok())
            else {
                return;
            };

            let boosted = match info.state() {
                pw::node::NodeState::Running => true,
                pw::node::NodeState::Idle | pw::node::NodeState::Suspended => false,
                _ => return,
            };

            let path = match cgroup_path::unit_leaf_for_pid(pid) {
                Ok(path) => path,
                Err(err) => {
                    debug!(logger, "could not resolve cgroup of audio stream";
                           "pid" => pid, "error" => %err);
                    return;
                }
            };

            debug!(logger, "audio stream state changed";
                   "pid" => pid, "running" => boosted, "cgroup" => %path.display());
            monitor.set_boost(&path, BoostFlags::AUDIO, boosted);
        })
        .register();

    Ok(NodeWatch {
        _proxy: node,
        _listener: listener,
    })
}
