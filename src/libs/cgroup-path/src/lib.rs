// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! Path helpers for the unified cgroup hierarchy.
//!
//! systemd units map 1:1 to directories below `/sys/fs/cgroup`; these
//! helpers resolve the paths this project cares about (a user's `app.slice`
//! subtree, the unit leaf owning a PID) and read the small pseudo-files
//! found there.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Mount point of the unified hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// The application slice of a user's service manager instance.
pub fn app_slice_path(uid: u32) -> PathBuf {
    PathBuf::from(format!(
        "{CGROUP_ROOT}/user.slice/user-{uid}.slice/user@{uid}.service/app.slice"
    ))
}

/// The cgroup directory of the per-user daemon unit inside the user's
/// service manager instance. Its existence indicates that the graphical
/// session is run through the service manager.
pub fn user_daemon_unit_dir(uid: u32) -> PathBuf {
    PathBuf::from(format!(
        "{CGROUP_ROOT}/user.slice/user-{uid}.slice/user@{uid}.service/uresourced.service"
    ))
}

/// Index of the path component naming the application unit: the first
/// component after `user@<uid>.service` that does not end in `.slice`.
fn unit_component_index(components: &[&str]) -> Option<usize> {
    let service = components
        .iter()
        .position(|c| c.starts_with("user@") && c.ends_with(".service"))?;

    components
        .iter()
        .enumerate()
        .skip(service + 1)
        .find(|(_, c)| !c.ends_with(".slice"))
        .map(|(i, _)| i)
}

fn path_components(path: &Path) -> Vec<&str> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect()
}

/// Derive the application unit name from a cgroup path.
///
/// A leading underscore is stripped; the service manager uses it to escape
/// unit names that would otherwise start with a reserved character.
pub fn unit_name_from_path(path: &Path) -> Option<String> {
    let components = path_components(path);
    let index = unit_component_index(&components)?;
    let name = components[index].strip_prefix('_').unwrap_or(components[index]);

    Some(name.to_string())
}

/// Trim a cgroup path to the leaf of the unit owning it, dropping any
/// delegated sub-hierarchy below the unit.
pub fn unit_leaf_path(path: &Path) -> Option<PathBuf> {
    let components = path_components(path);
    let index = unit_component_index(&components)?;

    let mut leaf = PathBuf::from("/");
    for component in &components[..=index] {
        leaf.push(component);
    }
    Some(leaf)
}

/// Resolve the cgroupfs leaf of the user unit owning `pid`.
pub fn unit_leaf_for_pid(pid: i32) -> Result<PathBuf> {
    let process = procfs::process::Process::new(pid)
        .with_context(|| format!("no such process: {pid}"))?;
    let cgroups = process
        .cgroups()
        .with_context(|| format!("could not read cgroup of pid {pid}"))?;

    // The unified hierarchy is the entry with hierarchy id 0.
    let entry = cgroups
        .iter()
        .find(|c| c.hierarchy == 0)
        .ok_or_else(|| anyhow!("pid {pid} has no unified-hierarchy cgroup"))?;

    let full = Path::new(CGROUP_ROOT).join(entry.pathname.trim_start_matches('/'));
    unit_leaf_path(&full)
        .ok_or_else(|| anyhow!("cgroup {} is not below a user unit", full.display()))
}

/// Read a `cpu.weight` / `io.weight` style file.
///
/// The kernel reports the unset value as `default <n>`; only the numeric
/// part is of interest. Unreadable, unparsable or zero values yield `None`.
pub fn read_weight(path: &Path) -> Option<u64> {
    let contents = fs::read_to_string(path).ok()?;
    let value = contents.trim();
    let value = value.strip_prefix("default ").unwrap_or(value);

    match value.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(weight) => Some(weight),
    }
}

/// Total amount of system RAM in bytes.
pub fn total_system_memory() -> Result<u64> {
    let meminfo = procfs::Meminfo::new().context("could not read /proc/meminfo")?;
    Ok(meminfo.mem_total)
}
