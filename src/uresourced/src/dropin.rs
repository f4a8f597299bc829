// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! Session slice drop-in generation.
//!
//! The per-user session slice is configured by the user's own service
//! manager instance, which we cannot reach from the system daemon. Instead
//! a drop-in fragment is published in the runtime configuration directory,
//! where every user instance picks it up.

use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use slog::{debug, warn, Logger};

use crate::systemd::Allocation;

const DROPIN_DIR: &str = "/run/systemd/user/session.slice.d";
const DROPIN_NAME: &str = "99-uresourced.conf";

/// Render the `[Slice]` fragment. Ignored weights are left out so the
/// service manager keeps its own defaults.
fn render(allocation: &Allocation) -> String {
    let mut fragment = String::from(
        "[Slice]\n\
         # Generated by uresourced to pass the active user's memory allocation\n\
         # down into the session slice.\n",
    );

    let _ = writeln!(fragment, "MemoryMin={}", allocation.memory_min);
    let _ = writeln!(fragment, "MemoryLow={}", allocation.memory_low);
    if let Some(weight) = allocation.cpu_weight {
        let _ = writeln!(fragment, "CPUWeight={weight}");
    }
    if let Some(weight) = allocation.io_weight {
        let _ = writeln!(fragment, "IOWeight={weight}");
    }

    fragment
}

/// Write the session slice drop-in. Failure is logged and otherwise
/// ignored; the daemon stays useful without the fragment.
pub fn write_session_slice_dropin(allocation: &Allocation, logger: &Logger) {
    write_dropin_to(Path::new(DROPIN_DIR), allocation, logger);
}

fn write_dropin_to(directory: &Path, allocation: &Allocation, logger: &Logger) {
    if let Err(err) = fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(directory)
    {
        warn!(logger, "could not create drop-in directory";
              "path" => %directory.display(), "error" => %err);
        return;
    }

    let path = directory.join(DROPIN_NAME);
    match fs::write(&path, render(allocation)) {
        Ok(()) => debug!(logger, "wrote session slice drop-in"; "path" => %path.display()),
        Err(err) => warn!(logger, "could not write session slice drop-in";
                          "path" => %path.display(), "error" => %err),
    }
}
