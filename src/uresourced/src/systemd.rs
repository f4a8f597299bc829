// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! Service manager bus interface.

use std::time::Duration;

use zbus::dbus_proxy;
use zbus::zvariant::Value;

/// All bus calls are expected to complete quickly; anything slower than
/// this is reported and abandoned.
pub const BUS_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// A resource assignment for one unit.
///
/// `None` weights are left untouched on the unit; the service manager keeps
/// whatever value it currently has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    pub memory_min: u64,
    pub memory_low: u64,
    pub cpu_weight: Option<u64>,
    pub io_weight: Option<u64>,
}

impl Allocation {
    /// The property list for `SetUnitProperties`, omitting ignored weights.
    pub fn properties(&self) -> Vec<(&'static str, Value<'static>)> {
        let mut properties = vec![
            ("MemoryMin", Value::from(self.memory_min)),
            ("MemoryLow", Value::from(self.memory_low)),
        ];

        if let Some(weight) = self.cpu_weight {
            properties.push(("CPUWeight", Value::from(weight)));
        }
        if let Some(weight) = self.io_weight {
            properties.push(("IOWeight", Value::from(weight)));
        }

        properties
    }
}

/// Render a possibly-ignored weight for log output.
pub fn weight_display(weight: Option<u64>) -> String {
    match weight {
        Some(value) => value.to_string(),
        None => "-".to_string(),
    }
}

#[dbus_proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
pub trait SystemdManager {
    /// Apply resource properties to a unit. `runtime` keeps the change out
    /// of persistent storage.
    fn set_unit_properties(
        &self,
        name: &str,
        runtime: bool,
        properties: &[(&str, Value<'_>)],
    ) -> zbus::Result<()>;
}
