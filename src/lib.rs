//! Query and control systemd units over the D-Bus system bus, without
//! shelling out to `systemctl`.
//!
//! ```no_run
//! # async fn demo() -> systemd_control::Result<()> {
//! let bus = systemd_control::system().await?;
//! if systemd_control::unit_active_state(&bus, "openvpn.service").await? != "active" {
//!     systemd_control::unit_restart(&bus, "openvpn.service", "replace").await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every function takes the [Connection] explicitly.  [system] opens a new
//! connection on each call; clone the returned value to share it.

use std::time::Duration;

use log::debug;
use tokio::time::Instant;

mod address;
mod call;
mod connection;
mod error;
pub mod login;
pub mod manager;
mod sasl;
pub mod unit;
pub mod wire;

pub use address::{DEFAULT_SYSTEM_BUS_ADDRESS, SYSTEM_BUS_ADDRESS_ENV};
pub use connection::{Builder, Connection, DEFAULT_CALL_TIMEOUT};
pub use error::{Error, Result};
pub use login::{power_off, reboot};
pub use manager::{
    UNIT_MODE_FAIL, UNIT_MODE_IGNORE_DEPENDENCIES, UNIT_MODE_IGNORE_REQUIREMENTS,
    UNIT_MODE_ISOLATE, UNIT_MODE_REPLACE,
};
pub use unit::UnitRef;

// Upper bound on the delay between two `ActiveState` reads while waiting
// for a unit to settle.
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The state of a unit after [unit_start_and_wait].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    state: String,
    code: String,
    status: i32,
}

impl UnitStatus {
    /// The `ActiveState` of the unit, e.g. `"active"` or `"failed"`.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// The `SubState` of the unit, e.g. `"running"` or `"exited"`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The exit status of the main process.
    pub fn status(&self) -> i32 {
        self.status
    }
}

/// Open a new connection to the system bus.
pub async fn system() -> Result<Connection> {
    Connection::system().await
}

/// Get the `ActiveState` of a loaded unit.
pub async fn unit_active_state(connection: &Connection, unit_name: &str) -> Result<String> {
    let unit = manager::get_unit(connection, unit_name).await?;
    unit::active_state(connection, &unit).await
}

/// Get the `SubState` of a loaded unit.
pub async fn unit_sub_state(connection: &Connection, unit_name: &str) -> Result<String> {
    let unit = manager::get_unit(connection, unit_name).await?;
    unit::sub_state(connection, &unit).await
}

/// Get the units a loaded unit is `PartOf=`.
pub async fn unit_part_of(connection: &Connection, unit_name: &str) -> Result<Vec<String>> {
    let unit = manager::get_unit(connection, unit_name).await?;
    unit::part_of(connection, &unit).await
}

/// Start a unit.
///
/// `mode` is one of the `UNIT_MODE_*` values and is passed to systemd as is.
pub async fn unit_start(connection: &Connection, unit_name: &str, mode: &str) -> Result<()> {
    manager::start_unit(connection, unit_name, mode)
        .await
        .map(drop)
}

/// Stop a unit.
pub async fn unit_stop(connection: &Connection, unit_name: &str, mode: &str) -> Result<()> {
    manager::stop_unit(connection, unit_name, mode)
        .await
        .map(drop)
}

/// Restart a unit.
pub async fn unit_restart(connection: &Connection, unit_name: &str, mode: &str) -> Result<()> {
    manager::restart_unit(connection, unit_name, mode)
        .await
        .map(drop)
}

/// Start a service and wait until its `ActiveState` stops changing.
///
/// The state is polled until it has stayed the same for `wait_interval`.
/// The result is named after `systemctl status` output, e.g. a service
/// whose main process exited with 26 reports
/// `state: "failed", code: "failed", status: 26`.
pub async fn unit_start_and_wait(
    connection: &Connection,
    unit_name: &str,
    wait_interval: Duration,
    mode: &str,
) -> Result<UnitStatus> {
    let unit = UnitRef::from_name(unit_name)?;
    let mut state = unit::active_state(connection, &unit).await?;
    unit::start(connection, &unit, mode).await?;

    let poll = wait_interval.min(STATE_POLL_INTERVAL);
    let mut last_change = Instant::now();
    while last_change.elapsed() < wait_interval {
        tokio::time::sleep(poll).await;
        let current = unit::active_state(connection, &unit).await?;
        if current != state {
            debug!("{} is now {}", unit_name, current);
            state = current;
            last_change = Instant::now();
        }
    }

    let status = unit::exec_main_status(connection, &unit).await?;
    let code = unit::sub_state(connection, &unit).await?;
    Ok(UnitStatus {
        state,
        code,
        status,
    })
}
