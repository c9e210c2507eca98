//! Calls on the service manager object, `org.freedesktop.systemd1.Manager`.
//!
//! `StartUnit`, `StopUnit` and `RestartUnit` take a unit name, so units
//! are not resolved to an object path before queueing a job.

use zvariant::ObjectPath;

use crate::call::{self, MethodCall};
use crate::unit::UnitRef;
use crate::{Connection, Error, Result};

/// Replace a conflicting queued job, if any.
pub const UNIT_MODE_REPLACE: &str = "replace";
/// Fail if the new job conflicts with a queued one.
pub const UNIT_MODE_FAIL: &str = "fail";
/// Stop every unit not required by the started one.
pub const UNIT_MODE_ISOLATE: &str = "isolate";
/// Ignore all unit dependencies of the job.
pub const UNIT_MODE_IGNORE_DEPENDENCIES: &str = "ignore-dependencies";
/// Ignore requirement dependencies, but honor ordering.
pub const UNIT_MODE_IGNORE_REQUIREMENTS: &str = "ignore-requirements";

/// Look up a loaded unit by name.
///
/// Fails with [Error::NoSuchUnit] if systemd has no such unit loaded.
pub async fn get_unit(connection: &Connection, unit: &str) -> Result<UnitRef> {
    let reply = connection
        .call_method(MethodCall::GetUnit { unit })
        .await?;
    call::object_path(call::into_return(reply)?).map(UnitRef::new)
}

// The mode is handed to systemd as is; only an empty one is refused here.
fn check_mode(mode: &str) -> Result<()> {
    if mode.is_empty() {
        return Err(Error::EmptyMode);
    }
    Ok(())
}

async fn enqueue(connection: &Connection, method: MethodCall<'_>) -> Result<ObjectPath<'static>> {
    let reply = connection.call_method(method).await?;
    call::object_path(call::into_return(reply)?)
}

/// Enqueue a start job.  Returns the path of the job.
pub async fn start_unit(
    connection: &Connection,
    unit: &str,
    mode: &str,
) -> Result<ObjectPath<'static>> {
    check_mode(mode)?;
    enqueue(connection, MethodCall::StartUnit { unit, mode }).await
}

/// Enqueue a stop job.  Returns the path of the job.
pub async fn stop_unit(
    connection: &Connection,
    unit: &str,
    mode: &str,
) -> Result<ObjectPath<'static>> {
    check_mode(mode)?;
    enqueue(connection, MethodCall::StopUnit { unit, mode }).await
}

/// Enqueue a restart job.  Returns the path of the job.
pub async fn restart_unit(
    connection: &Connection,
    unit: &str,
    mode: &str,
) -> Result<ObjectPath<'static>> {
    check_mode(mode)?;
    enqueue(connection, MethodCall::RestartUnit { unit, mode }).await
}
