//! Power management through `org.freedesktop.login1.Manager`.
//!
//! Both calls take effect immediately.  Asking for confirmation is up to
//! the caller.

use crate::call::{self, MethodCall};
use crate::{Connection, Result};

/// Reboot the host.
///
/// If `interactive` is set, polkit may prompt the user for authorization.
pub async fn reboot(connection: &Connection, interactive: bool) -> Result<()> {
    let reply = connection
        .call_method(MethodCall::Reboot { interactive })
        .await?;
    call::into_return(reply).map(drop)
}

/// Power off the host.
///
/// If `interactive` is set, polkit may prompt the user for authorization.
pub async fn power_off(connection: &Connection, interactive: bool) -> Result<()> {
    let reply = connection
        .call_method(MethodCall::PowerOff { interactive })
        .await?;
    call::into_return(reply).map(drop)
}
