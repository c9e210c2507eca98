use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use crate::{Error, Result};

/// Environment variable overriding the system bus address.
pub const SYSTEM_BUS_ADDRESS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";

/// The system bus address used when [SYSTEM_BUS_ADDRESS_ENV] is unset.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

pub fn system_bus_address() -> String {
    std::env::var(SYSTEM_BUS_ADDRESS_ENV)
        .unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_owned())
}

/// Pick the first `unix:path=` entry of a D-Bus address list.
///
/// Other transports (`tcp:`, abstract sockets, `unixexec:`) are skipped.
pub fn unix_socket_path(address: &str) -> Result<PathBuf> {
    for entry in address.split(';').filter(|e| !e.is_empty()) {
        let Some(("unix", params)) = entry.split_once(':') else {
            continue;
        };
        for param in params.split(',') {
            if let Some(("path", value)) = param.split_once('=') {
                return unescape(value)
                    .map(|bytes| PathBuf::from(OsString::from_vec(bytes)))
                    .ok_or_else(|| Error::UnsupportedAddress(address.to_owned()));
            }
        }
    }
    Err(Error::UnsupportedAddress(address.to_owned()))
}

// Undo the %xx escaping of address values.
fn unescape(value: &str) -> Option<Vec<u8>> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}
