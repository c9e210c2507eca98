use std::time::Duration;

use crate::wire::DecodeError;

/// The error type of `systemd_control`.
///
/// The various errors that can be returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error connecting to the D-Bus socket.
    #[error("cannot connect to dbus: {0}")]
    DBusConnectionFail(#[source] std::io::Error),
    /// The bus address has no transport this crate can use.
    #[error("unsupported dbus address: {0}")]
    UnsupportedAddress(String),
    /// The bus refused the `EXTERNAL` authentication.
    #[error("dbus authentication rejected: {0}")]
    AuthRejected(String),
    /// No reply arrived within the call timeout.
    #[error("no reply to call {serial} within {after:?}")]
    Timeout {
        /// Serial number of the call that timed out.
        serial: u32,
        /// The timeout that elapsed.
        after: Duration,
    },
    /// A message could not be marshalled.
    #[error("cannot encode dbus message: {0}")]
    Encode(#[source] zvariant::Error),
    /// A message from the bus could not be decoded.
    #[error("cannot decode dbus message: {0}")]
    Decode(#[from] DecodeError),
    /// The unit name or path does not resolve to a unit object.
    #[error("unit not found: {0}")]
    NoSuchUnit(String),
    /// The requested job mode conflicts with systemd's job queue.
    #[error("job queue conflict ({name}): {message}")]
    JobQueue {
        /// The D-Bus error name.
        name: String,
        /// The message sent along with the error.
        message: String,
    },
    /// Any other error reply from the remote side.
    #[error("{name}: {message}")]
    MethodError {
        /// The D-Bus error name.
        name: String,
        /// The message sent along with the error.
        message: String,
    },
    /// The connection to the bus is gone.
    #[error("dbus connection closed")]
    Disconnected,
    /// An I/O error on an established connection.
    #[error("dbus i/o error: {0}")]
    Io(#[source] std::io::Error),
    /// Invalid D-Bus path.
    #[error("cannot get a valid dbus path: {0}")]
    DBusInvalidPath(zvariant::Error),
    /// Invalid bus, interface or member name.
    #[error("invalid dbus name: {0}")]
    InvalidName(zbus_names::Error),
    /// An empty job mode was passed to a start, stop or restart call.
    #[error("job mode must not be empty")]
    EmptyMode,
}

/// Alias for a [Result][std::result::Result] with the error type [Error].
pub type Result<T> = std::result::Result<T, Error>;
