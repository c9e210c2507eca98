//! Read-only access to the properties of one unit, plus `Unit.Start`.

use zvariant::ObjectPath;

use crate::call::{self, MethodCall, SERVICE_INTERFACE, UNIT_INTERFACE, UNKNOWN_OBJECT};
use crate::wire::{Reply, Value};
use crate::{Connection, Error, Result};

/// A unit object on the service manager.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRef {
    path: ObjectPath<'static>,
}

fn escape_byte_for_object_path(b: u8) -> String {
    if b.is_ascii_alphanumeric() {
        char::from(b).to_string()
    } else {
        format!("_{:02x}", b)
    }
}

impl UnitRef {
    /// Refer to the unit at `path`, as returned by `GetUnit`.
    pub fn new(path: ObjectPath<'static>) -> Self {
        Self { path }
    }

    /// Derive the object path of a unit from its name, the way systemd
    /// labels its unit objects.
    ///
    /// This does not check that the unit exists or is loaded.
    pub fn from_name<T: AsRef<str>>(name: T) -> Result<Self> {
        let name = name.as_ref().as_bytes();
        let label = match name.first() {
            None => "_".to_owned(),
            // A label must not start with a digit.
            Some(first) if first.is_ascii_digit() => {
                let rest: String = name[1..]
                    .iter()
                    .map(|&b| escape_byte_for_object_path(b))
                    .collect();
                format!("_{:02x}{}", first, rest)
            }
            Some(_) => name
                .iter()
                .map(|&b| escape_byte_for_object_path(b))
                .collect(),
        };
        let path = ObjectPath::try_from(format!("/org/freedesktop/systemd1/unit/{}", label))
            .map_err(Error::DBusInvalidPath)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &ObjectPath<'static> {
        &self.path
    }
}

async fn get_property(
    connection: &Connection,
    unit: &UnitRef,
    interface: &'static str,
    property: &'static str,
) -> Result<Value<'static>> {
    let reply = connection
        .call_method(MethodCall::GetProperty {
            unit,
            interface,
            property,
        })
        .await?;
    match reply {
        Reply::Error { name, message } if name == UNKNOWN_OBJECT => {
            Err(Error::NoSuchUnit(message))
        }
        reply => call::property(call::into_return(reply)?),
    }
}

/// The `ActiveState` of the unit, e.g. `"active"` or `"failed"`.
///
/// The state is passed through as systemd reports it.
pub async fn active_state(connection: &Connection, unit: &UnitRef) -> Result<String> {
    call::expect_str(get_property(connection, unit, UNIT_INTERFACE, "ActiveState").await?)
}

/// The `SubState` of the unit, e.g. `"running"` or `"exited"`.
pub async fn sub_state(connection: &Connection, unit: &UnitRef) -> Result<String> {
    call::expect_str(get_property(connection, unit, UNIT_INTERFACE, "SubState").await?)
}

/// The units this unit is `PartOf=`, in the order systemd reports them.
pub async fn part_of(connection: &Connection, unit: &UnitRef) -> Result<Vec<String>> {
    call::expect_str_array(get_property(connection, unit, UNIT_INTERFACE, "PartOf").await?)
}

/// The exit status of the main process of a service unit.
pub async fn exec_main_status(connection: &Connection, unit: &UnitRef) -> Result<i32> {
    call::expect_i32(get_property(connection, unit, SERVICE_INTERFACE, "ExecMainStatus").await?)
}

/// Enqueue a start job for the unit through its own object.
///
/// Returns the path of the job.
pub async fn start(
    connection: &Connection,
    unit: &UnitRef,
    mode: &str,
) -> Result<ObjectPath<'static>> {
    if mode.is_empty() {
        return Err(Error::EmptyMode);
    }
    let reply = connection
        .call_method(MethodCall::UnitStart { unit, mode })
        .await?;
    match reply {
        Reply::Error { name, message } if name == UNKNOWN_OBJECT => {
            Err(Error::NoSuchUnit(message))
        }
        reply => call::object_path(call::into_return(reply)?),
    }
}
