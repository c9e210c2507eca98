//! The fixed set of remote methods this crate invokes, and the helpers
//! turning their replies into typed values.

use zvariant::ObjectPath;

use crate::unit::UnitRef;
use crate::wire::{self, DecodeError, Message, Reply, Value};
use crate::{Error, Result};

pub(crate) const BUS_SERVICE: &str = "org.freedesktop.DBus";
pub(crate) const BUS_PATH: &str = "/org/freedesktop/DBus";
pub(crate) const BUS_INTERFACE: &str = "org.freedesktop.DBus";
pub(crate) const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub(crate) const SYSTEMD_SERVICE: &str = "org.freedesktop.systemd1";
pub(crate) const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
pub(crate) const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
pub(crate) const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";
pub(crate) const SERVICE_INTERFACE: &str = "org.freedesktop.systemd1.Service";

pub(crate) const LOGIN_SERVICE: &str = "org.freedesktop.login1";
pub(crate) const LOGIN_PATH: &str = "/org/freedesktop/login1";
pub(crate) const LOGIN_MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";

pub(crate) const NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";
pub(crate) const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
const JOB_QUEUE_ERRORS: [&str; 3] = [
    "org.freedesktop.systemd1.TransactionIsDestructive",
    "org.freedesktop.systemd1.TransactionJobsConflicting",
    "org.freedesktop.systemd1.TransactionOrderIsCyclic",
];

/// A remote method call, one variant per supported method.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MethodCall<'a> {
    Hello,
    GetUnit {
        unit: &'a str,
    },
    StartUnit {
        unit: &'a str,
        mode: &'a str,
    },
    StopUnit {
        unit: &'a str,
        mode: &'a str,
    },
    RestartUnit {
        unit: &'a str,
        mode: &'a str,
    },
    UnitStart {
        unit: &'a UnitRef,
        mode: &'a str,
    },
    GetProperty {
        unit: &'a UnitRef,
        interface: &'static str,
        property: &'static str,
    },
    Reboot {
        interactive: bool,
    },
    PowerOff {
        interactive: bool,
    },
}

impl<'a> MethodCall<'a> {
    fn destination(&self) -> &'static str {
        match self {
            MethodCall::Hello => BUS_SERVICE,
            MethodCall::Reboot { .. } | MethodCall::PowerOff { .. } => LOGIN_SERVICE,
            _ => SYSTEMD_SERVICE,
        }
    }

    fn path(&self) -> &'a str {
        match *self {
            MethodCall::Hello => BUS_PATH,
            MethodCall::Reboot { .. } | MethodCall::PowerOff { .. } => LOGIN_PATH,
            MethodCall::UnitStart { unit, .. } | MethodCall::GetProperty { unit, .. } => {
                unit.path().as_str()
            }
            _ => SYSTEMD_PATH,
        }
    }

    fn interface(&self) -> &'static str {
        match self {
            MethodCall::Hello => BUS_INTERFACE,
            MethodCall::GetUnit { .. }
            | MethodCall::StartUnit { .. }
            | MethodCall::StopUnit { .. }
            | MethodCall::RestartUnit { .. } => MANAGER_INTERFACE,
            MethodCall::UnitStart { .. } => UNIT_INTERFACE,
            MethodCall::GetProperty { .. } => PROPERTIES_INTERFACE,
            MethodCall::Reboot { .. } | MethodCall::PowerOff { .. } => LOGIN_MANAGER_INTERFACE,
        }
    }

    fn member(&self) -> &'static str {
        match self {
            MethodCall::Hello => "Hello",
            MethodCall::GetUnit { .. } => "GetUnit",
            MethodCall::StartUnit { .. } => "StartUnit",
            MethodCall::StopUnit { .. } => "StopUnit",
            MethodCall::RestartUnit { .. } => "RestartUnit",
            MethodCall::UnitStart { .. } => "Start",
            MethodCall::GetProperty { .. } => "Get",
            MethodCall::Reboot { .. } => "Reboot",
            MethodCall::PowerOff { .. } => "PowerOff",
        }
    }

    fn args(&self) -> Vec<Value<'a>> {
        let s = |s: &'a str| Value::from(s);
        match *self {
            MethodCall::Hello => vec![],
            MethodCall::GetUnit { unit } => vec![s(unit)],
            MethodCall::StartUnit { unit, mode }
            | MethodCall::StopUnit { unit, mode }
            | MethodCall::RestartUnit { unit, mode } => vec![s(unit), s(mode)],
            MethodCall::UnitStart { mode, .. } => vec![s(mode)],
            MethodCall::GetProperty {
                interface,
                property,
                ..
            } => vec![s(interface), s(property)],
            MethodCall::Reboot { interactive } | MethodCall::PowerOff { interactive } => {
                vec![Value::Bool(interactive)]
            }
        }
    }

    fn flags(&self) -> u8 {
        match *self {
            MethodCall::Reboot { interactive: true }
            | MethodCall::PowerOff { interactive: true } => {
                wire::FLAG_ALLOW_INTERACTIVE_AUTHORIZATION
            }
            _ => 0,
        }
    }

    pub(crate) fn to_message(self) -> Result<Message> {
        let path = ObjectPath::try_from(self.path().to_owned()).map_err(Error::DBusInvalidPath)?;
        let mut message = Message::method_call(
            self.destination(),
            path,
            self.interface(),
            self.member(),
            &self.args(),
        )?;
        message.flags |= self.flags();
        Ok(message)
    }
}

/// Map a bus error reply to the crate error.
pub(crate) fn remote_error(name: String, message: String) -> Error {
    if name == NO_SUCH_UNIT {
        Error::NoSuchUnit(message)
    } else if JOB_QUEUE_ERRORS.contains(&name.as_str()) {
        Error::JobQueue { name, message }
    } else {
        Error::MethodError { name, message }
    }
}

pub(crate) fn into_return(reply: Reply) -> Result<Vec<Value<'static>>> {
    match reply {
        Reply::Return(values) => Ok(values),
        Reply::Error { name, message } => Err(remote_error(name, message)),
    }
}

fn mismatch(expected: &'static str, found: &Value<'_>) -> Error {
    Error::Decode(DecodeError::UnexpectedSignature {
        expected,
        found: found.value_signature().to_string(),
    })
}

fn single(values: Vec<Value<'static>>, expected: &'static str) -> Result<Value<'static>> {
    let found = wire::signature_of(&values);
    let mut values = values.into_iter();
    match (values.next(), values.next()) {
        (Some(value), None) => Ok(value),
        _ => Err(Error::Decode(DecodeError::UnexpectedSignature { expected, found })),
    }
}

pub(crate) fn object_path(values: Vec<Value<'static>>) -> Result<ObjectPath<'static>> {
    match single(values, "o")? {
        Value::ObjectPath(path) => Ok(path),
        other => Err(mismatch("o", &other)),
    }
}

pub(crate) fn string(values: Vec<Value<'static>>) -> Result<String> {
    expect_str(single(values, "s")?)
}

/// Unwrap the variant returned by `org.freedesktop.DBus.Properties.Get`.
pub(crate) fn property(values: Vec<Value<'static>>) -> Result<Value<'static>> {
    match single(values, "v")? {
        Value::Value(inner) => Ok(*inner),
        other => Err(mismatch("v", &other)),
    }
}

pub(crate) fn expect_str(value: Value<'_>) -> Result<String> {
    match value {
        Value::Str(s) => Ok(s.as_str().to_owned()),
        other => Err(mismatch("s", &other)),
    }
}

pub(crate) fn expect_i32(value: Value<'_>) -> Result<i32> {
    match value {
        Value::I32(i) => Ok(i),
        other => Err(mismatch("i", &other)),
    }
}

pub(crate) fn expect_str_array(value: Value<'_>) -> Result<Vec<String>> {
    match value {
        Value::Array(items) if items.element_signature() == "s" => {
            items.get().iter().cloned().map(expect_str).collect()
        }
        other => Err(mismatch("as", &other)),
    }
}
