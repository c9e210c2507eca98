//! Framing of D-Bus messages.
//!
//! The header layout, header fields and framing live here; values are
//! marshalled with `zvariant`.  Messages are encoded little-endian, but both
//! byte orders are decoded.

use byteorder::{ByteOrder, BE, LE};
use tokio::io::{AsyncRead, AsyncReadExt};
use zvariant::{EncodingContext, ObjectPath, OwnedValue, Signature, Structure, StructureBuilder};

use crate::{Error, Result};

pub use zvariant::Value;

/// The largest message the D-Bus specification allows.
pub const MAX_MESSAGE_LEN: usize = 1 << 27;

/// The caller does not want a reply.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;
/// The bus must not launch an owner for the destination name.
pub const FLAG_NO_AUTO_START: u8 = 0x2;
/// The caller is prepared to wait for an interactive authorization prompt.
pub const FLAG_ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x4;

const PROTOCOL_VERSION: u8 = 1;
const FIXED_HEADER_LEN: usize = 16;

mod field {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
}

// Endianness, type, flags, version, body length, serial and header fields.
type Header<V> = (u8, u8, u8, u8, u32, u32, Vec<(u8, V)>);

/// A malformed or unsupported message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,
    #[error("invalid endianness marker {0:#04x}")]
    InvalidEndianness(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("invalid signature {0:?}")]
    InvalidSignature(String),
    #[error("message of {0} bytes exceeds the maximum length")]
    TooLarge(usize),
    #[error("serial number must not be zero")]
    ZeroSerial,
    #[error("header field {0} has the wrong type")]
    InvalidHeaderField(u8),
    #[error("missing {0} header field")]
    MissingHeaderField(&'static str),
    #[error("expected a reply, got a {0:?}")]
    NotAReply(MessageType),
    #[error("expected a body of type {expected:?}, got {found:?}")]
    UnexpectedSignature {
        expected: &'static str,
        found: String,
    },
    #[error("malformed message: {0}")]
    Marshal(#[from] zvariant::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    fn from_code(code: u8) -> std::result::Result<Self, DecodeError> {
        match code {
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::MethodReturn),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

/// The concatenated signature of a list of values.
pub fn signature_of(values: &[Value<'_>]) -> String {
    values
        .iter()
        .map(|v| v.value_signature().as_str().to_owned())
        .collect()
}

fn into_static(value: Value<'_>) -> Value<'static> {
    value.to_owned().into()
}

// A body is marshalled like a struct of its arguments, minus the
// parentheses in its signature.
fn marshal_body<B: ByteOrder>(args: &[Value<'_>]) -> Result<(Signature<'static>, Vec<u8>)> {
    if args.is_empty() {
        return Ok((Signature::from_string_unchecked(String::new()), Vec::new()));
    }
    let signature = Signature::try_from(signature_of(args)).map_err(Error::Encode)?;
    let body = args
        .iter()
        .cloned()
        .fold(StructureBuilder::new(), |b, arg| b.append_field(arg))
        .build();
    let bytes = zvariant::to_bytes(EncodingContext::<B>::new_dbus(0), &body)
        .map_err(Error::Encode)?;
    Ok((signature, bytes))
}

fn read_len<B: ByteOrder>(buf: &[u8], at: usize) -> usize {
    B::read_u32(&buf[at..at + 4]) as usize
}

fn padding(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// A D-Bus message with its body kept in marshalled form.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: u8,
    pub serial: u32,
    pub path: Option<ObjectPath<'static>>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    signature: Signature<'static>,
    body: Vec<u8>,
    big_endian: bool,
}

impl Message {
    fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: 0,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::from_string_unchecked(String::new()),
            body: Vec::new(),
            big_endian: false,
        }
    }

    fn with_body(mut self, args: &[Value<'_>]) -> Result<Self> {
        let (signature, body) = marshal_body::<LE>(args)?;
        self.signature = signature;
        self.body = body;
        self.big_endian = false;
        Ok(self)
    }

    /// A method call.  The serial is left at zero for the sender to fill in.
    pub fn method_call(
        destination: &str,
        path: ObjectPath<'static>,
        interface: &str,
        member: &str,
        args: &[Value<'_>],
    ) -> Result<Self> {
        let mut message = Self::new(MessageType::MethodCall);
        message.destination = Some(destination.to_owned());
        message.path = Some(path);
        message.interface = Some(interface.to_owned());
        message.member = Some(member.to_owned());
        message.with_body(args)
    }

    /// A successful reply to `call`.
    pub fn method_return(call: &Message, args: &[Value<'_>]) -> Result<Self> {
        let mut message = Self::new(MessageType::MethodReturn);
        message.reply_serial = Some(call.serial);
        message.destination = call.sender.clone();
        message.with_body(args)
    }

    /// An error reply to `call`.
    pub fn error(call: &Message, name: &str, text: &str) -> Result<Self> {
        let mut message = Self::new(MessageType::Error);
        message.reply_serial = Some(call.serial);
        message.destination = call.sender.clone();
        message.error_name = Some(name.to_owned());
        message.with_body(&[Value::from(text)])
    }

    /// Signature of the body.
    pub fn signature(&self) -> &str {
        self.signature.as_str()
    }

    /// Decode the body.
    pub fn body(&self) -> std::result::Result<Vec<Value<'static>>, DecodeError> {
        if self.signature.is_empty() {
            return Ok(Vec::new());
        }
        if self.big_endian {
            self.body_with::<BE>()
        } else {
            self.body_with::<LE>()
        }
    }

    fn body_with<B: ByteOrder>(&self) -> std::result::Result<Vec<Value<'static>>, DecodeError> {
        let signature = Signature::try_from(format!("({})", self.signature.as_str()))
            .map_err(|_| DecodeError::InvalidSignature(self.signature.as_str().to_owned()))?;
        let body: Structure<'_> = zvariant::from_slice_for_dynamic_signature(
            &self.body,
            EncodingContext::<B>::new_dbus(0),
            &signature,
        )?;
        Ok(body.into_fields().into_iter().map(into_static).collect())
    }

    fn header_fields(&self) -> Vec<(u8, Value<'_>)> {
        let mut fields = Vec::new();
        if let Some(path) = &self.path {
            fields.push((field::PATH, Value::ObjectPath(path.clone())));
        }
        for (code, text) in [
            (field::INTERFACE, &self.interface),
            (field::MEMBER, &self.member),
            (field::ERROR_NAME, &self.error_name),
            (field::DESTINATION, &self.destination),
            (field::SENDER, &self.sender),
        ] {
            if let Some(text) = text {
                fields.push((code, Value::from(text.as_str())));
            }
        }
        if let Some(serial) = self.reply_serial {
            fields.push((field::REPLY_SERIAL, Value::U32(serial)));
        }
        if !self.signature.is_empty() {
            fields.push((field::SIGNATURE, Value::Signature(self.signature.clone())));
        }
        fields
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.big_endian {
            self.encode_with::<BE>(b'B')
        } else {
            self.encode_with::<LE>(b'l')
        }
    }

    fn encode_with<B: ByteOrder>(&self, endianness: u8) -> Result<Vec<u8>> {
        let header: Header<Value<'_>> = (
            endianness,
            self.message_type as u8,
            self.flags,
            PROTOCOL_VERSION,
            self.body.len() as u32,
            self.serial,
            self.header_fields(),
        );
        let mut bytes = zvariant::to_bytes(EncodingContext::<B>::new_dbus(0), &header)
            .map_err(Error::Encode)?;
        bytes.resize(bytes.len() + padding(bytes.len()), 0);
        bytes.extend_from_slice(&self.body);
        Ok(bytes)
    }

    /// Decode one complete message.
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, DecodeError> {
        match buf.first() {
            Some(b'l') => Self::decode_with::<LE>(buf),
            Some(b'B') => Self::decode_with::<BE>(buf),
            Some(&other) => Err(DecodeError::InvalidEndianness(other)),
            None => Err(DecodeError::Truncated),
        }
    }

    fn decode_with<B: ByteOrder>(buf: &[u8]) -> std::result::Result<Self, DecodeError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut message = Self::new(MessageType::from_code(buf[1])?);
        if buf[3] != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(buf[3]));
        }
        let body_len = read_len::<B>(buf, 4);
        let header_end = FIXED_HEADER_LEN
            .checked_add(read_len::<B>(buf, 12))
            .ok_or(DecodeError::Truncated)?;
        let body_start = header_end
            .checked_add(padding(header_end))
            .ok_or(DecodeError::Truncated)?;
        let body_end = body_start
            .checked_add(body_len)
            .filter(|&end| end <= buf.len())
            .ok_or(DecodeError::Truncated)?;

        // Header fields may not run past the declared length of the array.
        let (_, _, flags, _, _, serial, fields): Header<OwnedValue> =
            zvariant::from_slice(&buf[..header_end], EncodingContext::<B>::new_dbus(0))?;
        if serial == 0 {
            return Err(DecodeError::ZeroSerial);
        }
        message.flags = flags;
        message.serial = serial;
        message.big_endian = buf[0] == b'B';
        for (code, value) in fields {
            message.set_header_field(code, value.into())?;
        }
        message.body = buf[body_start..body_end].to_vec();
        message.validate()?;
        Ok(message)
    }

    fn set_header_field(
        &mut self,
        code: u8,
        value: Value<'static>,
    ) -> std::result::Result<(), DecodeError> {
        match (code, value) {
            (field::PATH, Value::ObjectPath(path)) => self.path = Some(path),
            (field::INTERFACE, Value::Str(s)) => self.interface = Some(s.into()),
            (field::MEMBER, Value::Str(s)) => self.member = Some(s.into()),
            (field::ERROR_NAME, Value::Str(s)) => self.error_name = Some(s.into()),
            (field::REPLY_SERIAL, Value::U32(serial)) => self.reply_serial = Some(serial),
            (field::DESTINATION, Value::Str(s)) => self.destination = Some(s.into()),
            (field::SENDER, Value::Str(s)) => self.sender = Some(s.into()),
            (field::SIGNATURE, Value::Signature(s)) => self.signature = s,
            (field::PATH..=field::SIGNATURE, _) => {
                return Err(DecodeError::InvalidHeaderField(code))
            }
            // UNIX_FDS and fields from future protocol versions.
            _ => {}
        }
        Ok(())
    }

    fn validate(&self) -> std::result::Result<(), DecodeError> {
        let missing = match self.message_type {
            MessageType::MethodCall if self.path.is_none() => Some("PATH"),
            MessageType::MethodCall if self.member.is_none() => Some("MEMBER"),
            MessageType::Signal if self.path.is_none() => Some("PATH"),
            MessageType::Signal if self.interface.is_none() => Some("INTERFACE"),
            MessageType::Signal if self.member.is_none() => Some("MEMBER"),
            MessageType::Error if self.error_name.is_none() => Some("ERROR_NAME"),
            MessageType::Error | MessageType::MethodReturn if self.reply_serial.is_none() => {
                Some("REPLY_SERIAL")
            }
            _ => None,
        };
        match missing {
            Some(name) => Err(DecodeError::MissingHeaderField(name)),
            None => Ok(()),
        }
    }
}

/// The outcome of a method call as reported by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Return(Vec<Value<'static>>),
    Error { name: String, message: String },
}

impl Reply {
    pub fn from_message(message: &Message) -> std::result::Result<Self, DecodeError> {
        match message.message_type {
            MessageType::MethodReturn => Ok(Reply::Return(message.body()?)),
            MessageType::Error => {
                let name = message.error_name.clone().unwrap_or_default();
                let text = match message.body()?.into_iter().next() {
                    Some(Value::Str(text)) => text.into(),
                    _ => String::new(),
                };
                Ok(Reply::Error {
                    name,
                    message: text,
                })
            }
            other => Err(DecodeError::NotAReply(other)),
        }
    }
}

/// Encode a method call with the given serial number.
pub fn encode_call(
    serial: u32,
    destination: &str,
    path: ObjectPath<'static>,
    interface: &str,
    member: &str,
    args: &[Value<'_>],
) -> Result<Vec<u8>> {
    let mut message = Message::method_call(destination, path, interface, member, args)?;
    message.serial = serial;
    message.encode()
}

/// Decode a method return or error message.
pub fn decode_reply(bytes: &[u8]) -> std::result::Result<Reply, DecodeError> {
    Reply::from_message(&Message::decode(bytes)?)
}

/// Total length of a message, computed from its fixed 16-byte header.
pub fn frame_len(fixed: &[u8; FIXED_HEADER_LEN]) -> std::result::Result<usize, DecodeError> {
    let (body, fields) = match fixed[0] {
        b'l' => (read_len::<LE>(fixed, 4), read_len::<LE>(fixed, 12)),
        b'B' => (read_len::<BE>(fixed, 4), read_len::<BE>(fixed, 12)),
        other => return Err(DecodeError::InvalidEndianness(other)),
    };
    let len = FIXED_HEADER_LEN
        .saturating_add(fields)
        .saturating_add(padding(fields))
        .saturating_add(body);
    if len > MAX_MESSAGE_LEN {
        return Err(DecodeError::TooLarge(len));
    }
    Ok(len)
}

/// Read exactly one message from `reader`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    reader.read_exact(&mut fixed).await.map_err(Error::Io)?;
    let len = frame_len(&fixed)?;
    let mut frame = vec![0u8; len];
    frame[..FIXED_HEADER_LEN].copy_from_slice(&fixed);
    reader
        .read_exact(&mut frame[FIXED_HEADER_LEN..])
        .await
        .map_err(Error::Io)?;
    Ok(frame)
}
