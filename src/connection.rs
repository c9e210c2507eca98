use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zbus_names::{BusName, InterfaceName, MemberName};
use zvariant::ObjectPath;

use crate::call::{self, MethodCall};
use crate::wire::{self, DecodeError, Message, MessageType, Reply, Value};
use crate::{address, sasl, Error, Result};

/// How long a call waits for its reply unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

// Encoded messages waiting for the writer task.
const OUTGOING_QUEUE: usize = 64;

type Slot = oneshot::Sender<Result<Message>>;

/// Settings for a new [Connection].
#[derive(Debug, Clone)]
pub struct Builder {
    address: Option<String>,
    call_timeout: Duration,
}

/// A connection to the system bus.
///
/// Cloning is cheap and the clones share the underlying socket; calls
/// issued concurrently from several tasks are matched to their replies by
/// serial number.  The socket is closed when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: Arc<Pending>,
    serial: AtomicU32,
    call_timeout: Duration,
    unique_name: OnceLock<String>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Pending {
    state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    slots: HashMap<u32, Slot>,
    closed: bool,
}

// Removes the slot of a call however the call ends, so a timed out or
// abandoned call cannot leak its entry.
struct SlotGuard<'a> {
    pending: &'a Pending,
    serial: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self::system()
    }
}

impl Builder {
    /// Settings for the system bus with the default call timeout.
    pub fn system() -> Self {
        Self {
            address: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Use this D-Bus address instead of `$DBUS_SYSTEM_BUS_ADDRESS` or the
    /// well-known system bus socket.
    pub fn address<T: AsRef<str>>(mut self, address: T) -> Self {
        self.address = Some(address.as_ref().to_owned());
        self
    }

    /// Fail calls that get no reply within `d`.
    pub fn call_timeout(mut self, d: Duration) -> Self {
        self.call_timeout = d;
        self
    }

    /// Connect to the bus socket, authenticate and register on the bus.
    pub async fn connect(self) -> Result<Connection> {
        let address = self
            .address
            .clone()
            .unwrap_or_else(address::system_bus_address);
        let path = address::unix_socket_path(&address)?;
        debug!("connecting to the system bus at {}", path.display());
        let stream = UnixStream::connect(&path)
            .await
            .map_err(Error::DBusConnectionFail)?;
        self.handshake(stream).await
    }

    /// Authenticate over an already open stream and register on the bus.
    pub async fn handshake<S>(self, mut stream: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let uid = nix::unistd::getuid().as_raw();
        let guid = sasl::authenticate(&mut stream, uid).await?;
        debug!("authenticated to bus {}", guid);

        let connection = self.attach(stream);
        let name = call::string(call::into_return(
            connection.call_method(MethodCall::Hello).await?,
        )?)?;
        debug!("registered on the bus as {}", name);
        // Only this function sets the name, so the cell is still empty.
        let _ = connection.inner.unique_name.set(name);
        Ok(connection)
    }

    /// Wrap a stream that already speaks the message protocol, skipping
    /// authentication and `Hello`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn attach<S>(self, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let pending = Arc::new(Pending::default());
        let (outgoing, queue) = mpsc::channel(OUTGOING_QUEUE);
        let reader = tokio::spawn(dispatch(reader, Arc::clone(&pending)));
        tokio::spawn(write_frames(writer, queue, Arc::clone(&pending)));
        Connection {
            inner: Arc::new(Inner {
                outgoing,
                pending,
                serial: AtomicU32::new(1),
                call_timeout: self.call_timeout,
                unique_name: OnceLock::new(),
                reader,
            }),
        }
    }
}

impl Connection {
    /// Connect to the system bus with default settings.
    pub async fn system() -> Result<Self> {
        Builder::system().connect().await
    }

    /// The unique name the bus assigned to this connection, if it was
    /// registered with `Hello`.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(String::as_str)
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Number of calls waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().slots.len()
    }

    /// Call a method and wait for its reply.
    ///
    /// An error reply from the remote side is returned as
    /// [Reply::Error]; only transport failures and timeouts are `Err`.
    pub async fn call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        args: &[Value<'_>],
    ) -> Result<Reply> {
        BusName::try_from(destination).map_err(Error::InvalidName)?;
        InterfaceName::try_from(interface).map_err(Error::InvalidName)?;
        MemberName::try_from(member).map_err(Error::InvalidName)?;
        let path = ObjectPath::try_from(path.to_owned()).map_err(Error::DBusInvalidPath)?;
        self.send(Message::method_call(destination, path, interface, member, args)?)
            .await
    }

    pub(crate) async fn call_method(&self, call: MethodCall<'_>) -> Result<Reply> {
        self.send(call.to_message()?).await
    }

    fn next_serial(&self) -> u32 {
        loop {
            // Zero is not a valid serial, skip it on wrap around.
            let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    // The deadline covers queueing the message as well as the reply.  A
    // queued message is always written whole, even if the caller goes away.
    async fn send(&self, mut message: Message) -> Result<Reply> {
        let serial = self.next_serial();
        message.serial = serial;
        let bytes = message.encode()?;
        let (tx, rx) = oneshot::channel();
        let _slot = self.inner.pending.register(serial, tx)?;

        trace!(
            "call {}: {}.{} on {}",
            serial,
            message.interface.as_deref().unwrap_or_default(),
            message.member.as_deref().unwrap_or_default(),
            message.destination.as_deref().unwrap_or_default(),
        );
        let exchange = async {
            self.inner
                .outgoing
                .send(bytes)
                .await
                .map_err(|_| Error::Disconnected)?;
            match rx.await {
                Ok(reply) => reply,
                Err(oneshot::Canceled) => Err(Error::Disconnected),
            }
        };

        let after = self.inner.call_timeout;
        let reply = match tokio::time::timeout(after, exchange).await {
            Ok(reply) => reply?,
            Err(_) => {
                debug!("call {} timed out after {:?}", serial, after);
                return Err(Error::Timeout { serial, after });
            }
        };
        Ok(Reply::from_message(&reply)?)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("call_timeout", &self.inner.call_timeout)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Pending {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, serial: u32, slot: Slot) -> Result<SlotGuard<'_>> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Disconnected);
        }
        state.slots.insert(serial, slot);
        Ok(SlotGuard {
            pending: self,
            serial,
        })
    }

    fn take(&self, serial: u32) -> Option<Slot> {
        self.lock().slots.remove(&serial)
    }

    // Fail every pending call and refuse new ones.
    fn close(&self, reason: &Error) {
        let slots = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.slots)
        };
        for (_, slot) in slots {
            let error = match reason {
                Error::Decode(e) => Error::Decode(e.clone()),
                _ => Error::Disconnected,
            };
            let _ = slot.send(Err(error));
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.take(self.serial);
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut queue: mpsc::Receiver<Vec<u8>>,
    pending: Arc<Pending>,
) {
    while let Some(frame) = queue.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            warn!("cannot write to the bus: {}", e);
            pending.close(&Error::Io(e));
            return;
        }
    }
    trace!("connection dropped, writer stopped");
}

async fn dispatch<R: AsyncRead + Unpin>(mut reader: R, pending: Arc<Pending>) {
    let reason = loop {
        let frame = match wire::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        match Message::decode(&frame) {
            Ok(message) => route(&pending, message),
            Err(DecodeError::UnknownMessageType(code)) => {
                debug!("ignoring message of unknown type {}", code);
            }
            Err(e) => break Error::Decode(e),
        }
    };
    match &reason {
        Error::Io(e) if e.kind() == ErrorKind::UnexpectedEof => {
            debug!("the bus closed the connection")
        }
        _ => warn!("dbus connection failed: {}", reason),
    }
    pending.close(&reason);
}

fn route(pending: &Pending, message: Message) {
    match (message.message_type, message.reply_serial) {
        (MessageType::MethodReturn | MessageType::Error, Some(serial)) => {
            match pending.take(serial) {
                Some(slot) => {
                    trace!("reply to call {}", serial);
                    if slot.send(Ok(message)).is_err() {
                        trace!("call {} was abandoned", serial);
                    }
                }
                None => debug!("dropping reply to call {} with no pending slot", serial),
            }
        }
        (message_type, _) => trace!(
            "ignoring {:?} {}",
            message_type,
            message.member.as_deref().unwrap_or_default()
        ),
    }
}
