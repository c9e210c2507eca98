//! The client side of the D-Bus SASL handshake, `EXTERNAL` mechanism only.

use data_encoding::HEXLOWER;
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

const MAX_LINE_LEN: usize = 16 * 1024;

/// Authenticate as `uid` and switch the stream to the message protocol.
///
/// Returns the server GUID.
pub async fn authenticate<S>(stream: &mut S, uid: u32) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth = format!(
        "AUTH EXTERNAL {}\r\n",
        HEXLOWER.encode(uid.to_string().as_bytes())
    );
    // The protocol starts with a single NUL byte, which carries the
    // credentials on Unix sockets.
    send(stream, b"\0").await?;
    send(stream, auth.as_bytes()).await?;

    let line = read_line(stream).await?;
    trace!("sasl: {}", line);
    let guid = match line.split_once(' ') {
        Some(("OK", guid)) => guid.trim().to_owned(),
        _ if line.starts_with("REJECTED") => return Err(Error::AuthRejected(line)),
        _ => return Err(Error::AuthRejected(format!("unexpected reply {:?}", line))),
    };

    send(stream, b"BEGIN\r\n").await?;
    Ok(guid)
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(Error::DBusConnectionFail)
}

// Read one CRLF terminated line byte by byte, so nothing past BEGIN is
// consumed from the stream.
async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut line = Vec::new();
    while !line.ends_with(b"\r\n") {
        if line.len() >= MAX_LINE_LEN {
            return Err(Error::AuthRejected("reply line too long".to_owned()));
        }
        let b = stream.read_u8().await.map_err(Error::DBusConnectionFail)?;
        line.push(b);
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).map_err(|_| Error::AuthRejected("reply is not UTF-8".to_owned()))
}
