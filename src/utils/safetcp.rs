//! Safe TCP bind/connect/read/write helper functions used by the bus daemon
//! and its remote endpoints.

use std::io::ErrorKind;
use std::marker::Unpin;
use std::net::{Ipv4Addr, SocketAddr};

use crate::utils::StripeKvError;

use bytes::{Bytes, BytesMut};

use serde::Serialize;
use serde::de::DeserializeOwned;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Length of the frame header carrying the object length.
const LEN_BYTES: usize = 8;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; upon returning, the consumed bytes are
///     removed from the read buffer
///   - `Err(err)` if any unexpected error occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and those two methods are not cancellation-safe. Bytes already read
/// before a cancellation stay in the read buffer and are continued by future
/// invocations.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, StripeKvError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < LEN_BYTES {
        read_buf.reserve(LEN_BYTES - read_buf.capacity());
    }
    while read_buf.len() < LEN_BYTES {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(StripeKvError::msg("connection closed by peer"));
        }
    }
    let mut len_bytes = [0u8; LEN_BYTES];
    len_bytes.copy_from_slice(&read_buf[..LEN_BYTES]);
    let obj_len = usize::try_from(u64::from_be_bytes(len_bytes))
        .map_err(|e| StripeKvError::msg(e.to_string()))?;

    // then read the obj itself
    let obj_end = LEN_BYTES + obj_len;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(StripeKvError::msg("connection closed by peer"));
        }
    }
    let obj = rmp_serde::decode::from_slice(&read_buf[LEN_BYTES..obj_end])?;

    // no further cancellation possible past this point; discard bytes used
    if read_buf.len() > obj_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[obj_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(obj)
}

/// Sends an object of type `T` to TCP writable connection `conn_write`, using
/// `write_buf` as buffer storage for partial writes. Returns:
///   - `Ok(true)` if successful
///   - `Ok(false)` if socket full and may block; in this case, bytes of the
///     input object are saved in the write buffer, and the next calls must
///     give `obj == None` to indicate retrying until success
///   - `Err(err)` if any unexpected error occurs
///
/// DEADLOCK AVOIDANCE: we avoid `write_u64()` and `write_all()` because if
/// both ends of a connection with full buffers are writing, both would block.
pub(crate) fn safe_tcp_write<T, Conn>(
    write_buf: &mut BytesMut,
    write_buf_cursor: &mut usize,
    conn_write: &Conn,
    obj: Option<&T>,
) -> Result<bool, StripeKvError>
where
    T: Serialize,
    Conn: AsRef<TcpStream>,
{
    match obj {
        Some(_) if !write_buf.is_empty() => {
            return Err(StripeKvError::msg(
                "attempting new object while should retry",
            ));
        }
        None if write_buf.is_empty() => {
            return Err(StripeKvError::msg(
                "attempting to retry while buffer is empty",
            ));
        }
        Some(obj) => {
            debug_assert_eq!(*write_buf_cursor, 0);
            let write_bytes = rmp_serde::encode::to_vec(obj)?;
            let write_len = write_bytes.len() as u64;
            write_buf.extend_from_slice(&write_len.to_be_bytes());
            write_buf.extend_from_slice(write_bytes.as_slice());
        }
        None => {
            // retrying last unsuccessful write
            debug_assert!(*write_buf_cursor < write_buf.len());
        }
    }

    // try until the length + the object are all written
    while *write_buf_cursor < write_buf.len() {
        match conn_write
            .as_ref()
            .try_write(&write_buf[*write_buf_cursor..])
        {
            Ok(n) => {
                *write_buf_cursor += n;
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
    }

    write_buf.clear();
    *write_buf_cursor = 0;
    Ok(true)
}

/// Wrapper over tokio `TcpSocket::listen()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, StripeKvError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let bind_addr: SocketAddr = match bind_addr {
            SocketAddr::V4(v4) if v4.ip().is_loopback() => bind_addr,
            _ => (Ipv4Addr::UNSPECIFIED, bind_addr.port()).into(),
        };
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpSocket::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, StripeKvError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}
