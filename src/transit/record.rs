//! Wire format of server-state broadcasts.
//!
//! ```text
//! byte 0:      record count N (0..=255)
//! N x record:  IPv4 address (4, network order), port (2, network order),
//!              state (1)
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::transit::{RemapState, ServerAddr};
use crate::utils::StripeKvError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum length of one bus message.
pub const MAX_MESSLEN: usize = 4096;

/// Maximum number of records one broadcast can carry.
pub const MAX_RECORDS: usize = u8::MAX as usize;

/// Encoded size of one record.
pub const RECORD_LEN: usize = 7;

/// State of one server as carried by a broadcast or an ack.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct StateRecord {
    pub server: ServerAddr,
    pub state: RemapState,
}

impl StateRecord {
    pub fn new(server: ServerAddr, state: RemapState) -> Self {
        StateRecord { server, state }
    }
}

/// Encodes a batch of state records. Batches above `MAX_RECORDS` are
/// rejected as a whole; nothing is produced for them.
pub fn encode_states(records: &[StateRecord]) -> Result<Bytes, StripeKvError> {
    if records.len() > MAX_RECORDS {
        return logged_err!(
            "too many servers in one state message: {} > {}",
            records.len(),
            MAX_RECORDS
        );
    }
    let len = 1 + records.len() * RECORD_LEN;
    debug_assert!(len <= MAX_MESSLEN);

    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(records.len() as u8);
    for record in records {
        buf.put_slice(&record.server.ip().octets());
        buf.put_u16(record.server.port());
        buf.put_u8(record.state.as_u8());
    }
    Ok(buf.freeze())
}

/// Decodes a state message. A truncated message is an error; a record with
/// an unknown state value is logged and skipped so that valid records in
/// the same batch still apply.
pub fn decode_states(mut buf: &[u8]) -> Result<Vec<StateRecord>, StripeKvError> {
    if buf.is_empty() {
        return Err(StripeKvError::msg("empty state message"));
    }
    let count = buf.get_u8() as usize;
    if buf.remaining() < count * RECORD_LEN {
        return Err(StripeKvError::msg(format!(
            "truncated state message: {} records need {} bytes, got {}",
            count,
            count * RECORD_LEN,
            buf.remaining()
        )));
    }

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        let raw = buf.get_u8();
        let server = SocketAddrV4::new(ip, port);
        match RemapState::try_from(raw) {
            Ok(state) => records.push(StateRecord { server, state }),
            Err(e) => {
                pf_warn!("skipping record of {}: {}", server, e);
            }
        }
    }
    if buf.has_remaining() {
        pf_debug!("ignoring {} trailing bytes in state message", buf.remaining());
    }
    Ok(records)
}
