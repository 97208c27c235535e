//! Threaded socket runtime
//!
//! Every [`SocketHandle`] owns one worker thread for its whole life. `listen`,
//! `connect` and `accept` hand the worker a role, the worker runs that role's
//! I/O and reports what happens through the handle's callback, then falls
//! back to idle so the handle can be reused.
//!
//! The runtime is organized into:
//! - `codec`: wire disciplines, frame headers and the receive buffer
//! - `endpoint`: OS sockets and their options
//! - `handle`: the public socket object and its teardown
//! - `worker`: the per-handle role state machine

use std::net::{SocketAddr, TcpStream};
use thiserror::Error;

mod codec;
mod endpoint;
mod handle;
mod worker;


pub use codec::{
    DATAGRAM_BUFFER_SIZE, Discipline, FRAME_HEADER_LEN, INITIAL_BUFFER_SIZE, MAX_DATAGRAM_SIZE,
    RecvBuffer, check_datagram_len, decode_frame_header, encode_frame_header,
};
pub use handle::{SocketContext, SocketHandle};
pub use worker::Role;

pub type SocketResult<T> = std::result::Result<T, SocketError>;

/// Socket runtime error codes
///
/// Synchronous calls return these directly. Conditions detected by the
/// worker arrive through the callback as [`SocketEvent::Error`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    #[error("couldn't open socket")]
    Open,
    #[error("connecting to remote socket failed")]
    Connect,
    #[error("error while listening on socket")]
    Listen,
    #[error("couldn't bind to socket")]
    Bind,
    #[error("error while accepting connection")]
    Accept,
    #[error("couldn't read from socket")]
    Receive,
    #[error("failed to send datagram")]
    Send,
    #[error("peer closed connection")]
    Closed,
    #[error("out of memory")]
    Buffer,
    #[error("hostname resolution failed")]
    Address,
    #[error("error while closing socket")]
    Disconnect,
    #[error("protocol mismatch")]
    Protocol,
    #[error("could not start worker thread")]
    Thread,
    #[error("timeout error")]
    Timeout,
    #[error("socket already in use")]
    Busy,
    #[error("invalid argument")]
    InvalidArgument,
}

impl SocketError {
    /// Stable numeric code, suitable for log lines and exit statuses
    pub fn code(self) -> u8 {
        match self {
            SocketError::Open => 1,
            SocketError::Connect => 2,
            SocketError::Listen => 3,
            SocketError::Bind => 4,
            SocketError::Accept => 5,
            SocketError::Receive => 6,
            SocketError::Send => 7,
            SocketError::Closed => 8,
            SocketError::Buffer => 9,
            SocketError::Address => 10,
            SocketError::Disconnect => 11,
            SocketError::Protocol => 12,
            SocketError::Thread => 13,
            SocketError::Timeout => 14,
            SocketError::Busy => 15,
            SocketError::InvalidArgument => 16,
        }
    }
}

/// A connection accepted by a listening handle.
///
/// Hand it to [`SocketContext::accept`] on a fresh handle to start reading
/// from it. Dropping it closes the connection.
#[derive(Debug)]
pub struct Incoming {
    pub(crate) stream: TcpStream,
    pub(crate) discipline: Discipline,
    peer: SocketAddr,
}

impl Incoming {
    pub(crate) fn new(stream: TcpStream, discipline: Discipline, peer: SocketAddr) -> Self {
        Self {
            stream,
            discipline,
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Discipline of the listener that accepted this connection
    pub fn discipline(&self) -> Discipline {
        self.discipline
    }
}

/// Events delivered to a handle's callback, always on the handle's worker thread
#[derive(Debug)]
pub enum SocketEvent<'a> {
    /// A listening handle accepted a connection
    Accept {
        peer: SocketAddr,
        connection: Incoming,
    },
    /// One message (framed), one read (raw) or one datagram arrived.
    ///
    /// `data` borrows the handle's receive buffer and is only valid for the
    /// duration of the callback.
    Receive {
        peer: Option<SocketAddr>,
        data: &'a [u8],
    },
    /// The worker hit an I/O condition. Terminal conditions are reported once
    /// and the handle returns to [`Role::Unknown`].
    Error(SocketError),
}
