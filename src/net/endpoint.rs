//! OS sockets behind a handle
//!
//! Opening, tuning and shutting down the descriptor a handle's worker runs
//! on. Every OS failure is logged here and mapped to one [`SocketError`].

use super::codec::{self, Discipline};
use super::{SocketError, SocketResult};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, TcpKeepalive, Type};
use std::io::{self, ErrorKind};
use std::net::{
    Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket,
};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

/// Write timeout applied to stream sockets
const SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Receive timeout used while a stream connect is in flight
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle time and probe interval for TCP keep-alive
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
const KEEPALIVE_PROBES: u32 = 1;

/// Queue length for pending connections on listeners
const CONNECTION_BACKLOG: i32 = 3;

/// The descriptor a handle is bound to while its role is active
#[derive(Debug)]
pub(crate) enum Endpoint {
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Endpoint::Listener(listener) => listener.as_fd(),
            Endpoint::Stream(stream) => stream.as_fd(),
            Endpoint::Datagram(socket) => socket.as_fd(),
        }
    }
}

impl Endpoint {
    /// Bind to `0.0.0.0:port`; stream disciplines also start listening
    pub(crate) fn listen(discipline: Discipline, port: u16) -> SocketResult<Self> {
        let socket = open(discipline)?;

        if discipline.is_stream()
            && let Err(e) = socket.set_reuse_address(true)
        {
            log::debug!("SO_REUSEADDR not applied: {}", e);
        }

        socket
            .set_nonblocking(true)
            .map_err(fail(SocketError::Open, "set non-blocking"))?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&SockAddr::from(addr))
            .map_err(fail(SocketError::Bind, "bind"))?;

        if !discipline.is_stream() {
            return Ok(Endpoint::Datagram(socket.into()));
        }

        socket
            .listen(CONNECTION_BACKLOG)
            .map_err(fail(SocketError::Listen, "listen"))?;
        Ok(Endpoint::Listener(socket.into()))
    }

    /// Connect to `host:port`, or to the broadcast address when `host` is
    /// `None` (datagram only)
    pub(crate) fn connect(
        discipline: Discipline,
        host: Option<&str>,
        port: u16,
    ) -> SocketResult<Self> {
        let target = match host {
            Some(host) => resolve(host, port)?,
            None if discipline.is_stream() => return Err(SocketError::Connect),
            None => SocketAddr::from((Ipv4Addr::BROADCAST, port)),
        };

        let socket = open(discipline)?;

        if !discipline.is_stream() {
            if host.is_none() {
                socket
                    .set_broadcast(true)
                    .map_err(fail(SocketError::Connect, "enable broadcast"))?;
            }
            connect_datagram(&socket, &SockAddr::from(target))?;
            return Ok(Endpoint::Datagram(socket.into()));
        }

        tune_stream(SockRef::from(&socket));

        let saved = socket.read_timeout().unwrap_or(None);
        if let Err(e) = socket.set_read_timeout(Some(CONNECT_TIMEOUT)) {
            log::debug!("connect timeout not applied: {}", e);
        }

        socket
            .connect_timeout(&SockAddr::from(target), CONNECT_TIMEOUT)
            .map_err(|e| {
                let code = if e.kind() == ErrorKind::TimedOut {
                    SocketError::Timeout
                } else {
                    SocketError::Connect
                };
                fail(code, "connect")(e)
            })?;

        if let Err(e) = socket.set_read_timeout(saved) {
            log::debug!("receive timeout not restored: {}", e);
        }

        Ok(Endpoint::Stream(socket.into()))
    }

    /// Take over a connection accepted by a listener
    pub(crate) fn adopt(stream: TcpStream) -> SocketResult<Self> {
        stream
            .set_nonblocking(false)
            .map_err(fail(SocketError::Accept, "set blocking"))?;
        tune_stream(SockRef::from(&stream));
        Ok(Endpoint::Stream(stream))
    }

    /// Write one message according to the discipline
    pub(crate) fn send(&self, discipline: Discipline, payload: &[u8]) -> SocketResult<()> {
        match self {
            Endpoint::Datagram(socket) => {
                codec::check_datagram_len(payload.len())?;
                match socket.send(payload) {
                    Ok(sent) if sent == payload.len() => Ok(()),
                    Ok(sent) => {
                        log::debug!("short datagram write: {} of {}", sent, payload.len());
                        Err(SocketError::Send)
                    }
                    Err(e) => Err(fail(SocketError::Send, "datagram send")(e)),
                }
            }
            Endpoint::Stream(stream) => {
                let sock = SockRef::from(stream);
                if let Err(e) = sock.set_cork(true) {
                    log::debug!("TCP_CORK not applied: {}", e);
                }

                let mut writer = stream;
                let result = codec::write_message(&mut writer, discipline, payload);

                if let Err(e) = sock.set_cork(false) {
                    log::debug!("TCP_CORK not cleared: {}", e);
                }
                result
            }
            Endpoint::Listener(_) => Err(SocketError::Protocol),
        }
    }

    /// Shut down both directions so a blocked worker wakes up
    pub(crate) fn shutdown(&self) -> SocketResult<()> {
        match SockRef::from(self).shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(fail(SocketError::Disconnect, "shutdown")(e)),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Listener(listener) => listener.local_addr().ok(),
            Endpoint::Stream(stream) => stream.local_addr().ok(),
            Endpoint::Datagram(socket) => socket.local_addr().ok(),
        }
    }
}

fn open(discipline: Discipline) -> SocketResult<Socket> {
    let (kind, protocol) = if discipline.is_stream() {
        (Type::STREAM, Protocol::TCP)
    } else {
        (Type::DGRAM, Protocol::UDP)
    };
    Socket::new(Domain::IPV4, kind, Some(protocol)).map_err(fail(SocketError::Open, "socket"))
}

fn resolve(host: &str, port: u16) -> SocketResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(fail(SocketError::Address, "resolve"))?
        .find(SocketAddr::is_ipv4)
        .ok_or(SocketError::Address)
}

fn connect_datagram(socket: &Socket, target: &SockAddr) -> SocketResult<()> {
    loop {
        match socket.connect(target) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(fail(SocketError::Connect, "connect")(e)),
        }
    }
}

/// Send timeout, keep-alive and no-delay for stream sockets
fn tune_stream(sock: SockRef<'_>) {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_INTERVAL)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_PROBES);

    let applied = sock
        .set_write_timeout(Some(SEND_TIMEOUT))
        .and_then(|()| sock.set_tcp_keepalive(&keepalive))
        .and_then(|()| sock.set_nodelay(true));

    if let Err(e) = applied {
        log::debug!("stream options not applied: {}", e);
    }
}

fn fail(code: SocketError, op: &'static str) -> impl FnOnce(io::Error) -> SocketError {
    move |e| {
        log::debug!("{} failed: {} ({})", op, e, code);
        code
    }
}
