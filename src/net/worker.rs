//! Per-handle worker thread
//!
//! The worker idles until the handle is given a role, runs that role's loop
//! until the session ends, then drops back to idle. It only exits when the
//! handle is deleted.

use super::codec::{self, DATAGRAM_BUFFER_SIZE, Discipline, RecvBuffer};
use super::endpoint::Endpoint;
use super::handle::{Callback, SocketContext};
use super::{Incoming, SocketError, SocketEvent, SocketResult};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsFd;
use std::thread;
use std::time::Duration;

/// How long the idle and connected states sleep between checks
pub(crate) const IDLE_POLL: Duration = Duration::from_millis(5);

/// Readiness wait for listeners and datagram receivers, in milliseconds
const POLL_INTERVAL_MS: u8 = 5;

/// What the worker is currently doing. Anything but `Unknown` means busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    /// Idle, no descriptor
    Unknown = 0,
    /// Accepting connections on a stream listener
    Listen = 1,
    /// Reading from a connected or accepted stream
    AcceptRead = 2,
    /// Receiving on a bound datagram socket
    DatagramReceive = 3,
    /// Datagram socket connected for sending, no receive loop
    Connected = 4,
}

impl Role {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Role::Listen,
            2 => Role::AcceptRead,
            3 => Role::DatagramReceive,
            4 => Role::Connected,
            _ => Role::Unknown,
        }
    }
}

pub(crate) struct Worker {
    context: SocketContext,
    callback: Callback,
    buffer: RecvBuffer,
}

impl Worker {
    pub(crate) fn new(context: SocketContext, callback: Callback) -> Self {
        Self {
            context,
            callback,
            buffer: RecvBuffer::new(),
        }
    }

    pub(crate) fn run(mut self) {
        self.context.inner.set_capacity(self.buffer.capacity());

        while let Some(role) = self.wait_for_role() {
            let outcome = match self.context.inner.endpoint() {
                Some(endpoint) => self.dispatch(role, &endpoint),
                None => Ok(()),
            };

            let interrupted = self.context.inner.session_over();
            self.context.inner.finish_session();
            log::debug!(
                "{} socket left {:?} ({:?})",
                self.context.discipline().as_str(),
                role,
                outcome
            );

            if let Err(error) = outcome
                && !interrupted
            {
                self.emit(SocketEvent::Error(error));
            }
        }

        self.context.inner.mark_stopped();
        log::debug!("{} socket worker stopped", self.context.discipline().as_str());
    }

    fn wait_for_role(&self) -> Option<Role> {
        loop {
            if self.context.is_stop_requested() {
                return None;
            }
            let role = self.context.role();
            if role != Role::Unknown {
                return Some(role);
            }
            thread::park_timeout(IDLE_POLL);
        }
    }

    fn dispatch(&mut self, role: Role, endpoint: &Endpoint) -> SocketResult<()> {
        match (role, endpoint) {
            (Role::Listen, Endpoint::Listener(listener)) => self.listen_loop(listener),
            (Role::AcceptRead, Endpoint::Stream(stream)) => self.read_loop(stream),
            (Role::DatagramReceive, Endpoint::Datagram(socket)) => self.receive_loop(socket),
            (Role::Connected, _) => {
                self.idle_loop();
                Ok(())
            }
            _ => Err(SocketError::Protocol),
        }
    }

    fn listen_loop(&mut self, listener: &TcpListener) -> SocketResult<()> {
        let discipline = self.context.discipline();

        while !self.context.inner.session_over() {
            if !wait_readable(listener, SocketError::Accept)? {
                continue;
            }
            if self.context.inner.session_over() {
                break;
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    self.context.inner.set_peer(Some(peer));
                    self.emit(SocketEvent::Accept {
                        peer,
                        connection: Incoming::new(stream, discipline, peer),
                    });
                }
                Err(e) if is_retryable(e.kind()) => continue,
                Err(e) => {
                    log::debug!("accept failed: {}", e);
                    self.emit(SocketEvent::Error(SocketError::Accept));
                }
            }
        }
        Ok(())
    }

    fn read_loop(&mut self, stream: &TcpStream) -> SocketResult<()> {
        let discipline = self.context.discipline();
        let peer = stream.peer_addr().ok();
        self.context.inner.set_peer(peer);
        let mut reader = stream;

        while !self.context.inner.session_over() {
            let len = match discipline {
                Discipline::FramedStream => codec::read_frame(&mut reader, &mut self.buffer),
                _ => codec::read_chunk(&mut reader, &mut self.buffer),
            };
            self.context.inner.set_capacity(self.buffer.capacity());
            let len = len?;

            if self.context.inner.session_over() {
                break;
            }

            self.context.inner.add_received(len);
            let data = self.buffer.filled(len);
            emit(&self.context, &mut self.callback, SocketEvent::Receive { peer, data });
        }
        Ok(())
    }

    fn receive_loop(&mut self, socket: &UdpSocket) -> SocketResult<()> {
        self.buffer.ensure_capacity(DATAGRAM_BUFFER_SIZE)?;
        self.context.inner.set_capacity(self.buffer.capacity());

        while !self.context.inner.session_over() {
            if !wait_readable(socket, SocketError::Receive)? {
                continue;
            }
            if self.context.inner.session_over() {
                break;
            }

            match socket.recv_from(self.buffer.as_mut_slice()) {
                Ok((len, peer)) => {
                    self.context.inner.set_peer(Some(peer));
                    self.context.inner.add_received(len);
                    let data = self.buffer.filled(len);
                    emit(
                        &self.context,
                        &mut self.callback,
                        SocketEvent::Receive {
                            peer: Some(peer),
                            data,
                        },
                    );
                }
                Err(e) if is_retryable(e.kind()) => continue,
                Err(e) => {
                    log::debug!("recvfrom failed: {}", e);
                    self.emit(SocketEvent::Error(SocketError::Receive));
                }
            }
        }
        Ok(())
    }

    fn idle_loop(&self) {
        while !self.context.inner.session_over() {
            thread::park_timeout(IDLE_POLL);
        }
    }

    fn emit(&mut self, event: SocketEvent<'_>) {
        emit(&self.context, &mut self.callback, event);
    }
}

/// Deliver an event unless the handle is being torn down
fn emit(context: &SocketContext, callback: &mut Callback, event: SocketEvent<'_>) {
    if context.is_stop_requested() {
        log::warn!("dropping event after stop: {:?}", event);
        return;
    }
    callback(context, event);
}

/// Wait up to one poll interval for `fd` to become readable
fn wait_readable<F: AsFd>(fd: &F, code: SocketError) -> SocketResult<bool> {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
        Ok(ready) => Ok(ready > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => {
            log::debug!("poll failed: {}", e);
            Err(code)
        }
    }
}

fn is_retryable(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::Interrupted)
}
