//! UDP command daemon
//!
//! Listens for `"<command> <argument>"` datagrams and runs each one against
//! the attached device.

use crate::device::Device;
use crate::net::{Discipline, SocketContext, SocketEvent, SocketHandle};
use crate::protocol::CommandRequest;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::signal::unix::{SignalKind, signal};

pub struct CommandServer {
    handle: SocketHandle,
    inner: Arc<ServerInner>,
}

/// State shared with the socket callback
struct ServerInner {
    device: Mutex<Box<dyn Device>>,
    handled: AtomicU64,
    start_time: Instant,
}

impl ServerInner {
    fn on_event(&self, context: &SocketContext, event: SocketEvent<'_>) {
        match event {
            SocketEvent::Receive { peer, data } => self.handle_request(peer, data),
            SocketEvent::Error(e) => {
                log::warn!("client error: {} ({})", e.code(), e);
            }
            SocketEvent::Accept { peer, .. } => {
                log::warn!(
                    "unexpected connection from {} on {} socket",
                    peer,
                    context.discipline().as_str()
                );
            }
        }
    }

    fn handle_request(&self, peer: Option<SocketAddr>, data: &[u8]) {
        let from = peer.map_or_else(|| "unknown".to_string(), |peer| peer.to_string());

        let request = match CommandRequest::parse(data) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("ignoring datagram from {}: {}", from, e);
                return;
            }
        };

        log::info!("exec {} from {}", request, from);
        self.handled.fetch_add(1, Ordering::SeqCst);

        let mut device = self
            .device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match device.execute(&request.command, request.argument()) {
            Ok(response) => log::info!("response: {}", response),
            Err(e) => log::warn!("{} failed: {} (code {})", request, e, e.exit_code()),
        }
    }
}

impl CommandServer {
    /// Start listening on `port` for commands to run against `device`
    pub fn start(device: Box<dyn Device>, port: u16) -> anyhow::Result<Self> {
        let inner = Arc::new(ServerInner {
            device: Mutex::new(device),
            handled: AtomicU64::new(0),
            start_time: Instant::now(),
        });

        let callback_inner = Arc::clone(&inner);
        let handle = SocketHandle::new(Discipline::Datagram, move |context, event| {
            callback_inner.on_event(context, event)
        })
        .context("Failed to create UDP socket")?;

        handle
            .listen(port)
            .with_context(|| format!("Could not start listener on port {}", port))?;

        log::info!("starting UDP listener on port {}", port);
        Ok(Self { handle, inner })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }

    /// Number of well-formed requests executed so far
    pub fn handled(&self) -> u64 {
        self.inner.handled.load(Ordering::SeqCst)
    }

    /// Serve until SIGINT, SIGQUIT, SIGHUP or SIGTERM arrives
    pub async fn run(self) -> anyhow::Result<()> {
        let name = wait_for_shutdown().await?;
        log::info!("{} received, stopping server", name);
        self.stop();
        Ok(())
    }

    /// Close the listener and tear down its worker
    pub fn stop(self) {
        if let Err(e) = self.handle.disconnect() {
            log::warn!("Failed to close listener: {}", e);
        }
        log::info!(
            "served {} requests in {}s",
            self.handled(),
            self.inner.start_time.elapsed().as_secs()
        );
        self.handle.delete();
    }
}

async fn wait_for_shutdown() -> anyhow::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to watch SIGINT")?;
    let mut quit = signal(SignalKind::quit()).context("Failed to watch SIGQUIT")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to watch SIGHUP")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = quit.recv() => "SIGQUIT",
        _ = hangup.recv() => "SIGHUP",
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use std::net::UdpSocket;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<(String, String)>>>;

    struct FakeDevice {
        seen: Log,
    }

    impl Device for FakeDevice {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn probe(&mut self) -> Result<String, DeviceError> {
            Ok("ok".to_string())
        }

        fn execute(&mut self, command: &str, argument: &str) -> Result<String, DeviceError> {
            self.seen
                .lock()
                .unwrap()
                .push((command.to_string(), argument.to_string()));
            match command {
                "power" => Ok("!".to_string()),
                _ => Err(DeviceError::UnknownCommand),
            }
        }
    }

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn wait_for(seen: &Log, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if seen.lock().unwrap().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_server_executes_datagrams() {
        let seen = Log::default();
        let port = free_port();
        let device = Box::new(FakeDevice { seen: seen.clone() });
        let server = CommandServer::start(device, port).unwrap();
        assert_eq!(server.local_addr().map(|addr| addr.port()), Some(port));

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"", ("127.0.0.1", port)).unwrap();
        client.send_to(b"power on", ("127.0.0.1", port)).unwrap();
        client.send_to(b"reboot ", ("127.0.0.1", port)).unwrap();

        assert!(wait_for(&seen, 2));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                ("power".to_string(), "on".to_string()),
                ("reboot".to_string(), String::new())
            ]
        );
        assert_eq!(server.handled(), 2);
        server.stop();
    }

    #[test]
    fn test_port_in_use() {
        let taken = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let result = CommandServer::start(
            Box::new(FakeDevice {
                seen: Log::default(),
            }),
            port,
        );
        assert!(result.is_err());
    }
}
