use crate::net::{Discipline, SocketHandle};
use crate::protocol::CommandRequest;
use anyhow::Context;

/// Sends command datagrams to a running daemon
pub struct RemoteClient {
    host: Option<String>,
    port: u16,
}

impl RemoteClient {
    /// Target `host`, or every daemon on the local network when `None`
    pub fn new(host: Option<String>, port: u16) -> Self {
        Self { host, port }
    }

    pub fn target(&self) -> String {
        match &self.host {
            Some(host) => format!("{}:{}", host, self.port),
            None => format!("broadcast:{}", self.port),
        }
    }

    /// Send one request. Delivery is not confirmed.
    pub fn send(&self, request: &CommandRequest) -> anyhow::Result<()> {
        let handle = SocketHandle::new(Discipline::Datagram, |_, event| {
            log::debug!("remote client event: {:?}", event);
        })
        .context("Failed to create UDP socket")?;

        handle
            .connect(self.host.as_deref(), self.port)
            .with_context(|| format!("Could not connect to server at {}", self.target()))?;

        handle
            .send(&request.encode())
            .context("Error while sending data to server")?;

        log::debug!("sent {:?} to {}", request.to_string(), self.target());
        handle.delete();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Duration;

    #[test]
    fn test_send_reaches_daemon_socket() {
        let daemon = UdpSocket::bind("127.0.0.1:0").unwrap();
        daemon
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let port = daemon.local_addr().unwrap().port();

        let client = RemoteClient::new(Some("127.0.0.1".to_string()), port);
        client
            .send(&CommandRequest::new("input", Some("hdmi".to_string())))
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = daemon.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"input hdmi");
    }

    #[test]
    fn test_unresolvable_host() {
        let client = RemoteClient::new(Some("no-such-host.invalid".to_string()), 1541);
        assert!(client.send(&CommandRequest::new("power", None)).is_err());
    }

    #[test]
    fn test_target_description() {
        assert_eq!(RemoteClient::new(None, 1541).target(), "broadcast:1541");
        assert_eq!(
            RemoteClient::new(Some("beamer".to_string()), 9).target(),
            "beamer:9"
        );
    }
}
