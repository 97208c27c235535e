//! Device control
//!
//! Commands for the supported AV devices, spoken over a serial line:
//! - `serial`: termios access and device discovery
//! - `sanyo`: Sanyo PLV-Z4 projector
//! - `onkyo`: Onkyo receiver behind a serial bridge

pub mod onkyo;
pub mod sanyo;
pub mod serial;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serial::{Line, SerialConfig, SerialError, SerialPort};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Longest reply read from a device
pub const MAX_REPLY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("unknown command")]
    UnknownCommand,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("serial device open failed")]
    OpenFailed(#[source] SerialError),
    #[error("serial write error")]
    WriteError(#[source] SerialError),
    #[error("serial read timeout")]
    ReadTimeout,
    #[error("device not connected")]
    NotConnected,
}

/// Exit statuses of the command line tool and what they mean
pub const EXIT_CODES: &[(u8, &str)] = &[
    (1, "unknown command"),
    (2, "invalid argument"),
    (3, "serial open failed"),
    (4, "serial write error"),
    (5, "serial read timeout"),
    (6, "device not connected"),
];

impl DeviceError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            DeviceError::UnknownCommand => 1,
            DeviceError::InvalidArgument => 2,
            DeviceError::OpenFailed(_) => 3,
            DeviceError::WriteError(_) => 4,
            DeviceError::ReadTimeout => 5,
            DeviceError::NotConnected => 6,
        }
    }
}

impl From<SerialError> for DeviceError {
    fn from(e: SerialError) -> Self {
        match e {
            SerialError::Write(_) => DeviceError::WriteError(e),
            SerialError::Read(_) | SerialError::Timeout => {
                log::debug!("serial read failed: {}", e);
                DeviceError::ReadTimeout
            }
            SerialError::Open { .. } | SerialError::Init(_) | SerialError::Configure(_) => {
                DeviceError::OpenFailed(e)
            }
        }
    }
}

/// One accepted word for a command, with what it does
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Choice {
    pub name: &'static str,
    #[serde(skip)]
    pub code: &'static str,
    pub description: &'static str,
}

impl Choice {
    pub(crate) const fn new(
        name: &'static str,
        code: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            code,
            description,
        }
    }
}

pub(crate) fn lookup(table: &'static [Choice], name: &str) -> Result<&'static Choice, DeviceError> {
    table
        .iter()
        .find(|choice| choice.name == name)
        .ok_or(DeviceError::InvalidArgument)
}

/// A device that takes text commands and answers with a short text reply
pub trait Device: Send {
    fn name(&self) -> &'static str;

    /// Check that the device answers
    fn probe(&mut self) -> Result<String, DeviceError>;

    fn execute(&mut self, command: &str, argument: &str) -> Result<String, DeviceError>;
}

/// Read a reply up to (not including) `terminator`, at most
/// [`MAX_REPLY_LEN`] bytes
pub(crate) fn read_reply<L: Line + ?Sized>(
    line: &mut L,
    timeout: Duration,
    terminator: u8,
) -> Result<Vec<u8>, DeviceError> {
    let mut reply = Vec::with_capacity(MAX_REPLY_LEN);
    while reply.len() < MAX_REPLY_LEN {
        let byte = line.read_byte(timeout)?;
        if byte == terminator {
            break;
        }
        reply.push(byte);
    }
    Ok(reply)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Sanyo PLV-Z4 projector
    #[default]
    Sanyo,
    /// Onkyo receiver
    Onkyo,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Sanyo => "sanyo",
            DeviceKind::Onkyo => "onkyo",
        }
    }

    /// Commands understood by this device
    pub fn commands(&self) -> &'static [Choice] {
        match self {
            DeviceKind::Sanyo => sanyo::COMMANDS,
            DeviceKind::Onkyo => onkyo::COMMANDS,
        }
    }

    /// Arguments accepted by `command`, for commands that take one
    pub fn arguments(&self, command: &str) -> Option<&'static [Choice]> {
        match self {
            DeviceKind::Sanyo => sanyo::arguments(command),
            DeviceKind::Onkyo => None,
        }
    }

    /// Open the serial device at `path` and wrap it for this device
    pub fn open(&self, path: &Path, config: &SerialConfig) -> Result<Box<dyn Device>, DeviceError> {
        let port = SerialPort::open(path, config)?;
        let device: Box<dyn Device> = match self {
            DeviceKind::Sanyo => Box::new(sanyo::Projector::new(port)),
            DeviceKind::Onkyo => {
                std::thread::sleep(onkyo::SETTLE_TIME);
                Box::new(onkyo::Receiver::new(port))
            }
        };
        Ok(device)
    }
}

/// A probed device and the serial device it answered on
pub struct Connection {
    pub path: PathBuf,
    pub device: Box<dyn Device>,
}

/// Try each candidate in order and keep the first one that answers a probe
pub fn connect(
    kind: DeviceKind,
    config: &SerialConfig,
    candidates: &[PathBuf],
) -> Result<Connection, DeviceError> {
    for path in candidates {
        let mut device = match kind.open(path, config) {
            Ok(device) => device,
            Err(e) => {
                log::debug!("skipping {}: {}", path.display(), e);
                continue;
            }
        };

        match device.probe() {
            Ok(reply) => {
                log::info!("found {} on {} ({})", device.name(), path.display(), reply);
                return Ok(Connection {
                    path: path.clone(),
                    device,
                });
            }
            Err(e) => log::debug!("no {} on {}: {}", kind.as_str(), path.display(), e),
        }
    }
    Err(DeviceError::NotConnected)
}


#[cfg(test)]
mod tests {
    use super::script::ScriptedLine;
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DeviceError::UnknownCommand.exit_code(), 1);
        assert_eq!(DeviceError::InvalidArgument.exit_code(), 2);
        assert_eq!(
            DeviceError::OpenFailed(SerialError::Init("baud rate 1".into())).exit_code(),
            3
        );
        let broken_pipe = SerialError::Write(std::io::ErrorKind::BrokenPipe.into());
        assert_eq!(DeviceError::from(broken_pipe).exit_code(), 4);
        assert_eq!(DeviceError::from(SerialError::Timeout).exit_code(), 5);
        assert_eq!(DeviceError::NotConnected.exit_code(), 6);

        for (code, meaning) in EXIT_CODES {
            assert!(!meaning.is_empty(), "{}", code);
        }
        assert_eq!(EXIT_CODES.len(), 6);
    }

    #[test]
    fn test_read_reply_stops_at_terminator() {
        let mut line = ScriptedLine::new(&[b"80\rtrailing"]);
        line.write_all(b"CR0\r").unwrap();
        assert_eq!(read_reply(&mut line, Duration::from_secs(3), b'\r').unwrap(), b"80");
    }

    #[test]
    fn test_read_reply_caps_length() {
        let long = vec![b'x'; 40];
        let mut line = ScriptedLine::new(&[&long]);
        line.write_all(b"status\n").unwrap();
        let reply = read_reply(&mut line, Duration::from_secs(2), b'\n').unwrap();
        assert_eq!(reply.len(), MAX_REPLY_LEN);
    }

    #[test]
    fn test_read_reply_timeout() {
        let mut line = ScriptedLine::new(&[b"8"]);
        line.write_all(b"CR0\r").unwrap();
        assert!(matches!(
            read_reply(&mut line, Duration::from_secs(3), b'\r'),
            Err(DeviceError::ReadTimeout)
        ));
    }

    #[test]
    fn test_connect_without_candidates() {
        assert!(matches!(
            connect(DeviceKind::Sanyo, &SerialConfig::default(), &[]),
            Err(DeviceError::NotConnected)
        ));
    }

    #[test]
    fn test_connect_skips_unopenable_devices() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![dir.path().join("ttyUSB0"), dir.path().join("ttyUSB1")];
        assert!(matches!(
            connect(DeviceKind::Onkyo, &SerialConfig::default(), &candidates),
            Err(DeviceError::NotConnected)
        ));
    }

    #[test]
    fn test_device_kind_tables() {
        assert!(DeviceKind::Sanyo.arguments("power").is_some());
        assert!(DeviceKind::Sanyo.arguments("model").is_none());
        assert!(DeviceKind::Onkyo.arguments("power").is_none());
        assert!(DeviceKind::Onkyo.commands().iter().any(|c| c.name == "vol+"));
        assert_eq!(
            <DeviceKind as ValueEnum>::from_str("onkyo", false),
            Ok(DeviceKind::Onkyo)
        );
        assert!(<DeviceKind as ValueEnum>::from_str("denon", false).is_err());
    }
}
