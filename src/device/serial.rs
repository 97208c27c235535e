//! Serial line access
//!
//! Thin termios wrapper for the RS-232 links the devices hang off, plus the
//! [`Line`] trait device logic is written against.

use nix::libc;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Where udev publishes stable names for serial adapters
pub const DEVICE_DIR: &str = "/dev/serial/by-path";

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unsupported serial setting: {0}")]
    Init(String),
    #[error("Failed to configure serial line: {0}")]
    Configure(#[from] nix::Error),
    #[error("Serial write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("Serial read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("Serial read timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Character framing written as `<data bits><parity><stop bits>`, e.g. `8N1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl FromStr for FrameFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let &[data, parity, stop] = s.as_bytes() else {
            return Err(format!("Invalid frame format: {}", s));
        };

        let data_bits = match data {
            b'5'..=b'8' => data - b'0',
            _ => return Err(format!("Invalid data bits in frame format: {}", s)),
        };
        let parity = match parity {
            b'N' => Parity::None,
            b'O' => Parity::Odd,
            b'E' => Parity::Even,
            _ => return Err(format!("Invalid parity in frame format: {}", s)),
        };
        let stop_bits = match stop {
            b'1' => 1,
            b'2' => 2,
            _ => return Err(format!("Invalid stop bits in frame format: {}", s)),
        };

        Ok(Self {
            data_bits,
            parity,
            stop_bits,
        })
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        write!(f, "{}{}{}", self.data_bits, parity, self.stop_bits)
    }
}

impl FrameFormat {
    fn control_flags(&self) -> ControlFlags {
        let mut flags = match self.data_bits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            _ => ControlFlags::CS8,
        };
        match self.parity {
            Parity::None => {}
            Parity::Odd => flags |= ControlFlags::PARENB | ControlFlags::PARODD,
            Parity::Even => flags |= ControlFlags::PARENB,
        }
        if self.stop_bits == 2 {
            flags |= ControlFlags::CSTOPB;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud: u32,
    pub format: FrameFormat,
    /// Hardware RTS/CTS handshake
    pub rtscts: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: 19200,
            format: FrameFormat::default(),
            rtscts: false,
        }
    }
}

impl SerialConfig {
    pub fn new(baud: u32, format: &str, rtscts: bool) -> Result<Self, SerialError> {
        let format = format.parse().map_err(SerialError::Init)?;
        baud_rate(baud)?;
        Ok(Self {
            baud,
            format,
            rtscts,
        })
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate, SerialError> {
    let rate = match baud {
        300 => BaudRate::B300,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => return Err(SerialError::Init(format!("baud rate {}", other))),
    };
    Ok(rate)
}

/// Byte-level access to a device link
pub trait Line: Send {
    /// Write every byte, retrying interrupted writes
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError>;

    /// Read one byte, failing with [`SerialError::Timeout`] if none arrives
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, SerialError>;
}

/// VTIME value for a timeout: tenths of a second, rounded up
fn deciseconds(timeout: Duration) -> u8 {
    let tenths = timeout.as_millis().div_ceil(100);
    tenths.min(u8::MAX as u128) as u8
}

/// An open, configured serial device
#[derive(Debug)]
pub struct SerialPort {
    file: File,
    settings: Termios,
    timeout: Option<Duration>,
}

impl SerialPort {
    /// Open `path` without making it the controlling terminal and put it in
    /// raw mode with the given line settings
    pub fn open(path: &Path, config: &SerialConfig) -> Result<Self, SerialError> {
        let speed = baud_rate(config.baud)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .map_err(|source| SerialError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut settings = termios::tcgetattr(&file)?;
        settings.input_flags = InputFlags::IGNPAR;
        settings.output_flags = OutputFlags::empty();
        settings.local_flags = LocalFlags::empty();
        settings.control_flags =
            ControlFlags::CLOCAL | ControlFlags::CREAD | config.format.control_flags();
        if config.rtscts {
            settings.control_flags |= ControlFlags::CRTSCTS;
        }
        termios::cfsetspeed(&mut settings, speed)?;

        let mut port = Self {
            file,
            settings,
            timeout: None,
        };
        port.set_timeout(Duration::ZERO)?;
        termios::tcflush(&port.file, FlushArg::TCIOFLUSH)?;

        log::debug!(
            "opened {} at {} {}",
            path.display(),
            config.baud,
            config.format
        );
        Ok(port)
    }

    /// A zero timeout blocks until at least one byte arrives
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialError> {
        if self.timeout == Some(timeout) {
            return Ok(());
        }

        let vtime = deciseconds(timeout);
        self.settings.control_chars[SpecialCharacterIndices::VMIN as usize] =
            if vtime == 0 { 1 } else { 0 };
        self.settings.control_chars[SpecialCharacterIndices::VTIME as usize] = vtime;
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &self.settings)?;

        self.timeout = Some(timeout);
        Ok(())
    }
}

impl Line for SerialPort {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            match self.file.write(rest) {
                Ok(0) => return Err(SerialError::Write(ErrorKind::WriteZero.into())),
                Ok(written) => rest = &rest[written..],
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SerialError::Write(e)),
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<u8, SerialError> {
        self.set_timeout(timeout)?;

        let mut byte = [0u8; 1];
        loop {
            match self.file.read(&mut byte) {
                Ok(0) => return Err(SerialError::Timeout),
                Ok(_) => return Ok(byte[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SerialError::Read(e)),
            }
        }
    }
}

/// Serial devices present on this machine, resolved and sorted
pub fn list_devices() -> Vec<PathBuf> {
    list_devices_in(Path::new(DEVICE_DIR))
}

pub fn list_devices_in(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("no serial devices in {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut names: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    names.sort();

    names
        .into_iter()
        .filter_map(|path| fs::canonicalize(&path).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_format_parse() {
        let format: FrameFormat = "7E2".parse().unwrap();
        assert_eq!(format.data_bits, 7);
        assert_eq!(format.parity, Parity::Even);
        assert_eq!(format.stop_bits, 2);
        assert_eq!(format.to_string(), "7E2");

        assert_eq!("8N1".parse::<FrameFormat>().unwrap(), FrameFormat::default());
    }

    #[test]
    fn test_frame_format_rejects_garbage() {
        for bad in ["", "8N", "8N11", "9N1", "8X1", "8N3", "n81"] {
            assert!(bad.parse::<FrameFormat>().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_odd_parity_enables_parity() {
        let flags = "8O1".parse::<FrameFormat>().unwrap().control_flags();
        assert!(flags.contains(ControlFlags::PARENB | ControlFlags::PARODD));

        let flags = "8N2".parse::<FrameFormat>().unwrap().control_flags();
        assert!(!flags.contains(ControlFlags::PARENB));
        assert!(flags.contains(ControlFlags::CSTOPB));
    }

    #[test]
    fn test_supported_baud_rates() {
        for baud in [300, 2400, 4800, 9600, 19200, 38400, 57600, 115200] {
            assert!(SerialConfig::new(baud, "8N1", false).is_ok(), "{}", baud);
        }
        assert!(matches!(
            SerialConfig::new(1200, "8N1", false),
            Err(SerialError::Init(_))
        ));
        assert!(matches!(
            SerialConfig::new(19200, "8Q1", false),
            Err(SerialError::Init(_))
        ));
    }

    #[test]
    fn test_deciseconds_round_up() {
        assert_eq!(deciseconds(Duration::ZERO), 0);
        assert_eq!(deciseconds(Duration::from_millis(1)), 1);
        assert_eq!(deciseconds(Duration::from_millis(2000)), 20);
        assert_eq!(deciseconds(Duration::from_millis(3001)), 31);
        assert_eq!(deciseconds(Duration::from_secs(60)), u8::MAX);
    }

    #[test]
    fn test_list_devices_resolves_links_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let targets = tempfile::tempdir().unwrap();
        let usb0 = targets.path().join("ttyUSB0");
        let usb1 = targets.path().join("ttyUSB1");
        fs::write(&usb0, b"").unwrap();
        fs::write(&usb1, b"").unwrap();

        let link = |target: &Path, name: &str| {
            std::os::unix::fs::symlink(target, dir.path().join(name)).unwrap();
        };
        link(&usb1, "pci-0000:00:14.0-usb-0:2:1.0-port0");
        link(&usb0, "pci-0000:00:14.0-usb-0:1:1.0-port0");
        link(&targets.path().join("gone"), "stale");

        let devices = list_devices_in(dir.path());
        assert_eq!(
            devices,
            vec![
                fs::canonicalize(&usb0).unwrap(),
                fs::canonicalize(&usb1).unwrap()
            ]
        );
    }

    #[test]
    fn test_list_devices_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_devices_in(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_open_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let result = SerialPort::open(&dir.path().join("ttyUSB9"), &SerialConfig::default());
        assert!(matches!(result, Err(SerialError::Open { .. })));
    }
}
