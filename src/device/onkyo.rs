//! Onkyo receiver behind a serial bridge
//!
//! The bridge takes newline-terminated words and answers with one line.

use super::serial::Line;
use super::{Choice, Device, DeviceError, lookup, read_reply};
use std::time::Duration;

/// How long to wait for each reply byte
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

/// The bridge resets when the port opens and needs this long to come up
pub const SETTLE_TIME: Duration = Duration::from_secs(1);

pub const COMMANDS: &[Choice] = &[
    Choice::new("status", "status", "read receiver status"),
    Choice::new("power", "power", "toggle power"),
    Choice::new("vol+", "vol+", "volume up"),
    Choice::new("vol-", "vol-", "volume down"),
    Choice::new("mute", "mute", "toggle mute"),
    Choice::new("speaker", "speaker", "switch speaker set"),
    Choice::new("movie", "movie", "movie listening mode"),
    Choice::new("game", "game", "game listening mode"),
    Choice::new("music", "music", "music listening mode"),
    Choice::new("stereo", "stereo", "stereo listening mode"),
];

pub struct Receiver<L: Line> {
    line: L,
}

impl<L: Line> Receiver<L> {
    pub fn new(line: L) -> Self {
        Self { line }
    }

    fn request(&mut self, word: &str) -> Result<String, DeviceError> {
        self.line.write_all(format!("{}\n", word).as_bytes())?;

        let mut reply = read_reply(&mut self.line, REPLY_TIMEOUT, b'\n')?;
        reply.retain(|&byte| byte != b'\r');
        if reply.contains(&b'?') {
            return Err(DeviceError::UnknownCommand);
        }

        let reply = String::from_utf8_lossy(&reply).into_owned();
        log::debug!("onkyo {} -> {:?}", word, reply);
        Ok(reply)
    }
}

impl<L: Line> Device for Receiver<L> {
    fn name(&self) -> &'static str {
        "Onkyo receiver"
    }

    fn probe(&mut self) -> Result<String, DeviceError> {
        self.request("status")
    }

    /// The command word is sent as is; the argument is not used
    fn execute(&mut self, command: &str, _argument: &str) -> Result<String, DeviceError> {
        let choice = lookup(COMMANDS, command).map_err(|_| DeviceError::UnknownCommand)?;
        self.request(choice.code)
    }
}
