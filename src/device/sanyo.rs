//! Sanyo PLV-Z4 projector
//!
//! Every command is three characters and a carriage return. The projector
//! answers with a short reply ending in `\r`, `?` for a command it doesn't
//! know, or ACK (0x06) for one it carried out.

use super::serial::Line;
use super::{Choice, Device, DeviceError, lookup, read_reply};
use std::time::Duration;

/// How long to wait for each reply byte
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(3000);

const ACK: u8 = 0x06;

const READ_POWER_STATUS: &str = "CR0";
const READ_MODEL_NUMBER: &str = "CR5";

pub const COMMANDS: &[Choice] = &[
    Choice::new("C??", "", "send generic 3 byte command to the projector"),
    Choice::new("status", "", "read power status, video input, lamp usage or temperature sensors"),
    Choice::new("power", "", "power the projector on or off"),
    Choice::new("input", "", "select video source"),
    Choice::new("scaler", "", "set image scaler mode"),
    Choice::new("lamp", "", "set lamp mode"),
    Choice::new("color", "", "set color mode"),
    Choice::new("model", "", "read model number"),
];

const STATUS: &[Choice] = &[
    Choice::new("power", READ_POWER_STATUS, "return current power status"),
    Choice::new("input", "CR1", "return selected input"),
    Choice::new("lamp", "CR3", "return hours of lamp use"),
    Choice::new("temp", "CR6", "return current temperature sensor values"),
];

const POWER: &[Choice] = &[
    Choice::new("on", "C00", "switch projector on"),
    Choice::new("off", "C01", "switch projector to stand-by"),
];

const INPUT: &[Choice] = &[
    Choice::new("video", "C23", "composite video"),
    Choice::new("s-video", "C24", "super video"),
    Choice::new("comp1", "C25", "component video 1"),
    Choice::new("comp2", "C26", "component video 2"),
    Choice::new("vga", "C50", "vga video"),
    Choice::new("hdmi", "C53", "digital hd video"),
];

const SCALER: &[Choice] = &[
    Choice::new("off", "C66", "scaler off"),
    Choice::new("normal", "C0D", "scale up 4:3 to 16:9 by adding black borders"),
    Choice::new("zoom", "C2C", "scale up 4:3 to 16:9 by cutting edges"),
    Choice::new("full", "C0E", "stretch 4:3 to 16:9 full screen"),
    Choice::new("strech", "C65", "stretch 4:3 to 16:9 unscaled"),
    Choice::new("wide1", "C2D", "stretch 4:3 to 16:9 but keep aspect ratio in the center"),
    Choice::new("wide2", "C2E", "like wide1 but stretch 16:9 with black borders to 16:9 without"),
    Choice::new("caption", "C63", "like zoom but keep subtitles on the bottom visible"),
];

const LAMP: &[Choice] = &[
    Choice::new("normal", "C74", "standard brightness"),
    Choice::new("auto1", "C72", "adjusting brightness to input signal"),
    Choice::new("auto2", "C73", "like auto1 but less bright"),
    Choice::new("eco", "C75", "lowest brightness and power consumption"),
];

const COLOR: &[Choice] = &[
    Choice::new("creative", "C3A", "contrasty 3D images in a dark room"),
    Choice::new("cinema", "C3B", "quiet tones of color in a dark room"),
    Choice::new("natural", "C43", "color correction off"),
    Choice::new("living", "C39", "sport and TV in a bright room"),
    Choice::new("dynamic", "C41", "contrasty images in a bright room"),
    Choice::new("powerful", "C42", "big screen in a bright room"),
    Choice::new("vivid", "C40", "contrasty images to maximum extent"),
    Choice::new("user1", "C3C", "user preset 1"),
    Choice::new("user2", "C3D", "user preset 2"),
    Choice::new("user3", "C3E", "user preset 3"),
    Choice::new("user4", "C3F", "user preset 4"),
];

/// Argument table for `command`, if it takes an argument
pub fn arguments(command: &str) -> Option<&'static [Choice]> {
    match command {
        "status" => Some(STATUS),
        "power" => Some(POWER),
        "input" => Some(INPUT),
        "scaler" => Some(SCALER),
        "lamp" => Some(LAMP),
        "color" => Some(COLOR),
        _ => None,
    }
}

/// `C` followed by two more printable ASCII characters
fn is_generic(command: &str) -> bool {
    command.len() == 3
        && command.starts_with('C')
        && command.bytes().all(|b| b.is_ascii_graphic())
}

/// Leading decimal digits of a reply, like C's `atoi`
fn leading_number(reply: &str) -> Option<u32> {
    let trimmed = reply.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

pub(crate) fn power_status(reply: &str) -> String {
    let status = match leading_number(reply) {
        Some(0) => "power on",
        Some(80) => "stand-by",
        Some(40) => "processing countdown",
        Some(20) => "processing cooling down",
        Some(10) => "power failure",
        Some(28) => "processing cooling down due to abnormal temperature",
        Some(88) => "stand-by due to abnormal temperature or door failure",
        Some(24) => "processing power save / cooling down",
        Some(4) => "power save",
        Some(21) => "processing cooling down after lamp failure",
        Some(81) => "stand-by after cooling down due to lamp failure",
        _ => return format!("unknown ({})", reply),
    };
    status.to_string()
}

pub(crate) fn input_name(reply: &str) -> String {
    let input = match leading_number(reply) {
        Some(0) => "composite",
        Some(1) => "s-video",
        Some(2) => "component 1",
        Some(3) => "component 2",
        Some(4) => "hdmi",
        Some(5) => "vga",
        Some(6) => "scart",
        _ => return format!("unknown ({})", reply),
    };
    input.to_string()
}

pub(crate) fn lamp_hours(reply: &str) -> String {
    match leading_number(reply) {
        Some(hours) => hours.to_string(),
        None => reply.to_string(),
    }
}

/// Sanyo projector on a serial line
pub struct Projector<L: Line> {
    line: L,
}

impl<L: Line> Projector<L> {
    pub fn new(line: L) -> Self {
        Self { line }
    }

    /// Send one three-character command and return its reply
    fn request(&mut self, code: &str) -> Result<String, DeviceError> {
        let command = format!("{}\r", code);
        self.line.write_all(command.as_bytes())?;

        let mut reply = read_reply(&mut self.line, REPLY_TIMEOUT, b'\r')?;
        if reply.contains(&b'?') {
            return Err(DeviceError::UnknownCommand);
        }
        for byte in reply.iter_mut().filter(|byte| **byte == ACK) {
            *byte = b'!';
        }

        let reply = String::from_utf8_lossy(&reply).into_owned();
        log::debug!("sanyo {} -> {:?}", code, reply);
        Ok(reply)
    }

    fn status(&mut self, argument: &str) -> Result<String, DeviceError> {
        let choice = lookup(STATUS, argument)?;
        let reply = self.request(choice.code)?;
        let decoded = match argument {
            "power" => power_status(&reply),
            "input" => input_name(&reply),
            "lamp" => lamp_hours(&reply),
            _ => reply,
        };
        Ok(decoded)
    }
}

impl<L: Line> Device for Projector<L> {
    fn name(&self) -> &'static str {
        "Sanyo PLV-Z4"
    }

    fn probe(&mut self) -> Result<String, DeviceError> {
        self.status("power")
    }

    fn execute(&mut self, command: &str, argument: &str) -> Result<String, DeviceError> {
        match command {
            "status" => self.status(argument),
            "model" => self.request(READ_MODEL_NUMBER),
            _ => {
                if let Some(table) = arguments(command) {
                    let code = lookup(table, argument)?.code;
                    self.request(code)
                } else if is_generic(command) {
                    self.request(command)
                } else {
                    Err(DeviceError::UnknownCommand)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::script::ScriptedLine;

    type Written = std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>;

    fn projector(replies: &[&[u8]]) -> (Projector<ScriptedLine>, Written) {
        let line = ScriptedLine::new(replies);
        let written = line.written.clone();
        (Projector::new(line), written)
    }

    #[test]
    fn test_power_status_codes() {
        assert_eq!(power_status("00"), "power on");
        assert_eq!(power_status("80"), "stand-by");
        assert_eq!(power_status("04"), "power save");
        assert_eq!(
            power_status("88"),
            "stand-by due to abnormal temperature or door failure"
        );
        assert_eq!(power_status("81"), "stand-by after cooling down due to lamp failure");
        assert_eq!(power_status("99"), "unknown (99)");
        assert_eq!(power_status("xx"), "unknown (xx)");
    }

    #[test]
    fn test_input_and_lamp_decoding() {
        assert_eq!(input_name("4"), "hdmi");
        assert_eq!(input_name("6"), "scart");
        assert_eq!(input_name("9"), "unknown (9)");
        assert_eq!(lamp_hours("00123"), "123");
        assert_eq!(lamp_hours("00000"), "0");
    }

    #[test]
    fn test_status_power_request() {
        let (mut projector, written) = projector(&[b"80\r"]);
        assert_eq!(projector.execute("status", "power").unwrap(), "stand-by");
        assert_eq!(written.lock().unwrap().as_slice(), &[b"CR0\r".to_vec()]);
    }

    #[test]
    fn test_command_tables() {
        let cases = [
            ("power", "on", "C00"),
            ("power", "off", "C01"),
            ("input", "hdmi", "C53"),
            ("input", "s-video", "C24"),
            ("scaler", "off", "C66"),
            ("scaler", "strech", "C65"),
            ("lamp", "eco", "C75"),
            ("color", "natural", "C43"),
            ("color", "user4", "C3F"),
        ];

        for (command, argument, code) in cases {
            let (mut projector, written) = projector(&[b"\x06\r"]);
            assert_eq!(projector.execute(command, argument).unwrap(), "!");
            assert_eq!(
                written.lock().unwrap()[0],
                format!("{}\r", code).into_bytes(),
                "{} {}",
                command,
                argument
            );
        }
    }

    #[test]
    fn test_model_and_generic() {
        let (mut projector, written) = projector(&[b"PLV-Z4\r", b"\x06\r"]);
        assert_eq!(projector.execute("model", "").unwrap(), "PLV-Z4");
        assert_eq!(projector.execute("C1C", "").unwrap(), "!");

        let written = written.lock().unwrap();
        assert_eq!(written[0], b"CR5\r");
        assert_eq!(written[1], b"C1C\r");
    }

    #[test]
    fn test_unknown_and_invalid() {
        let (mut projector, written) = projector(&[b"?\r"]);
        assert!(matches!(
            projector.execute("power", "sideways"),
            Err(DeviceError::InvalidArgument)
        ));
        assert!(matches!(
            projector.execute("reboot", ""),
            Err(DeviceError::UnknownCommand)
        ));
        assert!(matches!(
            projector.execute("CXXX", ""),
            Err(DeviceError::UnknownCommand)
        ));
        assert!(written.lock().unwrap().is_empty());

        assert!(matches!(
            projector.execute("CZZ", ""),
            Err(DeviceError::UnknownCommand)
        ));
    }

    #[test]
    fn test_probe_times_out_without_reply() {
        let (mut projector, _) = projector(&[]);
        assert!(matches!(projector.probe(), Err(DeviceError::ReadTimeout)));
    }

    #[test]
    fn test_argument_tables() {
        assert_eq!(arguments("lamp").unwrap().len(), 4);
        assert_eq!(arguments("color").unwrap().len(), 11);
        assert!(arguments("model").is_none());
        assert!(is_generic("C0D"));
        assert!(!is_generic("CR"));
        assert!(!is_generic("X00"));
    }
}
