use serde::Serialize;
use thiserror::Error;

/// Longest command or argument word the daemon accepts
pub const MAX_TOKEN_LEN: usize = 31;

/// Port the daemon listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 1541;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Request is not valid UTF-8")]
    Encoding,
    #[error("Request is empty")]
    Empty,
    #[error("Request word too long: {0}")]
    TooLong(String),
    #[error("Unexpected trailing words in request: {0}")]
    Trailing(String),
}

/// One command datagram: `"<command> <argument>"`
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub argument: Option<String>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, argument: Option<String>) -> Self {
        Self {
            command: command.into(),
            argument: argument.filter(|arg| !arg.is_empty()),
        }
    }

    /// Parse a received datagram.
    ///
    /// Leading and trailing whitespace and NUL padding are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::Encoding)?;
        let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        let mut words = text.split_whitespace();
        let command = words.next().ok_or(ProtocolError::Empty)?;
        let argument = words.next();

        let rest: Vec<&str> = words.collect();
        if !rest.is_empty() {
            return Err(ProtocolError::Trailing(rest.join(" ")));
        }

        for word in std::iter::once(command).chain(argument) {
            if word.len() > MAX_TOKEN_LEN {
                return Err(ProtocolError::TooLong(word.to_string()));
            }
        }

        Ok(Self::new(command, argument.map(str::to_string)))
    }

    /// Wire form sent by the remote client
    pub fn encode(&self) -> Vec<u8> {
        match &self.argument {
            Some(argument) => format!("{} {}", self.command, argument).into_bytes(),
            None => self.command.clone().into_bytes(),
        }
    }

    pub fn argument(&self) -> &str {
        self.argument.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.argument {
            Some(argument) => write!(f, "{} {}", self.command, argument),
            None => write!(f, "{}", self.command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_and_argument() {
        let request = CommandRequest::parse(b"power on").unwrap();
        assert_eq!(request.command, "power");
        assert_eq!(request.argument.as_deref(), Some("on"));
    }

    #[test]
    fn test_parse_command_only() {
        let request = CommandRequest::parse(b"model ").unwrap();
        assert_eq!(request.command, "model");
        assert_eq!(request.argument, None);
        assert_eq!(request.argument(), "");
    }

    #[test]
    fn test_parse_ignores_padding() {
        let request = CommandRequest::parse(b"  status\tlamp\n\0\0").unwrap();
        assert_eq!(request.to_string(), "status lamp");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(CommandRequest::parse(b""), Err(ProtocolError::Empty));
        assert_eq!(CommandRequest::parse(b" \0 "), Err(ProtocolError::Empty));
        assert_eq!(
            CommandRequest::parse(&[0xff, 0xfe]),
            Err(ProtocolError::Encoding)
        );
        assert!(matches!(
            CommandRequest::parse(b"input hdmi now"),
            Err(ProtocolError::Trailing(_))
        ));

        let long = format!("power {}", "x".repeat(MAX_TOKEN_LEN + 1));
        assert!(matches!(
            CommandRequest::parse(long.as_bytes()),
            Err(ProtocolError::TooLong(_))
        ));
    }

    #[test]
    fn test_encode() {
        let request = CommandRequest::new("input", Some("hdmi".into()));
        assert_eq!(request.encode(), b"input hdmi");

        let request = CommandRequest::new("model", Some(String::new()));
        assert_eq!(request.encode(), b"model");
        assert_eq!(CommandRequest::parse(&request.encode()).unwrap(), request);
    }
}
