use std::fmt;
use thiserror::Error;

/// Every command and reply line ends with a single carriage return.
pub const TERMINATOR: u8 = b'\r';
pub const BAUD_RATE: u32 = 9600;
pub const LINE_PREFIX: char = '=';

const MAX_SHAFT_DIGITS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusWord(pub u8);

impl StatusWord {
    pub const SHED_CLOSED: u8 = 0x01;
    pub const CYCLE_COMPLETE: u8 = 0x04;
    pub const ERROR: u8 = 0x08;

    pub fn from_flags(shed_closed: bool, cycle_complete: bool, error: bool) -> Self {
        let mut bits = 0;
        if shed_closed {
            bits |= Self::SHED_CLOSED;
        }
        if cycle_complete {
            bits |= Self::CYCLE_COMPLETE;
        }
        if error {
            bits |= Self::ERROR;
        }
        Self(bits)
    }

    pub fn shed_closed(self) -> bool {
        self.0 & Self::SHED_CLOSED != 0
    }

    /// The loom finished a weaving cycle and wants the next pick.
    pub fn cycle_complete(self) -> bool {
        self.0 & Self::CYCLE_COMPLETE != 0
    }

    pub fn error(self) -> bool {
        self.0 & Self::ERROR != 0
    }
}

/// Server to loom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoomCommand {
    /// Bit i set means shaft i is raised.
    SetShafts(u32),
    SetDirection { forward: bool },
    QueryStatus,
    QueryVersion,
    /// Loom-specific payload sent verbatim after `=#`.
    OutOfBand(String),
}

/// Loom to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoomReply {
    Shafts(u32),
    Direction { forward: bool },
    Status(StatusWord),
    Version(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,
    #[error("line {line:?} is shorter than 2 characters")]
    TooShort { line: String },
    #[error("line {line:?} does not start with '='")]
    MissingPrefix { line: String },
    #[error("unknown code {code:?} in line {line:?}")]
    UnknownCode { code: char, line: String },
    #[error("invalid payload {payload:?} after ={code}: {reason}")]
    InvalidPayload {
        code: char,
        payload: String,
        reason: &'static str,
    },
}

impl LoomCommand {
    pub fn code(&self) -> char {
        match self {
            Self::SetShafts(_) => 'C',
            Self::SetDirection { .. } => 'U',
            Self::QueryStatus => 'Q',
            Self::QueryVersion => 'V',
            Self::OutOfBand(_) => '#',
        }
    }

    /// The framed bytes, terminator included.
    pub fn encode(&self) -> Vec<u8> {
        encode_line(&self.to_string())
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (code, payload) = split_line(line)?;
        match code {
            'C' => parse_shaft_word(code, payload).map(Self::SetShafts),
            'U' => parse_direction(code, payload).map(|forward| Self::SetDirection { forward }),
            'Q' => Ok(Self::QueryStatus),
            'V' => Ok(Self::QueryVersion),
            '#' => Ok(Self::OutOfBand(payload.to_string())),
            other => Err(ProtocolError::UnknownCode {
                code: other,
                line: trim_terminator(line).to_string(),
            }),
        }
    }
}

impl fmt::Display for LoomCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetShafts(word) => write!(f, "=C{word:08x}"),
            Self::SetDirection { forward } => write!(f, "=U{}", direction_digit(*forward)),
            Self::QueryStatus => f.write_str("=Q"),
            Self::QueryVersion => f.write_str("=V"),
            Self::OutOfBand(payload) => write!(f, "=#{payload}"),
        }
    }
}

impl LoomReply {
    pub fn code(&self) -> char {
        match self {
            Self::Shafts(_) => 'c',
            Self::Direction { .. } => 'u',
            Self::Status(_) => 's',
            Self::Version(_) => 'v',
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_line(&self.to_string())
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (code, payload) = split_line(line)?;
        match code {
            'c' => parse_shaft_word(code, payload).map(Self::Shafts),
            'u' => parse_direction(code, payload).map(|forward| Self::Direction { forward }),
            's' => parse_status(code, payload).map(Self::Status),
            'v' => Ok(Self::Version(payload.to_string())),
            other => Err(ProtocolError::UnknownCode {
                code: other,
                line: trim_terminator(line).to_string(),
            }),
        }
    }
}

impl fmt::Display for LoomReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shafts(word) => write!(f, "=c{word:08x}"),
            Self::Direction { forward } => write!(f, "=u{}", direction_digit(*forward)),
            Self::Status(status) => write!(f, "=s{:x}", status.0),
            Self::Version(version) => write!(f, "=v{version}"),
        }
    }
}

pub fn encode_line(body: &str) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(body.len() + 1);
    encoded.extend_from_slice(body.as_bytes());
    encoded.push(TERMINATOR);
    encoded
}

/// Decode raw bytes read up to (and including) a terminator into a line.
pub fn decode_line(bytes: &[u8]) -> String {
    trim_terminator(&String::from_utf8_lossy(bytes)).to_string()
}

fn trim_terminator(line: &str) -> &str {
    line.trim_end_matches(&['\r', '\n'][..])
}

fn split_line(line: &str) -> Result<(char, &str), ProtocolError> {
    let line = trim_terminator(line);
    let mut chars = line.chars();
    let Some(first) = chars.next() else {
        return Err(ProtocolError::Empty);
    };
    let Some(code) = chars.next() else {
        return Err(ProtocolError::TooShort {
            line: line.to_string(),
        });
    };
    if first != LINE_PREFIX {
        return Err(ProtocolError::MissingPrefix {
            line: line.to_string(),
        });
    }
    let payload = &line[first.len_utf8() + code.len_utf8()..];
    Ok((code, payload))
}

fn direction_digit(forward: bool) -> u8 {
    if forward {
        0
    } else {
        1
    }
}

fn parse_direction(code: char, payload: &str) -> Result<bool, ProtocolError> {
    match payload {
        "0" => Ok(true),
        "1" => Ok(false),
        _ => Err(ProtocolError::InvalidPayload {
            code,
            payload: payload.to_string(),
            reason: "direction must be 0 or 1",
        }),
    }
}

fn parse_shaft_word(code: char, payload: &str) -> Result<u32, ProtocolError> {
    if payload.is_empty()
        || payload.len() > MAX_SHAFT_DIGITS
        || !payload.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(ProtocolError::InvalidPayload {
            code,
            payload: payload.to_string(),
            reason: "expected 1-8 hex digits",
        });
    }
    u32::from_str_radix(payload, 16).map_err(|_| ProtocolError::InvalidPayload {
        code,
        payload: payload.to_string(),
        reason: "expected 1-8 hex digits",
    })
}

fn parse_status(code: char, payload: &str) -> Result<StatusWord, ProtocolError> {
    if payload.is_empty() || !payload.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidPayload {
            code,
            payload: payload.to_string(),
            reason: "status must be hex",
        });
    }
    u8::from_str_radix(payload, 16)
        .map(StatusWord)
        .map_err(|_| ProtocolError::InvalidPayload {
            code,
            payload: payload.to_string(),
            reason: "status does not fit in one byte",
        })
}
