use std::fmt;
use std::io::{self, Read};
use thiserror::Error;

/// ADB protocol version
pub const ADB_VERSION: u32 = 0x01000000;

/// Max payload we advertise in CNXN
pub const CONNECT_MAXDATA: u32 = 4096;

/// Largest payload accepted from the peer. A header claiming more than this
/// cannot be skipped safely, so it ends the session.
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// Fixed header size
pub const HEADER_LENGTH: usize = 24;

/// Default CNXN banner
pub const CONNECT_PAYLOAD: &[u8] = b"host::\0";

/// ADB command constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Connect
    Cnxn = 0x4e584e43,
    /// Authentication
    Auth = 0x48545541,
    /// Open stream
    Open = 0x4e45504f,
    /// OK/Ready
    Okay = 0x59414b4f,
    /// Close stream
    Clse = 0x45534c43,
    /// Write data
    Wrte = 0x45545257,
}

impl Command {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x4e584e43 => Some(Command::Cnxn),
            0x48545541 => Some(Command::Auth),
            0x4e45504f => Some(Command::Open),
            0x59414b4f => Some(Command::Okay),
            0x45534c43 => Some(Command::Clse),
            0x45545257 => Some(Command::Wrte),
            _ => None,
        }
    }

    /// Magic value carried in the last header word
    pub fn magic(self) -> u32 {
        (self as u32) ^ 0xffffffff
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Cnxn => write!(f, "CNXN"),
            Command::Auth => write!(f, "AUTH"),
            Command::Open => write!(f, "OPEN"),
            Command::Okay => write!(f, "OKAY"),
            Command::Clse => write!(f, "CLSE"),
            Command::Wrte => write!(f, "WRTE"),
        }
    }
}

/// Authentication types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Token (challenge from device)
    Token = 1,
    /// Signature (response to challenge)
    Signature = 2,
    /// RSA public key
    RsaPublicKey = 3,
}

impl AuthType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AuthType::Token),
            2 => Some(AuthType::Signature),
            3 => Some(AuthType::RsaPublicKey),
            _ => None,
        }
    }
}

/// A decoded ADB frame: 24-byte header plus payload.
///
/// `command` is kept raw so that a frame with an unknown command word can be
/// read off the wire in full and skipped without losing framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_crc32: u32,
    pub magic: u32,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message with checksum and magic filled in
    pub fn new(command: Command, arg0: u32, arg1: u32, data: &[u8]) -> Self {
        Self {
            command: command as u32,
            arg0,
            arg1,
            data_length: data.len() as u32,
            data_crc32: checksum(data),
            magic: command.magic(),
            payload: data.to_vec(),
        }
    }

    /// Known command, if any
    pub fn kind(&self) -> Option<Command> {
        Command::from_u32(self.command)
    }

    /// Serialize header and payload (little-endian)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        bytes.extend_from_slice(&self.command.to_le_bytes());
        bytes.extend_from_slice(&self.arg0.to_le_bytes());
        bytes.extend_from_slice(&self.arg1.to_le_bytes());
        bytes.extend_from_slice(&self.data_length.to_le_bytes());
        bytes.extend_from_slice(&self.data_crc32.to_le_bytes());
        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Read exactly one frame from `source`.
    ///
    /// End-of-input before the frame is complete is [`AdbError::TransportClosed`].
    pub fn decode<R: Read>(source: &mut R) -> Result<Self, AdbError> {
        let mut header = [0u8; HEADER_LENGTH];
        read_full(source, &mut header)?;

        let word = |i: usize| {
            u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]])
        };
        let data_length = word(12);

        if data_length > MAX_PAYLOAD {
            return Err(AdbError::InvalidMessage(format!(
                "Payload length {} exceeds limit {}",
                data_length, MAX_PAYLOAD
            )));
        }

        let mut payload = vec![0u8; data_length as usize];
        if data_length > 0 {
            read_full(source, &mut payload)?;
        }

        Ok(Self {
            command: word(0),
            arg0: word(4),
            arg1: word(8),
            data_length,
            data_crc32: word(16),
            magic: word(20),
            payload,
        })
    }

    /// Magic matches the command and, for a non-empty payload, the checksum
    /// matches the payload bytes.
    pub fn is_valid(&self) -> bool {
        if self.command != self.magic ^ 0xffffffff {
            return false;
        }
        if self.data_length != 0 && checksum(&self.payload) != self.data_crc32 {
            return false;
        }
        true
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(cmd) => write!(f, "{}", cmd)?,
            None => write!(f, "0x{:08x}", self.command)?,
        }
        write!(
            f,
            "(arg0={}, arg1={}, len={})",
            self.arg0, self.arg1, self.data_length
        )
    }
}

/// Encode a complete frame. An empty payload yields a bare 24-byte header
/// with zero length and zero checksum.
pub fn encode(command: Command, arg0: u32, arg1: u32, payload: &[u8]) -> Vec<u8> {
    Message::new(command, arg0, arg1, payload).to_bytes()
}

/// Unsigned byte sum of the payload, wrapping at 2^32
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<(), AdbError> {
    source.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => AdbError::TransportClosed,
        _ => AdbError::Io(e),
    })
}

/// ADB connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// ADB errors
#[derive(Error, Debug)]
pub enum AdbError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Stream rejected: {0}")]
    StreamRejected(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Invalid key data: {0}")]
    InvalidKeyData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
