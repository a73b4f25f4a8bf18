use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{LinkError, Result};

/// Well-known serial port profile service UUID `00001101-0000-1000-8000-00805F9B34FB`
pub const SERIAL_PORT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);

pub const MAX_READ_BUFFER_SIZE: usize = 16*1024*1024;

/// Establishment and framing parameters. A config is handed to an establisher or a session by
///  reference and is never changed by them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub connection_type: ConnectionType,
    /// Message boundary marker, ignored for [ConnectionType::Binary]. An empty delimiter switches framing to raw mode where the whole
    ///  buffer is a single message.
    pub delimiter: String,
    /// Used to encode the delimiter and to decode each extracted message
    pub charset: Charset,
    /// size of the working buffer for each read from the channel
    pub read_buffer_size: usize,
    /// Pause between reader loop iterations, zero for no pause
    pub read_poll_interval: Duration,
    pub security: SecurityMode,
    pub service: ServiceId,
    /// Number of inbound channels an acceptor waits for. The first one becomes the session, the
    ///  others are closed.
    pub accept_count: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connection_type: ConnectionType::Delimited,
            delimiter: "\n".to_string(),
            charset: Charset::Ascii,
            read_buffer_size: 1024,
            read_poll_interval: Duration::ZERO,
            security: SecurityMode::Secure,
            service: ServiceId::default(),
            accept_count: 1,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(LinkError::InvalidConfiguration("read buffer size must be positive".to_string()));
        }
        if self.read_buffer_size > MAX_READ_BUFFER_SIZE {
            return Err(LinkError::InvalidConfiguration(format!("read buffer size {} exceeds the maximum of {}", self.read_buffer_size, MAX_READ_BUFFER_SIZE)));
        }
        if self.accept_count == 0 {
            return Err(LinkError::InvalidConfiguration("accept count must be at least 1".to_string()));
        }
        if self.service.name.trim().is_empty() {
            return Err(LinkError::InvalidConfiguration("service name must not be blank".to_string()));
        }
        self.framing_delimiter()?;
        Ok(())
    }

    /// The delimiter in the configured charset
    pub fn delimiter_bytes(&self) -> Result<Vec<u8>> {
        self.charset.encode(&self.delimiter)
            .ok_or_else(|| LinkError::InvalidConfiguration(format!("delimiter {:?} can not be encoded as {}", self.delimiter, self.charset)))
    }

    /// The message boundary the framing buffer uses: empty (whole buffer) for binary connections
    pub fn framing_delimiter(&self) -> Result<Vec<u8>> {
        match self.connection_type {
            ConnectionType::Delimited => self.delimiter_bytes(),
            ConnectionType::Binary => Ok(Vec::new()),
        }
    }
}

/// How inbound data is segmented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    /// messages are separated by the configured delimiter
    #[default]
    Delimited,
    /// Everything received so far is one message, and the delimiter is not used. Meant for
    ///  byte-level access through [crate::Session::read_bytes] and
    ///  [crate::Session::on_bytes_received].
    Binary,
}

impl Display for ConnectionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Delimited => write!(f, "delimited"),
            ConnectionType::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for ConnectionType {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delimited" => Ok(ConnectionType::Delimited),
            "binary" => Ok(ConnectionType::Binary),
            other => Err(LinkError::InvalidConfiguration(format!("unsupported connection type {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// authenticated and encrypted channels
    Secure,
    Insecure,
}

/// Identifies the service a listening endpoint is bound to and a connector connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceId {
    pub name: String,
    pub uuid: Uuid,
}

impl Default for ServiceId {
    fn default() -> Self {
        ServiceId {
            name: "peerlink".to_string(),
            uuid: SERIAL_PORT_SERVICE_UUID,
        }
    }
}

/// Text encoding of inbound messages.
///
/// Framing works on bytes, decoding happens per extracted message. So a multi-byte character
///  that arrives split over two reads is decoded correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Ascii,
    Utf8,
    Latin1,
}

impl Charset {
    /// Decodes a message. Bytes that are invalid in the charset become U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Ascii => bytes.iter()
                .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
                .collect(),
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// `None` if the text contains characters that have no representation in the charset
    pub fn encode(&self, text: &str) -> Option<Vec<u8>> {
        match self {
            Charset::Ascii => text.is_ascii().then(|| text.as_bytes().to_vec()),
            Charset::Utf8 => Some(text.as_bytes().to_vec()),
            Charset::Latin1 => text.chars()
                .map(|c| u8::try_from(u32::from(c)).ok())
                .collect(),
        }
    }
}

impl Display for Charset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Charset::Ascii => write!(f, "ascii"),
            Charset::Utf8 => write!(f, "utf-8"),
            Charset::Latin1 => write!(f, "iso-8859-1"),
        }
    }
}

impl FromStr for Charset {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ascii" | "us-ascii" => Ok(Charset::Ascii),
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "iso-8859-1" | "latin1" | "latin-1" => Ok(Charset::Latin1),
            other => Err(LinkError::InvalidConfiguration(format!("unsupported charset {:?}", other))),
        }
    }
}
