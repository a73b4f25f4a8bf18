use std::fmt::{Debug, Display, Formatter};

/// Opaque, stable identifier of a remote endpoint. What the string contains (a hardware address,
///  a host name, ...) is up to the transport.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerAddr(String);

impl PeerAddr {
    pub fn new(addr: impl Into<String>) -> PeerAddr {
        PeerAddr(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddr {
    fn from(value: &str) -> Self {
        PeerAddr(value.to_string())
    }
}

impl From<String> for PeerAddr {
    fn from(value: String) -> Self {
        PeerAddr(value)
    }
}
