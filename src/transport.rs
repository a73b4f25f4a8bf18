//! The seam to the platform transport. Everything behind these traits (radio stack, sockets,
//!  service records, pairing) lives outside this crate.

use std::fmt::{Debug, Formatter};
use std::io;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ConnectionConfig;
use crate::peer_addr::PeerAddr;

/// An established duplex byte stream to a peer. Dropping it closes it.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Channel for T {}

pub type BoxedChannel = Box<dyn Channel>;

/// The ways of opening a channel to a peer, in the order a connector tries them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectStrategy {
    /// look up the peer's service record by the configured service UUID
    ServiceRecord,
    /// Connect to a fixed channel number, bypassing the service lookup. Some stacks reject the
    ///  service record path but accept this one.
    DirectChannel { channel: u8 },
}

impl ConnectStrategy {
    pub const PRIMARY: ConnectStrategy = ConnectStrategy::ServiceRecord;
    pub const FALLBACK: ConnectStrategy = ConnectStrategy::DirectChannel { channel: 1 };
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Opens a channel to a peer, honouring the config's security mode and service
    async fn connect(&self, peer: &PeerAddr, strategy: ConnectStrategy, config: &ConnectionConfig) -> io::Result<BoxedChannel>;

    /// Binds a listening endpoint for the config's service
    async fn listen(&self, config: &ConnectionConfig) -> io::Result<Box<dyn ChannelListener>>;
}

#[async_trait]
pub trait ChannelListener: Send + 'static {
    async fn accept(&mut self) -> io::Result<Established>;

    /// Closes the listening endpoint. A pending or subsequent `accept` fails.
    fn close(&mut self);
}

/// A channel together with the peer at its other end
pub struct Established {
    pub peer: PeerAddr,
    pub channel: BoxedChannel,
}

impl Debug for Established {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Established{:?}", self.peer)
    }
}
