use std::io;
use std::sync::Arc;

use crate::peer_addr::PeerAddr;

pub type Result<T> = std::result::Result<T, LinkError>;

/// Everything that can go wrong establishing, using or tearing down a peer connection.
///
/// I/O causes are shared behind an [Arc] so that errors can be cloned into broadcast events.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum LinkError {
    /// The transport failed to produce a channel. For the acceptor, the peer is not known.
    #[error("establishing a connection to {peer:?} failed: {cause}")]
    EstablishmentFailed {
        peer: Option<PeerAddr>,
        #[source] cause: Arc<io::Error>,
    },
    #[error("establishment was cancelled")]
    EstablishmentCancelled,
    #[error("connection to {peer:?} was lost: {cause}")]
    ConnectionLost {
        peer: PeerAddr,
        #[source] cause: Arc<io::Error>,
    },
    #[error("writing to {peer:?} failed: {cause}")]
    WriteFailed {
        peer: PeerAddr,
        #[source] cause: Arc<io::Error>,
    },
    #[error("already connecting to {0:?}")]
    AlreadyConnecting(PeerAddr),
    #[error("already connected to {0:?}")]
    AlreadyConnected(PeerAddr),
    #[error("not connected to {0:?}")]
    NotConnected(PeerAddr),
    #[error("not connecting to {0:?}")]
    NotConnecting(PeerAddr),
    #[error("already accepting connections")]
    AlreadyAccepting,
    #[error("not accepting connections")]
    NotAccepting,
    #[error("establishment was already started")]
    AlreadyStarted,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl LinkError {
    pub fn establishment_failed(peer: Option<PeerAddr>, cause: io::Error) -> LinkError {
        LinkError::EstablishmentFailed { peer, cause: Arc::new(cause) }
    }

    pub fn connection_lost(peer: PeerAddr, cause: io::Error) -> LinkError {
        LinkError::ConnectionLost { peer, cause: Arc::new(cause) }
    }

    pub fn write_failed(peer: PeerAddr, cause: io::Error) -> LinkError {
        LinkError::WriteFailed { peer, cause: Arc::new(cause) }
    }

    /// The underlying I/O error, if there is one
    pub fn io_cause(&self) -> Option<&io::Error> {
        match self {
            LinkError::EstablishmentFailed { cause, .. }
            | LinkError::ConnectionLost { cause, .. }
            | LinkError::WriteFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}
