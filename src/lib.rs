//! Point-to-point peer connections over a connection-oriented byte stream transport: establishing
//!  channels (actively or passively), framing inbound bytes into messages, and keeping at most
//!  one attempt or session per peer.

pub mod config;
pub mod error;
pub mod establish;
pub mod framing;
pub mod peer_addr;
pub mod registry;
pub mod session;
pub mod transport;
pub mod test_util;

pub use config::{Charset, ConnectionConfig, ConnectionType, SecurityMode, ServiceId};
pub use error::{LinkError, Result};
pub use peer_addr::PeerAddr;
pub use registry::events::RegistryEvent;
pub use registry::{Registry, Role};
pub use session::{Session, SessionEnd, SessionStatus};


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
