use tokio::sync::broadcast;
use tracing::trace;

use crate::error::LinkError;
use crate::peer_addr::PeerAddr;

#[derive(Clone, Debug)]
pub enum RegistryEvent {
    AttemptSucceeded {
        peer: PeerAddr,
    },
    /// A connect or accept attempt failed. `peer` is unknown for accept attempts that failed
    ///  before a peer connected.
    AttemptFailed {
        peer: Option<PeerAddr>,
        error: LinkError,
    },
    /// A session ended because of an I/O failure, not because of a local disconnect
    SessionLost {
        peer: PeerAddr,
        error: LinkError,
    },
    /// A session was disconnected locally
    Disconnected {
        peer: PeerAddr,
    },
    AcceptingChanged {
        accepting: bool,
    },
}

pub struct RegistryEventNotifier {
    sender: broadcast::Sender<RegistryEvent>,
}
impl RegistryEventNotifier {
    pub fn new() -> RegistryEventNotifier {
        let (sender, _) = broadcast::channel(128);

        RegistryEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: RegistryEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for RegistryEventNotifier {
    fn default() -> Self {
        RegistryEventNotifier::new()
    }
}
