use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::config::ConnectionConfig;
use crate::peer_addr::PeerAddr;
use crate::transport::{BoxedChannel, ChannelListener, ConnectStrategy, Established, PeerTransport};

const DUPLEX_BUFFER_SIZE: usize = 64*1024;

/// How a peer reacts to connect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    Reachable,
    /// the primary strategy is refused, the fallback works
    PrimaryRefused,
    Unreachable,
    /// connect attempts never complete
    Hanging,
}

/// In-memory [PeerTransport] for tests. Channels are [tokio::io::duplex] pipes, and the test
///  code gets hold of the remote end of each pipe to play the peer.
#[derive(Clone, Default)]
pub struct TestTransport {
    state: Arc<Mutex<TestTransportState>>,
}

#[derive(Default)]
struct TestTransportState {
    behaviors: FxHashMap<PeerAddr, PeerBehavior>,
    remote_ends: FxHashMap<PeerAddr, Vec<DuplexStream>>,
    connect_attempts: Vec<(PeerAddr, ConnectStrategy)>,
    listener: Option<mpsc::UnboundedSender<Established>>,
}

impl TestTransport {
    pub fn new() -> TestTransport {
        Default::default()
    }

    /// Peers without explicitly configured behavior are [PeerBehavior::Reachable]
    pub async fn set_behavior(&self, peer: &PeerAddr, behavior: PeerBehavior) {
        self.state.lock().await
            .behaviors.insert(peer.clone(), behavior);
    }

    /// The peer's end of the oldest channel that was opened to it and not taken yet
    pub async fn take_remote_end(&self, peer: &PeerAddr) -> Option<DuplexStream> {
        let mut state = self.state.lock().await;
        let ends = state.remote_ends.get_mut(peer)?;
        if ends.is_empty() {
            return None;
        }
        Some(ends.remove(0))
    }

    pub async fn connect_attempts(&self) -> Vec<(PeerAddr, ConnectStrategy)> {
        self.state.lock().await
            .connect_attempts.clone()
    }

    pub async fn is_listening(&self) -> bool {
        self.state.lock().await
            .listener.as_ref()
            .map(|l| !l.is_closed())
            .unwrap_or(false)
    }

    /// Simulates an inbound connection from a peer, returning the peer's end of the channel. Fails
    ///  with [io::ErrorKind::ConnectionRefused] if nothing is listening.
    pub async fn dial_in(&self, peer: &PeerAddr) -> io::Result<DuplexStream> {
        let state = self.state.lock().await;
        let listener = state.listener.as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        let (local, remote) = duplex(DUPLEX_BUFFER_SIZE);
        listener.send(Established { peer: peer.clone(), channel: Box::new(local) })
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        trace!("dialed in from {:?}", peer);
        Ok(remote)
    }
}

#[async_trait]
impl PeerTransport for TestTransport {
    async fn connect(&self, peer: &PeerAddr, strategy: ConnectStrategy, _config: &ConnectionConfig) -> io::Result<BoxedChannel> {
        let behavior = {
            let mut state = self.state.lock().await;
            state.connect_attempts.push((peer.clone(), strategy));
            state.behaviors.get(peer).copied()
                .unwrap_or(PeerBehavior::Reachable)
        };

        match (behavior, strategy) {
            (PeerBehavior::Hanging, _) => std::future::pending().await,
            (PeerBehavior::Unreachable, _) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("{} is unreachable", peer))),
            (PeerBehavior::PrimaryRefused, ConnectStrategy::ServiceRecord) => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "service record lookup refused")),
            _ => {
                let (local, remote) = duplex(DUPLEX_BUFFER_SIZE);
                self.state.lock().await
                    .remote_ends.entry(peer.clone()).or_default()
                    .push(remote);
                Ok(Box::new(local))
            }
        }
    }

    async fn listen(&self, _config: &ConnectionConfig) -> io::Result<Box<dyn ChannelListener>> {
        let mut state = self.state.lock().await;
        if state.listener.as_ref().map(|l| !l.is_closed()).unwrap_or(false) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.listener = Some(sender);
        Ok(Box::new(TestListener { receiver }))
    }
}

struct TestListener {
    receiver: mpsc::UnboundedReceiver<Established>,
}

#[async_trait]
impl ChannelListener for TestListener {
    async fn accept(&mut self) -> io::Result<Established> {
        self.receiver.recv().await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener was closed"))
    }

    fn close(&mut self) {
        self.receiver.close();
    }
}
