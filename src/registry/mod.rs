//! Coordination of establishment attempts and sessions, keeping at most one attempt or session
//!  per peer, and at most one accept attempt overall.

pub mod events;

use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{LinkError, Result};
use crate::establish::Establisher;
use crate::peer_addr::PeerAddr;
use crate::registry::events::{RegistryEvent, RegistryEventNotifier};
use crate::session::{Session, SessionEnd};
use crate::transport::{Established, PeerTransport};

/// The two ways of establishing a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// actively connect to a known peer
    Connect(PeerAddr),
    /// Wait for a peer to connect. The peer is only known once the channel is established, so
    ///  there is a single accept attempt for all peers.
    Accept,
}

struct Attempt {
    id: u64,
    establisher: Establisher,
}

#[derive(Default)]
struct RegistryState {
    attempts: FxHashMap<PeerAddr, Attempt>,
    accepting: Option<Attempt>,
    sessions: FxHashMap<PeerAddr, Arc<Session>>,
    next_attempt_id: u64,
}

impl RegistryState {
    fn next_attempt_id(&mut self) -> u64 {
        self.next_attempt_id += 1;
        self.next_attempt_id
    }

    /// Removes the attempt, unless it was replaced (or removed) in the meantime
    fn remove_attempt(&mut self, role: &Role, id: u64) -> bool {
        match role {
            Role::Connect(peer) => {
                if self.attempts.get(peer).map(|a| a.id) == Some(id) {
                    self.attempts.remove(peer);
                    return true;
                }
            }
            Role::Accept => {
                if self.accepting.as_ref().map(|a| a.id) == Some(id) {
                    self.accepting = None;
                    return true;
                }
            }
        }
        false
    }
}

/// Registry of in-flight establishment attempts and live sessions.
///
/// All bookkeeping happens under a single lock, so checking an invariant and the change it
///  guards are atomic. Lifecycle changes are published as [RegistryEvent]s.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    transport: Arc<dyn PeerTransport>,
    state: Mutex<RegistryState>,
    notifier: RegistryEventNotifier,
}

impl Registry {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                transport,
                state: Default::default(),
                notifier: RegistryEventNotifier::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.notifier.subscribe()
    }

    pub async fn connect(&self, peer: PeerAddr, config: ConnectionConfig) -> Result<Arc<Session>> {
        self.establish(Role::Connect(peer), config).await
    }

    pub async fn accept(&self, config: ConnectionConfig) -> Result<Arc<Session>> {
        self.establish(Role::Accept, config).await
    }

    /// Starts an establishment attempt and waits for its outcome: the new session, or the reason
    ///  why there is none. The outcome is published as an event as well.
    ///
    /// The attempt's bookkeeping does not depend on the returned future being polled to
    ///  completion: If it is dropped, the attempt goes on and its outcome is only published.
    pub async fn establish(&self, role: Role, config: ConnectionConfig) -> Result<Arc<Session>> {
        config.validate()?;

        let (id, outcome_receiver) = {
            let mut state = self.inner.state.lock().await;

            let mut establisher = match &role {
                Role::Connect(peer) => {
                    if state.attempts.contains_key(peer) {
                        return Err(LinkError::AlreadyConnecting(peer.clone()));
                    }
                    self.retire_if_ended(&mut state, peer);
                    if state.sessions.contains_key(peer) {
                        return Err(LinkError::AlreadyConnected(peer.clone()));
                    }
                    Establisher::connector(self.inner.transport.clone(), peer.clone(), config.clone())?
                }
                Role::Accept => {
                    if state.accepting.is_some() {
                        return Err(LinkError::AlreadyAccepting);
                    }
                    Establisher::acceptor(self.inner.transport.clone(), config.clone())?
                }
            };

            let outcome_receiver = establisher.start()?;
            let id = state.next_attempt_id();
            let attempt = Attempt { id, establisher };

            match &role {
                Role::Connect(peer) => {
                    debug!("connecting to {:?}", peer);
                    state.attempts.insert(peer.clone(), attempt);
                }
                Role::Accept => {
                    info!("accepting connections");
                    state.accepting = Some(attempt);
                    self.inner.notifier.send_event(RegistryEvent::AcceptingChanged { accepting: true });
                }
            }
            (id, outcome_receiver)
        };

        let (result_sender, result_receiver) = oneshot::channel();
        let registry = self.clone();
        tokio::spawn(async move {
            let result = registry.on_outcome(role, id, outcome_receiver, config).await;
            let _ = result_sender.send(result);
        });

        result_receiver.await
            .unwrap_or(Err(LinkError::EstablishmentCancelled))
    }

    async fn on_outcome(&self, role: Role, id: u64, outcome_receiver: oneshot::Receiver<Result<Established>>, config: ConnectionConfig) -> Result<Arc<Session>> {
        let outcome = outcome_receiver.await;

        let mut state = self.inner.state.lock().await;
        let was_registered = state.remove_attempt(&role, id);
        if was_registered && role == Role::Accept {
            info!("stopped accepting connections");
            self.inner.notifier.send_event(RegistryEvent::AcceptingChanged { accepting: false });
        }

        let established = match outcome {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                warn!("establishment failed: {}", e);
                let peer = match &role {
                    Role::Connect(peer) => Some(peer.clone()),
                    Role::Accept => None,
                };
                self.inner.notifier.send_event(RegistryEvent::AttemptFailed { peer, error: e.clone() });
                return Err(e);
            }
            Err(_) => {
                debug!("{:?} was cancelled", role);
                return Err(LinkError::EstablishmentCancelled);
            }
        };

        if !was_registered {
            debug!("{:?} was cancelled after it succeeded - closing the channel", role);
            return Err(LinkError::EstablishmentCancelled);
        }

        let peer = established.peer.clone();
        self.retire_if_ended(&mut state, &peer);
        let rejection = if state.sessions.contains_key(&peer) {
            Some(LinkError::AlreadyConnected(peer.clone()))
        }
        else if state.attempts.contains_key(&peer) {
            Some(LinkError::AlreadyConnecting(peer.clone()))
        }
        else {
            None
        };
        if let Some(e) = rejection {
            warn!("rejecting inbound connection: {}", e);
            self.inner.notifier.send_event(RegistryEvent::AttemptFailed { peer: Some(peer), error: e.clone() });
            return Err(e);
        }

        let (session, end_receiver) = match Session::spawn(peer.clone(), established.channel, &config) {
            Ok(s) => s,
            Err(e) => {
                self.inner.notifier.send_event(RegistryEvent::AttemptFailed { peer: Some(peer), error: e.clone() });
                return Err(e);
            }
        };
        state.sessions.insert(peer.clone(), session.clone());
        self.inner.notifier.send_event(RegistryEvent::AttemptSucceeded { peer });
        drop(state);

        let registry = self.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            registry.on_session_end(watched, end_receiver).await;
        });

        Ok(session)
    }

    async fn on_session_end(&self, session: Arc<Session>, end_receiver: oneshot::Receiver<SessionEnd>) {
        let _ = end_receiver.await;

        let mut state = self.inner.state.lock().await;
        self.retire_session(&mut state, &session);
    }

    /// A session that ended stays registered until its watcher task gets to it. Code that checks
    ///  for an existing session calls this first, so a peer is free again as soon as its session
    ///  ended.
    fn retire_if_ended(&self, state: &mut RegistryState, peer: &PeerAddr) {
        if let Some(session) = state.sessions.get(peer).cloned() {
            self.retire_session(state, &session);
        }
    }

    /// Removes an ended session and publishes how it ended. Whoever gets here first does this,
    ///  the session is removed and published exactly once.
    fn retire_session(&self, state: &mut RegistryState, session: &Arc<Session>) {
        let Some(end) = session.end() else {
            return;
        };

        let peer = session.peer().clone();
        let is_current = state.sessions.get(&peer)
            .map(|s| Arc::ptr_eq(s, session))
            .unwrap_or(false);
        if !is_current {
            // removed by a local disconnect
            return;
        }
        state.sessions.remove(&peer);

        match end {
            SessionEnd::Lost(error) => {
                self.inner.notifier.send_event(RegistryEvent::SessionLost { peer, error: error.clone() });
            }
            SessionEnd::Disconnected => {
                debug!("session with {:?} was disconnected without going through the registry", peer);
                self.inner.notifier.send_event(RegistryEvent::Disconnected { peer });
            }
        }
    }

    /// Cancels the in-flight connect attempt for a peer. Its pending `connect` resolves with
    ///  [LinkError::EstablishmentCancelled], and no failure is published.
    pub async fn cancel_connect(&self, peer: &PeerAddr) -> Result<()> {
        let attempt = self.inner.state.lock().await
            .attempts.remove(peer)
            .ok_or_else(|| LinkError::NotConnecting(peer.clone()))?;
        attempt.establisher.cancel();
        info!("cancelled connecting to {:?}", peer);
        Ok(())
    }

    pub async fn cancel_accept(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let attempt = state.accepting.take()
            .ok_or(LinkError::NotAccepting)?;
        attempt.establisher.cancel();
        info!("cancelled accepting connections");
        self.inner.notifier.send_event(RegistryEvent::AcceptingChanged { accepting: false });
        Ok(())
    }

    /// Removes the peer's session and starts disconnecting it. This never results in a
    ///  [RegistryEvent::SessionLost].
    pub async fn disconnect(&self, peer: &PeerAddr) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let session = state.sessions.remove(peer)
            .ok_or_else(|| LinkError::NotConnected(peer.clone()))?;
        session.disconnect();
        self.inner.notifier.send_event(RegistryEvent::Disconnected { peer: peer.clone() });
        Ok(())
    }

    /// Cancels all attempts and disconnects all sessions
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;

        for (peer, attempt) in state.attempts.drain() {
            debug!("shutdown: cancelling connect to {:?}", peer);
            attempt.establisher.cancel();
        }
        if let Some(attempt) = state.accepting.take() {
            attempt.establisher.cancel();
            self.inner.notifier.send_event(RegistryEvent::AcceptingChanged { accepting: false });
        }
        for (peer, session) in state.sessions.drain() {
            session.disconnect();
            self.inner.notifier.send_event(RegistryEvent::Disconnected { peer });
        }
        info!("registry was shut down");
    }

    pub async fn session(&self, peer: &PeerAddr) -> Option<Arc<Session>> {
        self.inner.state.lock().await
            .sessions.get(peer)
            .cloned()
    }

    pub async fn is_connected(&self, peer: &PeerAddr) -> bool {
        self.inner.state.lock().await
            .sessions.contains_key(peer)
    }

    pub async fn is_connecting(&self, peer: &PeerAddr) -> bool {
        self.inner.state.lock().await
            .attempts.contains_key(peer)
    }

    pub async fn is_accepting(&self) -> bool {
        self.inner.state.lock().await
            .accepting.is_some()
    }

    pub async fn connected_peers(&self) -> Vec<PeerAddr> {
        let mut result: Vec<PeerAddr> = self.inner.state.lock().await
            .sessions.keys()
            .cloned()
            .collect();
        result.sort();
        result
    }

    async fn connected_session(&self, peer: &PeerAddr) -> Result<Arc<Session>> {
        self.session(peer).await
            .ok_or_else(|| LinkError::NotConnected(peer.clone()))
    }

    pub async fn write(&self, peer: &PeerAddr, data: &[u8]) -> Result<()> {
        self.connected_session(peer).await?
            .write(data).await
    }

    pub async fn read(&self, peer: &PeerAddr) -> Result<Option<String>> {
        Ok(self.connected_session(peer).await?
            .read().await)
    }

    pub async fn read_bytes(&self, peer: &PeerAddr) -> Result<Option<Bytes>> {
        Ok(self.connected_session(peer).await?
            .read_bytes().await)
    }

    pub async fn available(&self, peer: &PeerAddr) -> Result<usize> {
        Ok(self.connected_session(peer).await?
            .available().await)
    }

    pub async fn clear(&self, peer: &PeerAddr) -> Result<()> {
        self.connected_session(peer).await?
            .clear().await;
        Ok(())
    }
}
