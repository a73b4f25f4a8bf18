//! Asynchronous, cancellable production of a connected channel, either actively ([connector])
//!  or passively ([acceptor]).

pub mod acceptor;
pub mod connector;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, span, Instrument, Level};

use crate::config::ConnectionConfig;
use crate::error::{LinkError, Result};
use crate::peer_addr::PeerAddr;
use crate::transport::{Established, PeerTransport};

/// `None` means the work noticed it was cancelled
type EstablishWork = Pin<Box<dyn Future<Output = Option<Result<Established>>> + Send>>;

/// A single establishment attempt, running as its own task once started.
///
/// The attempt reports exactly one outcome through the receiver returned by
///  [Establisher::start], unless it is cancelled before its transport primitive returns: Then the
///  sender is dropped without a value, and the attempt is retired silently.
pub struct Establisher {
    description: String,
    cancel_token: CancellationToken,
    /// set once an outcome was handed to the receiver
    completed: Arc<AtomicBool>,
    work: Option<EstablishWork>,
}

impl Establisher {
    /// An establisher that actively connects to a peer
    pub fn connector(transport: Arc<dyn PeerTransport>, peer: PeerAddr, config: ConnectionConfig) -> Result<Establisher> {
        config.validate()?;

        let cancel_token = CancellationToken::new();
        let description = format!("connect to {:?}", peer);
        let work = connector::connect(transport, peer, config, cancel_token.clone());
        Ok(Establisher::new(description, cancel_token, Box::pin(work)))
    }

    /// An establisher that waits for a peer to connect
    pub fn acceptor(transport: Arc<dyn PeerTransport>, config: ConnectionConfig) -> Result<Establisher> {
        config.validate()?;

        let cancel_token = CancellationToken::new();
        let description = format!("accept on {}", config.service.name);
        let work = acceptor::accept(transport, config, cancel_token.clone());
        Ok(Establisher::new(description, cancel_token, Box::pin(work)))
    }

    fn new(description: String, cancel_token: CancellationToken, work: EstablishWork) -> Establisher {
        Establisher {
            description,
            cancel_token,
            completed: Default::default(),
            work: Some(work),
        }
    }

    /// Spawns the establishment work and returns immediately. May be called only once.
    pub fn start(&mut self) -> Result<oneshot::Receiver<Result<Established>>> {
        let work = self.work.take()
            .ok_or(LinkError::AlreadyStarted)?;

        let (sender, receiver) = oneshot::channel();
        let cancel_token = self.cancel_token.clone();
        let completed = self.completed.clone();
        let span = span!(Level::DEBUG, "establish", attempt = %self.description);

        tokio::spawn(async move {
            let outcome = work.await;
            match outcome {
                Some(outcome) if !cancel_token.is_cancelled() => {
                    completed.store(true, Ordering::Release);
                    if let Err(unclaimed) = sender.send(outcome) {
                        debug!("nobody is waiting for the outcome any more: {:?}", unclaimed.map(|e| e.peer));
                    }
                }
                _ => debug!("cancelled - retiring without outcome"),
            }
        }.instrument(span));

        Ok(receiver)
    }

    /// Idempotent, and a no-op once the outcome was delivered
    pub fn cancel(&self) {
        if self.completed.load(Ordering::Acquire) {
            debug!("not cancelling attempt to {} - it is complete", self.description);
            return;
        }
        if !self.cancel_token.is_cancelled() {
            debug!("cancelling attempt to {}", self.description);
            self.cancel_token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
