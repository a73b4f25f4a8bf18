use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::session::{Session, SessionEnd, SessionStatus};
use crate::transport::BoxedChannel;

/// The background loop servicing a session's channel. It is the only place where inbound data is
///  framed and delivered, so message order is arrival order.
pub(super) struct Reader {
    pub session: Arc<Session>,
    pub read_half: ReadHalf<BoxedChannel>,
    pub read_buffer_size: usize,
    pub poll_interval: Duration,
}

impl Reader {
    pub async fn run(mut self, end_sender: oneshot::Sender<SessionEnd>) {
        self.session.advance_status(SessionStatus::Connected);
        info!("session with {:?} is connected", self.session.peer);

        let end = self.read_loop().await;

        // aborts a write that is blocked on the channel, releasing the write half
        self.session.cancel_token.cancel();
        // both halves must be gone for the channel to close
        self.session.close_writer().await;
        drop(self.read_half);
        let _ = self.session.end.set(end.clone());
        self.session.advance_status(SessionStatus::Disconnected);

        match &end {
            SessionEnd::Disconnected => info!("session with {:?} was disconnected", self.session.peer),
            SessionEnd::Lost(e) => warn!("{}", e),
        }
        if end_sender.send(end).is_err() {
            trace!("nobody is waiting for the end of the session");
        }
    }

    async fn read_loop(&mut self) -> SessionEnd {
        let cancel_token = self.session.cancel_token.clone();
        let mut buf = vec![0u8; self.read_buffer_size];

        loop {
            let read_result = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return SessionEnd::Disconnected,
                r = self.read_half.read(&mut buf) => r,
            };

            match read_result {
                Ok(0) => return self.on_read_failure(io::Error::new(io::ErrorKind::UnexpectedEof, "channel was closed by the peer")),
                Ok(n) => {
                    trace!("received {} bytes", n);
                    self.session.on_inbound(&buf[..n]).await;
                }
                Err(e) => return self.on_read_failure(e),
            }

            if !self.poll_interval.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => return SessionEnd::Disconnected,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
    }

    fn on_read_failure(&self, e: io::Error) -> SessionEnd {
        if self.session.status() >= SessionStatus::Disconnecting {
            debug!("read failed while disconnecting - regular termination: {}", e);
            return SessionEnd::Disconnected;
        }
        SessionEnd::Lost(LinkError::connection_lost(self.session.peer.clone(), e))
    }
}
