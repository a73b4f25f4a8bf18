use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{LinkError, Result};
use crate::peer_addr::PeerAddr;
use crate::transport::{BoxedChannel, ConnectStrategy, Established, PeerTransport};

/// Opens a channel to the peer, trying the primary strategy and then exactly one fallback.
///
/// Returns `None` if cancelled: A failure that happens after cancellation is the consequence of
///  the cancellation and not reported.
pub(crate) async fn connect(transport: Arc<dyn PeerTransport>, peer: PeerAddr, config: ConnectionConfig, cancel_token: CancellationToken) -> Option<Result<Established>> {
    let channel = match try_connect(transport.as_ref(), &peer, ConnectStrategy::PRIMARY, &config, &cancel_token).await? {
        Ok(channel) => channel,
        Err(e) => {
            if cancel_token.is_cancelled() {
                return None;
            }
            warn!("primary connect to {:?} failed, trying fallback: {}", peer, e);

            match try_connect(transport.as_ref(), &peer, ConnectStrategy::FALLBACK, &config, &cancel_token).await? {
                Ok(channel) => channel,
                Err(e) => {
                    if cancel_token.is_cancelled() {
                        return None;
                    }
                    debug!("fallback connect to {:?} failed: {}", peer, e);
                    return Some(Err(LinkError::establishment_failed(Some(peer), e)));
                }
            }
        }
    };

    if cancel_token.is_cancelled() {
        debug!("connected to {:?} after cancellation - closing the channel", peer);
        return None;
    }

    info!("connected to {:?}", peer);
    Some(Ok(Established { peer, channel }))
}

async fn try_connect(transport: &dyn PeerTransport, peer: &PeerAddr, strategy: ConnectStrategy, config: &ConnectionConfig, cancel_token: &CancellationToken) -> Option<io::Result<BoxedChannel>> {
    debug!("connecting to {:?} with {:?} ({:?})", peer, strategy, config.security);
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => None,
        result = transport.connect(peer, strategy, config) => Some(result),
    }
}
