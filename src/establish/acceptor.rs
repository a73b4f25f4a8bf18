use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{LinkError, Result};
use crate::transport::{ChannelListener, Established, PeerTransport};

/// Binds a listening endpoint and waits for `accept_count` inbound channels. The first of them is
///  the result, surplus channels are closed. The listening endpoint is closed in every case.
///
/// Returns `None` if cancelled.
pub(crate) async fn accept(transport: Arc<dyn PeerTransport>, config: ConnectionConfig, cancel_token: CancellationToken) -> Option<Result<Established>> {
    let listen_result = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => return None,
        r = transport.listen(&config) => r,
    };
    let mut listener = match listen_result {
        Ok(listener) => listener,
        Err(e) => {
            if cancel_token.is_cancelled() {
                return None;
            }
            return Some(Err(LinkError::establishment_failed(None, e)));
        }
    };

    info!("accepting connections for service {} ({:?})", config.service.name, config.security);
    let result = accept_loop(&mut listener, config.accept_count, &cancel_token).await;
    listener.close();
    debug!("closed listening endpoint for service {}", config.service.name);
    result
}

async fn accept_loop(listener: &mut Box<dyn ChannelListener>, accept_count: usize, cancel_token: &CancellationToken) -> Option<Result<Established>> {
    let mut chosen: Option<Established> = None;

    for _ in 0..accept_count {
        let accepted = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return None,
            r = listener.accept() => r,
        };

        match accepted {
            Ok(established) => {
                if chosen.is_none() {
                    info!("accepted connection from {:?}", established.peer);
                    chosen = Some(established);
                }
                else {
                    warn!("closing surplus inbound connection from {:?}", established.peer);
                }
            }
            Err(e) => {
                if cancel_token.is_cancelled() {
                    return None;
                }
                return Some(Err(LinkError::establishment_failed(None, e)));
            }
        }
    }

    if cancel_token.is_cancelled() {
        return None;
    }
    chosen.map(Ok)
}
