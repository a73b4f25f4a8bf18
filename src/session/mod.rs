//! A live, framed connection to a peer.

mod reader;

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, span, trace, Instrument, Level};

use crate::config::{Charset, ConnectionConfig};
use crate::error::{LinkError, Result};
use crate::framing::FramingBuffer;
use crate::peer_addr::PeerAddr;
use crate::transport::BoxedChannel;

/// A session's lifecycle. Status only moves forward, in declaration order, though it may skip
///  steps (e.g. from `Connected` straight to `Disconnected` when the connection is lost).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionStatus {
    /// the reader has not started yet
    Connecting,
    Connected,
    /// local disconnect was requested, the reader is shutting down
    Disconnecting,
    Disconnected,
}

/// How a session ended, reported once when its reader exits
#[derive(Debug, Clone)]
pub enum SessionEnd {
    /// after a local `disconnect()`
    Disconnected,
    /// unexpected I/O failure (or end of stream) while connected
    Lost(LinkError),
}

/// A session owns a channel and a background reader task that frames inbound data.
///
/// Inbound messages are either buffered for polling ([Session::read], [Session::available]) or,
///  once a data listener is registered with [Session::on_data_received], pushed to that listener.
///  There is a byte-level counterpart for both ([Session::read_bytes],
///  [Session::on_bytes_received]) that returns messages without decoding them.
///
/// Writing goes through an independent write half and is never blocked by the reader. A write
///  that is blocked on the channel is aborted by [Session::disconnect].
pub struct Session {
    peer: PeerAddr,
    charset: Charset,
    inbox: Mutex<Inbox>,
    writer: Mutex<Option<WriteHalf<BoxedChannel>>>,
    status: watch::Sender<SessionStatus>,
    end: OnceLock<SessionEnd>,
    cancel_token: CancellationToken,
}

struct Inbox {
    buffer: FramingBuffer,
    listener: Option<Listener>,
}

enum Listener {
    Text(mpsc::UnboundedSender<String>),
    Bytes(mpsc::UnboundedSender<Bytes>),
}

impl Listener {
    /// `false` if the receiver is gone
    fn push(&self, frame: &Bytes, charset: Charset) -> bool {
        match self {
            Listener::Text(sender) => sender.send(charset.decode(frame)).is_ok(),
            Listener::Bytes(sender) => sender.send(frame.clone()).is_ok(),
        }
    }
}

impl Inbox {
    /// Pushes all complete messages to the listener, if there is one. If the listener was
    ///  dropped, the undelivered message goes back into the buffer and the session reverts to
    ///  polling.
    fn deliver(&mut self, charset: Charset) {
        let Some(listener) = &self.listener else {
            return;
        };

        while let Some(frame) = self.buffer.read() {
            if !listener.push(&frame, charset) {
                debug!("data listener is gone - buffering for polling");
                self.buffer.unread(&frame);
                self.listener = None;
                return;
            }
        }
    }
}

impl Session {
    /// Creates a session for an established channel and starts its reader. The returned receiver
    ///  gets the session's end.
    pub fn spawn(peer: PeerAddr, channel: BoxedChannel, config: &ConnectionConfig) -> Result<(Arc<Session>, oneshot::Receiver<SessionEnd>)> {
        let delimiter = config.framing_delimiter()?;
        let (read_half, write_half) = tokio::io::split(channel);
        let (status, _) = watch::channel(SessionStatus::Connecting);

        let session = Arc::new(Session {
            peer: peer.clone(),
            charset: config.charset,
            inbox: Mutex::new(Inbox {
                buffer: FramingBuffer::new(Bytes::from(delimiter)),
                listener: None,
            }),
            writer: Mutex::new(Some(write_half)),
            status,
            end: OnceLock::new(),
            cancel_token: CancellationToken::new(),
        });

        let (end_sender, end_receiver) = oneshot::channel();
        let reader = reader::Reader {
            session: session.clone(),
            read_half,
            read_buffer_size: config.read_buffer_size,
            poll_interval: config.read_poll_interval,
        };
        let span = span!(Level::DEBUG, "session", peer = %peer);
        tokio::spawn(reader.run(end_sender).instrument(span));

        Ok((session, end_receiver))
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Resolves once the session is `Disconnected`
    pub async fn closed(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| *s == SessionStatus::Disconnected).await;
    }

    pub fn is_connected(&self) -> bool {
        self.status() < SessionStatus::Disconnecting
    }

    /// How the session ended, once it is `Disconnected`
    pub fn end(&self) -> Option<&SessionEnd> {
        self.end.get()
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected(self.peer.clone()));
        }

        // dropping the write future releases the writer, so the reader can close the channel
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => {
                debug!("write to {:?} was aborted by disconnect", self.peer);
                Err(LinkError::NotConnected(self.peer.clone()))
            }
            r = self.write_to_channel(data) => r,
        }
    }

    async fn write_to_channel(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(LinkError::NotConnected(self.peer.clone()));
        };

        trace!("writing {} bytes to {:?}", data.len(), self.peer);
        writer.write_all(data).await
            .map_err(|e| LinkError::write_failed(self.peer.clone(), e))?;
        writer.flush().await
            .map_err(|e| LinkError::write_failed(self.peer.clone(), e))
    }

    /// Removes and returns the first complete buffered message
    pub async fn read(&self) -> Option<String> {
        let mut inbox = self.inbox.lock().await;
        inbox.buffer.read()
            .map(|frame| self.charset.decode(&frame))
    }

    /// Like [Session::read], but without decoding
    pub async fn read_bytes(&self) -> Option<Bytes> {
        self.inbox.lock().await
            .buffer.read()
    }

    /// number of complete buffered messages - or buffered bytes if there is no delimiter
    pub async fn available(&self) -> usize {
        self.inbox.lock().await
            .buffer.available()
    }

    /// Discards everything that is buffered
    pub async fn clear(&self) {
        self.inbox.lock().await
            .buffer.clear();
    }

    /// Registers a data listener, replacing any previous one. All complete messages that are
    ///  buffered are delivered to it before this call returns, and every message completed later
    ///  is pushed as it arrives. Dropping the receiver has the same effect as
    ///  [Session::clear_on_data_received].
    pub async fn on_data_received(&self) -> mpsc::UnboundedReceiver<String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.register_listener(Listener::Text(sender)).await;
        receiver
    }

    /// Like [Session::on_data_received], but messages are pushed without decoding. This replaces a
    ///  text listener, there is only one listener at a time.
    pub async fn on_bytes_received(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.register_listener(Listener::Bytes(sender)).await;
        receiver
    }

    async fn register_listener(&self, listener: Listener) {
        let mut inbox = self.inbox.lock().await;
        inbox.listener = Some(listener);
        inbox.deliver(self.charset);
        debug!("registered data listener for {:?}", self.peer);
    }

    /// Subsequent messages are buffered for polling again
    pub async fn clear_on_data_received(&self) {
        self.inbox.lock().await
            .listener = None;
    }

    /// Requests shutdown and returns immediately. The reader closes the channel and the session
    ///  becomes `Disconnected` asynchronously.
    pub fn disconnect(&self) {
        if self.advance_status(SessionStatus::Disconnecting) {
            debug!("disconnecting from {:?}", self.peer);
        }
        self.cancel_token.cancel();
    }

    /// Moves status forward. Returns `false` (and leaves status unchanged) if that would not be a
    ///  step forward.
    fn advance_status(&self, next: SessionStatus) -> bool {
        self.status.send_if_modified(|status| {
            if next > *status {
                trace!("{:?}: {:?} -> {:?}", self.peer, status, next);
                *status = next;
                true
            }
            else {
                false
            }
        })
    }

    async fn on_inbound(&self, chunk: &[u8]) {
        let mut inbox = self.inbox.lock().await;
        inbox.buffer.append(chunk);
        inbox.deliver(self.charset);
    }

    async fn close_writer(&self) {
        self.writer.lock().await
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionType;
    use crate::test_util::test_peer_from_number;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

    fn spawn_session(config: &ConnectionConfig) -> (Arc<Session>, oneshot::Receiver<SessionEnd>, DuplexStream) {
        let (local, remote) = duplex(1024);
        let (session, end) = Session::spawn(test_peer_from_number(1), Box::new(local), config).unwrap();
        (session, end, remote)
    }

    impl Session {
        async fn buffered_len_for_test(&self) -> usize {
            self.inbox.lock().await.buffer.len()
        }

        async fn wait_until_buffered(&self, len: usize) {
            while self.buffered_len_for_test().await != len {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn test_polling_delimited() {
        let (session, _end, mut remote) = spawn_session(&ConnectionConfig::default());

        remote.write_all(b"AB\n").await.unwrap();
        session.wait_until_buffered(3).await;
        assert_eq!(session.available().await, 1);

        remote.write_all(b"CD\n").await.unwrap();
        session.wait_until_buffered(6).await;
        assert_eq!(session.available().await, 2);

        remote.write_all(b"EF").await.unwrap();
        session.wait_until_buffered(8).await;
        assert_eq!(session.available().await, 2);

        assert_eq!(session.read().await.as_deref(), Some("AB"));
        assert_eq!(session.read().await.as_deref(), Some("CD"));
        assert_eq!(session.read().await, None);
        assert_eq!(session.available().await, 0);
    }

    #[tokio::test]
    async fn test_listener_raw_mode() {
        let config = ConnectionConfig { delimiter: "".to_string(), ..Default::default() };
        let (session, _end, mut remote) = spawn_session(&config);
        let mut listener = session.on_data_received().await;

        remote.write_all(b"XYZ").await.unwrap();
        assert_eq!(listener.recv().await.as_deref(), Some("XYZ"));
        assert_eq!(session.available().await, 0);
        assert!(listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listener_gets_buffered_messages_first() {
        let (session, _end, mut remote) = spawn_session(&ConnectionConfig::default());

        remote.write_all(b"a\nb\nc").await.unwrap();
        session.wait_until_buffered(5).await;

        let mut listener = session.on_data_received().await;
        assert_eq!(listener.try_recv().ok().as_deref(), Some("a"));
        assert_eq!(listener.try_recv().ok().as_deref(), Some("b"));
        assert!(listener.try_recv().is_err());
        assert_eq!(session.available().await, 0);

        remote.write_all(b"\nd\n").await.unwrap();
        assert_eq!(listener.recv().await.as_deref(), Some("c"));
        assert_eq!(listener.recv().await.as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn test_clearing_listener_reverts_to_polling() {
        let (session, _end, mut remote) = spawn_session(&ConnectionConfig::default());
        let mut listener = session.on_data_received().await;

        remote.write_all(b"one\n").await.unwrap();
        assert_eq!(listener.recv().await.as_deref(), Some("one"));

        session.clear_on_data_received().await;
        assert!(listener.recv().await.is_none());

        remote.write_all(b"two\n").await.unwrap();
        session.wait_until_buffered(4).await;
        assert_eq!(session.read().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_dropped_listener_loses_nothing() {
        let (session, _end, mut remote) = spawn_session(&ConnectionConfig::default());
        drop(session.on_data_received().await);

        remote.write_all(b"x\ny\n").await.unwrap();
        session.wait_until_buffered(4).await;
        assert_eq!(session.available().await, 2);
        assert_eq!(session.read().await.as_deref(), Some("x"));
        assert_eq!(session.read().await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_clear() {
        let (session, _end, mut remote) = spawn_session(&ConnectionConfig::default());
        remote.write_all(b"a\nb").await.unwrap();
        session.wait_until_buffered(3).await;

        session.clear().await;
        assert_eq!(session.available().await, 0);
        assert_eq!(session.read().await, None);
    }

    #[tokio::test]
    async fn test_utf8_character_split_across_reads() {
        let config = ConnectionConfig { charset: Charset::Utf8, ..Default::default() };
        let (session, _end, mut remote) = spawn_session(&config);

        remote.write_all(&[0xc3]).await.unwrap();
        session.wait_until_buffered(1).await;
        remote.write_all(&[0xa4, b'\n']).await.unwrap();
        session.wait_until_buffered(3).await;

        assert_eq!(session.read().await.as_deref(), Some("ä"));
    }

    #[tokio::test]
    async fn test_write() -> anyhow::Result<()> {
        let (session, _end, mut remote) = spawn_session(&ConnectionConfig::default());
        session.write(b"hello").await?;

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_aborts_blocked_write() -> anyhow::Result<()> {
        // nobody reads from the remote end, so a big write fills the pipe and blocks
        let (local, mut remote) = duplex(16);
        let (session, end) = Session::spawn(test_peer_from_number(3), Box::new(local), &ConnectionConfig::default())?;

        let blocked_write = tokio::spawn({
            let session = session.clone();
            async move { session.write(&[0u8; 1024]).await }
        });
        while session.writer.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }

        session.disconnect();
        tokio::time::timeout(Duration::from_secs(2), session.closed()).await?;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(matches!(end.await?, SessionEnd::Disconnected));
        assert!(matches!(blocked_write.await?, Err(LinkError::NotConnected(_))));

        // drain what made it into the pipe, then the closed channel shows
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await?;
        assert!(buf.len() < 1024);
        Ok(())
    }

    #[tokio::test]
    async fn test_binary_bytes_listener() {
        let config = ConnectionConfig { connection_type: ConnectionType::Binary, ..Default::default() };
        let (session, _end, mut remote) = spawn_session(&config);
        let mut listener = session.on_bytes_received().await;

        remote.write_all(&[0x01, 0xff, 0x80, b'\n']).await.unwrap();
        assert_eq!(listener.recv().await.unwrap().as_ref(), &[0x01, 0xff, 0x80, b'\n']);
        assert_eq!(session.available().await, 0);
    }

    #[tokio::test]
    async fn test_binary_polling() {
        let config = ConnectionConfig { connection_type: ConnectionType::Binary, ..Default::default() };
        let (session, _end, mut remote) = spawn_session(&config);

        remote.write_all(&[0xfe, b'\n']).await.unwrap();
        session.wait_until_buffered(2).await;
        remote.write_all(&[0x00]).await.unwrap();
        session.wait_until_buffered(3).await;

        assert_eq!(session.available().await, 3);
        assert_eq!(session.read_bytes().await.unwrap().as_ref(), &[0xfe, b'\n', 0x00]);
        assert_eq!(session.read_bytes().await, None);
    }

    #[tokio::test]
    async fn test_read_bytes_delimited() {
        let (session, _end, mut remote) = spawn_session(&ConnectionConfig::default());
        remote.write_all(b"\xe4\n").await.unwrap();
        session.wait_until_buffered(2).await;

        assert_eq!(session.read_bytes().await.unwrap().as_ref(), b"\xe4");
    }

    /// never delivers data, fails every write
    struct BrokenWriteChannel;

    impl AsyncRead for BrokenWriteChannel {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenWriteChannel {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure() {
        let peer = test_peer_from_number(2);
        let (session, _end) = Session::spawn(peer.clone(), Box::new(BrokenWriteChannel), &ConnectionConfig::default()).unwrap();

        match session.write(b"x").await {
            Err(LinkError::WriteFailed { peer: p, cause }) => {
                assert_eq!(p, peer);
                assert_eq!(cause.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_remote_close_is_loss() {
        let (session, end, remote) = spawn_session(&ConnectionConfig::default());
        drop(remote);

        match end.await.unwrap() {
            SessionEnd::Lost(LinkError::ConnectionLost { peer, cause }) => {
                assert_eq!(peer, test_peer_from_number(1));
                assert_eq!(cause.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected end {:?}", other),
        }
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(matches!(session.end(), Some(SessionEnd::Lost(_))));
        assert!(matches!(session.write(b"x").await, Err(LinkError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_local_disconnect() {
        let (session, end, mut remote) = spawn_session(&ConnectionConfig::default());
        let mut status_changes = session.status_changes();
        status_changes.wait_for(|s| *s == SessionStatus::Connected).await.unwrap();

        session.disconnect();
        assert_eq!(session.status(), SessionStatus::Disconnecting);
        assert!(matches!(session.write(b"x").await, Err(LinkError::NotConnected(_))));

        assert!(matches!(end.await.unwrap(), SessionEnd::Disconnected));
        session.closed().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);

        // the channel is closed
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);

        session.disconnect();
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_interval() {
        let config = ConnectionConfig { read_poll_interval: Duration::from_millis(100), ..Default::default() };
        let (session, end, mut remote) = spawn_session(&config);
        let mut listener = session.on_data_received().await;

        remote.write_all(b"a\n").await.unwrap();
        assert_eq!(listener.recv().await.as_deref(), Some("a"));
        remote.write_all(b"b\n").await.unwrap();
        assert_eq!(listener.recv().await.as_deref(), Some("b"));

        session.disconnect();
        assert!(matches!(end.await.unwrap(), SessionEnd::Disconnected));
    }

    #[test]
    fn test_status_order() {
        assert!(SessionStatus::Connecting < SessionStatus::Connected);
        assert!(SessionStatus::Connected < SessionStatus::Disconnecting);
        assert!(SessionStatus::Disconnecting < SessionStatus::Disconnected);
    }
}
