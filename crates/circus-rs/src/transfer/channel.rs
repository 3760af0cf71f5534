//! Duplex channel: one physical connection shared by every transfer.
//!
//! Lifecycle: `Disconnected → Connecting → Connected → Disconnected`.
//!
//! - `connect()` is single-flight: concurrent callers await one shared
//!   attempt; a failed attempt clears the gate so the next call retries.
//! - `send()` connects lazily and hands the frame to the link's single
//!   writer task, so wire order is the order sends reach the link.
//! - Every inbound message fans out to every registered handler.
//! - When a link goes down, disconnect handlers receive its [`LinkId`].
//!
//! A failed connection is never retried here. The next `connect`/`send`
//! opens a fresh link; transfers begun on the old one are not resumed.
//! [`DuplexChannel::send_on`] never reconnects, for traffic that only makes
//! sense on the link it started on.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
use super::protocol::Message;
use super::transport::{BoxedStream, Connector, TcpConnector};

/// Channel failure. Cloneable so every waiter on a shared connect attempt
/// observes the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to connect: {0}")]
    ConnectFailed(Arc<io::Error>),

    #[error("connection closed")]
    Closed,

    #[error("connection i/o error: {0}")]
    Io(Arc<io::Error>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Largest accepted frame, header and payload together.
    pub max_frame_length: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_length: std::env::var("CIRCUS_MAX_FRAME_BYTES")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(DEFAULT_MAX_FRAME_LENGTH),
        }
    }
}

impl ChannelConfig {
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

/// Subscription handle returned by [`DuplexChannel::on_message`] and
/// [`DuplexChannel::on_disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// One physical connection. A reconnect yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(LinkId) + Send + Sync>;

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<Link>, ChannelError>>>;

enum LinkState {
    Disconnected,
    Connecting { attempt: u64, pending: ConnectFuture },
    Connected(Arc<Link>),
}

struct Outbound {
    message: Message,
    done: oneshot::Sender<Result<(), ChannelError>>,
}

/// One established physical connection and its reader/writer tasks.
struct Link {
    id: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn deliver(&self, message: Message) -> Result<(), ChannelError> {
        let (done, flushed) = oneshot::channel();
        self.outbound
            .send(Outbound { message, done })
            .map_err(|_| ChannelError::Closed)?;
        flushed.await.map_err(|_| ChannelError::Closed)?
    }
}

struct ChannelInner {
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    state: Mutex<LinkState>,
    handlers: Mutex<Vec<(HandlerId, MessageHandler)>>,
    disconnect_handlers: Mutex<Vec<(HandlerId, DisconnectHandler)>>,
    next_handler: AtomicU64,
    next_attempt: AtomicU64,
}

impl ChannelInner {
    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<(HandlerId, MessageHandler)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disconnect_handlers(&self) -> MutexGuard<'_, Vec<(HandlerId, DisconnectHandler)>> {
        self.disconnect_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_link(&self, link: LinkId) -> Option<Arc<Link>> {
        match &*self.state() {
            LinkState::Connected(current) if current.id == link.0 && current.is_open() => {
                Some(Arc::clone(current))
            }
            _ => None,
        }
    }

    fn dispatch(&self, message: &Message) {
        let handlers: Vec<MessageHandler> =
            self.handlers().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in handlers {
            handler(message);
        }
    }

    /// Forget `link_id` if it is still the current link, then tell the
    /// disconnect handlers it is gone.
    fn release(&self, link_id: u64) {
        {
            let mut state = self.state();
            if matches!(&*state, LinkState::Connected(link) if link.id == link_id) {
                *state = LinkState::Disconnected;
                tracing::info!(link = link_id, "Channel disconnected");
            }
        }
        let handlers: Vec<DisconnectHandler> = self
            .disconnect_handlers()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(LinkId(link_id));
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let LinkState::Connected(link) = &*self.state() {
            link.closed.cancel();
        }
    }
}

/// Connection manager shared by every transfer of one server.
pub struct DuplexChannel {
    inner: Arc<ChannelInner>,
}

impl DuplexChannel {
    pub fn new(connector: impl Connector) -> Self {
        Self::with_config(Arc::new(connector), ChannelConfig::default())
    }

    pub fn with_config(connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                config,
                state: Mutex::new(LinkState::Disconnected),
                handlers: Mutex::new(Vec::new()),
                disconnect_handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(TcpConnector::new(addr))
    }

    pub fn state(&self) -> ChannelState {
        match &*self.inner.state() {
            LinkState::Disconnected => ChannelState::Disconnected,
            LinkState::Connecting { .. } => ChannelState::Connecting,
            LinkState::Connected(link) if link.is_open() => ChannelState::Connected,
            LinkState::Connected(_) => ChannelState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Establish the connection, or join the attempt already in flight.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.link().await.map(|_| ())
    }

    /// Send one message, connecting first if needed.
    ///
    /// Resolves once the frame is flushed to the connection.
    pub async fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.send_tracked(message).await.map(|_| ())
    }

    /// Like [`send`](Self::send), returning the link the frame went out on.
    pub async fn send_tracked(&self, message: Message) -> Result<LinkId, ChannelError> {
        let link = self.link().await?;
        link.deliver(message).await?;
        Ok(LinkId(link.id))
    }

    /// Send over `link` only. Fails with `Closed` instead of reconnecting
    /// once that link is gone.
    pub async fn send_on(&self, link: LinkId, message: Message) -> Result<(), ChannelError> {
        let current = self.inner.current_link(link).ok_or(ChannelError::Closed)?;
        current.deliver(message).await
    }

    pub fn is_link_open(&self, link: LinkId) -> bool {
        self.inner.current_link(link).is_some()
    }

    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers().push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if the handler was not registered.
    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Called with the id of every link that goes down, whatever the cause.
    pub fn on_disconnect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(LinkId) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.disconnect_handlers().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_disconnect_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.disconnect_handlers();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Tear down the current connection, failing queued and in-flight sends.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.state(), LinkState::Disconnected);
        if let LinkState::Connected(link) = previous {
            tracing::info!(link = link.id, "Closing channel");
            link.closed.cancel();
        }
    }

    async fn link(&self) -> Result<Arc<Link>, ChannelError> {
        let pending = {
            let mut state = self.inner.state();
            match &*state {
                LinkState::Connected(link) if link.is_open() => return Ok(Arc::clone(link)),
                LinkState::Connecting { pending, .. } => pending.clone(),
                _ => {
                    let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
                    let pending = establish(Arc::clone(&self.inner), attempt)
                        .boxed()
                        .shared();
                    *state = LinkState::Connecting {
                        attempt,
                        pending: pending.clone(),
                    };
                    pending
                }
            }
        };
        pending.await
    }
}

async fn establish(inner: Arc<ChannelInner>, attempt: u64) -> Result<Arc<Link>, ChannelError> {
    tracing::debug!(attempt, "Connecting channel");
    let result = inner.connector.connect().await;

    let mut state = inner.state();
    let current = matches!(&*state, LinkState::Connecting { attempt: a, .. } if *a == attempt);
    match result {
        Ok(_) if !current => {
            tracing::debug!(attempt, "Channel closed while connecting");
            Err(ChannelError::Closed)
        }
        Ok(stream) => {
            let link = spawn_link(stream, attempt, &inner);
            *state = LinkState::Connected(Arc::clone(&link));
            tracing::info!(link = attempt, "Channel connected");
            Ok(link)
        }
        Err(e) => {
            if current {
                *state = LinkState::Disconnected;
            }
            tracing::warn!(attempt, error = %e, "Channel connect failed");
            Err(ChannelError::ConnectFailed(Arc::new(e)))
        }
    }
}

fn spawn_link(stream: BoxedStream, id: u64, inner: &Arc<ChannelInner>) -> Arc<Link> {
    let (read, write) = tokio::io::split(stream);
    let max = inner.config.max_frame_length;
    let reader = FramedRead::new(read, FrameCodec::new(max));
    let writer = FramedWrite::new(write, FrameCodec::new(max));

    let (tx, rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    tokio::spawn(write_loop(writer, rx, closed.clone(), id));
    tokio::spawn(read_loop(reader, Arc::downgrade(inner), closed.clone(), id));

    Arc::new(Link {
        id,
        outbound: tx,
        closed,
    })
}

async fn write_loop(
    mut writer: FramedWrite<WriteHalf<BoxedStream>, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    closed: CancellationToken,
    link: u64,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some(Outbound { message, done }) = next else {
            break;
        };
        let written = tokio::select! {
            _ = closed.cancelled() => None,
            result = writer.send(message) => Some(result),
        };
        match written {
            None => {
                tracing::debug!(link, "Channel closed mid-write");
                let _ = done.send(Err(ChannelError::Closed));
                break;
            }
            Some(Ok(())) => {
                let _ = done.send(Ok(()));
            }
            Some(Err(e)) => {
                tracing::warn!(link, error = %e, "Channel write failed");
                let _ = done.send(Err(ChannelError::Io(Arc::new(e))));
                closed.cancel();
                break;
            }
        }
    }

    outbound.close();
    while let Ok(Outbound { done, .. }) = outbound.try_recv() {
        let _ = done.send(Err(ChannelError::Closed));
    }
}

async fn read_loop(
    mut reader: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    inner: Weak<ChannelInner>,
    closed: CancellationToken,
    link: u64,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(Ok(message))) => {
                tracing::trace!(link, kind = message.kind(), transfer_id = %message.transfer_id(), "Frame received");
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.dispatch(&message);
            }
            Some(Ok(Err(e))) => {
                tracing::warn!(link, error = %e, "Dropping malformed frame");
            }
            Some(Err(e)) => {
                tracing::warn!(link, error = %e, "Channel read failed");
                break;
            }
            None => {
                tracing::debug!(link, "Peer closed channel");
                break;
            }
        }
    }

    closed.cancel();
    if let Some(inner) = inner.upgrade() {
        inner.release(link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::codec::FrameCodec;
    use crate::transfer::protocol::TransferId;
    use crate::transfer::transport::MemoryConnector;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::Notify;
    use tokio_util::bytes::Bytes;
    use tokio_util::codec::Framed;

    fn stop(n: u64) -> Message {
        Message::Stop {
            transfer_id: TransferId::new(n),
        }
    }

    fn server(stream: DuplexStream) -> Framed<DuplexStream, FrameCodec> {
        Framed::new(stream, FrameCodec::default())
    }

    /// Connector whose attempts block until released.
    struct GatedConnector {
        inner: MemoryConnector,
        gate: Arc<Notify>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Connector for GatedConnector {
        async fn connect(&self) -> io::Result<BoxedStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            self.inner.connect().await
        }
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let (memory, mut listener) = MemoryConnector::pair(1024);
        let gate = Arc::new(Notify::new());
        let connector = Arc::new(GatedConnector {
            inner: memory,
            gate: Arc::clone(&gate),
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let channel = Arc::new(DuplexChannel::with_config(
            connector.clone(),
            ChannelConfig::default(),
        ));

        let a = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.connect().await }
        });
        let b = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.state(), ChannelState::Connecting);

        gate.notify_one();
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert!(channel.is_connected());
        assert!(listener.try_accept().is_some());
        assert!(listener.try_accept().is_none());
    }

    #[tokio::test]
    async fn failed_connect_clears_gate_for_retry() {
        let (memory, _listener) = MemoryConnector::pair(1024);
        let gate = Arc::new(Notify::new());
        let connector = Arc::new(GatedConnector {
            inner: memory,
            gate: Arc::clone(&gate),
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let channel = DuplexChannel::with_config(connector.clone(), ChannelConfig::default());

        gate.notify_one();
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectFailed(_)));
        assert_eq!(channel.state(), ChannelState::Disconnected);

        gate.notify_one();
        assert!(channel.connect().await.is_err());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn send_connects_lazily_and_preserves_order() {
        let (connector, mut listener) = MemoryConnector::pair(1024);
        let channel = DuplexChannel::new(connector);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        for n in 1..=5 {
            channel.send(stop(n)).await.unwrap();
        }
        assert!(channel.is_connected());

        let mut peer = server(listener.accept().await.unwrap());
        for n in 1..=5 {
            let message = peer.next().await.unwrap().unwrap().unwrap();
            assert_eq!(message, stop(n));
        }
    }

    #[tokio::test]
    async fn every_handler_receives_every_message() {
        let (connector, mut listener) = MemoryConnector::pair(1024);
        let channel = DuplexChannel::new(connector);
        channel.connect().await.unwrap();
        let mut peer = server(listener.accept().await.unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = channel.on_message({
            let tx = tx.clone();
            move |m| {
                let _ = tx.send(("first", m.transfer_id()));
            }
        });
        channel.on_message(move |m| {
            let _ = tx.send(("second", m.transfer_id()));
        });

        let image = |n| Message::TransferImage {
            transfer_id: TransferId::new(n),
            image_index: 0,
            payload: Bytes::from_static(b"px"),
        };
        peer.send(image(1)).await.unwrap();
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(
            seen,
            vec![("first", TransferId::new(1)), ("second", TransferId::new(1))]
        );

        assert!(channel.remove_message_handler(first));
        assert!(!channel.remove_message_handler(first));
        peer.send(image(2)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ("second", TransferId::new(2)));
    }

    #[tokio::test]
    async fn malformed_frames_do_not_stop_dispatch() {
        let (connector, mut listener) = MemoryConnector::pair(1024);
        let channel = DuplexChannel::new(connector);
        channel.connect().await.unwrap();
        let stream = listener.accept().await.unwrap();
        let mut raw = FramedWrite::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message(move |m| {
            let _ = tx.send(m.clone());
        });

        raw.send(Bytes::from_static(b"\x00\x00\x00\x02{}")).await.unwrap();
        let good = crate::transfer::codec::encode(&stop(8)).unwrap();
        raw.send(good).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), stop(8));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn peer_close_disconnects_and_rejects_sends() {
        let (connector, mut listener) = MemoryConnector::pair(1024);
        let channel = DuplexChannel::new(connector);
        channel.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();
        drop(peer);

        for _ in 0..50 {
            if !channel.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(channel.state(), ChannelState::Disconnected);

        // a later send opens a fresh link
        drop(listener);
        let err = channel.send(stop(1)).await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectFailed(_)));
    }

    fn large_image(len: usize) -> Message {
        Message::TransferImage {
            transfer_id: TransferId::new(1),
            image_index: 0,
            payload: Bytes::from(vec![7u8; len]),
        }
    }

    #[tokio::test]
    async fn close_fails_a_send_blocked_mid_write() {
        let (connector, mut listener) = MemoryConnector::pair(16);
        let channel = Arc::new(DuplexChannel::new(connector));
        channel.connect().await.unwrap();
        // connected but never reading, so the write cannot finish
        let _peer = listener.accept().await.unwrap();

        let send = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(large_image(4096)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!send.is_finished());

        channel.close();
        let result = tokio::time::timeout(Duration::from_millis(500), send)
            .await
            .expect("send still pending after close")
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn peer_loss_fails_a_send_in_flight() {
        let (connector, mut listener) = MemoryConnector::pair(16);
        let channel = Arc::new(DuplexChannel::new(connector));
        let (lost_tx, mut lost) = mpsc::unbounded_channel();
        channel.on_disconnect(move |link| {
            let _ = lost_tx.send(link);
        });
        channel.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();

        let send = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(large_image(4096)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!send.is_finished());

        drop(peer);
        let result = tokio::time::timeout(Duration::from_millis(500), send)
            .await
            .expect("send still pending after peer loss")
            .unwrap();
        assert!(matches!(
            result,
            Err(ChannelError::Io(_)) | Err(ChannelError::Closed)
        ));
        lost.recv().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn send_on_a_lost_link_never_reconnects() {
        let (connector, mut listener) = MemoryConnector::pair(1024);
        let channel = DuplexChannel::new(connector);
        let (lost_tx, mut lost) = mpsc::unbounded_channel();
        let subscription = channel.on_disconnect(move |link| {
            let _ = lost_tx.send(link);
        });

        let link = channel.send_tracked(stop(1)).await.unwrap();
        assert!(channel.is_link_open(link));
        let mut peer = server(listener.accept().await.unwrap());
        channel.send_on(link, stop(2)).await.unwrap();
        assert_eq!(peer.next().await.unwrap().unwrap().unwrap(), stop(1));
        assert_eq!(peer.next().await.unwrap().unwrap().unwrap(), stop(2));

        drop(peer);
        assert_eq!(lost.recv().await.unwrap(), link);
        assert!(!channel.is_link_open(link));
        assert!(matches!(
            channel.send_on(link, stop(3)).await,
            Err(ChannelError::Closed)
        ));
        assert!(listener.try_accept().is_none());
        assert_eq!(channel.state(), ChannelState::Disconnected);

        // a fresh link gets a fresh id
        assert!(channel.remove_disconnect_handler(subscription));
        let next = channel.send_tracked(stop(4)).await.unwrap();
        assert_ne!(next, link);
        assert!(listener.try_accept().is_some());
    }

    #[tokio::test]
    async fn oversized_inbound_frame_drops_the_link() {
        let (connector, mut listener) = MemoryConnector::pair(4096);
        let channel = DuplexChannel::with_config(
            Arc::new(connector),
            ChannelConfig::default().with_max_frame_length(64),
        );
        let (lost_tx, mut lost) = mpsc::unbounded_channel();
        channel.on_disconnect(move |link| {
            let _ = lost_tx.send(link);
        });
        let link = channel.send_tracked(stop(1)).await.unwrap();
        let mut peer = server(listener.accept().await.unwrap());

        peer.send(large_image(256)).await.unwrap();
        assert_eq!(lost.recv().await.unwrap(), link);
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn close_then_send_opens_fresh_link() {
        let (connector, mut listener) = MemoryConnector::pair(1024);
        let channel = DuplexChannel::new(connector);
        channel.connect().await.unwrap();
        let _first = listener.accept().await.unwrap();

        channel.close();
        assert_eq!(channel.state(), ChannelState::Disconnected);

        channel.send(stop(2)).await.unwrap();
        let mut second = server(listener.accept().await.unwrap());
        assert_eq!(second.next().await.unwrap().unwrap().unwrap(), stop(2));
    }
}
