//! Transfer registry: multiplexes slice transfers over one duplex channel.
//!
//! Inbound `TransferImage` frames are routed by transfer id to the handler
//! registered at `open`. Frames for ids with no handler (already aborted, or
//! opened through another registry on the same channel) are dropped without
//! reply.
//!
//! A transfer lives on the link its `BeginTransfer` went out on. When that
//! link goes down the transfer is aborted locally and its control calls
//! become no-ops; nothing is replayed on a later link.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use tokio_util::bytes::Bytes;

use super::channel::{ChannelError, DuplexChannel, HandlerId, LinkId};
use super::protocol::{Message, TransferId, VolumeSpecifier};

/// Receives `(image_index, payload)` for every slice of one transfer.
pub type SliceHandler = Arc<dyn Fn(u32, Bytes) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Paused,
    Aborted,
}

type SharedState = Arc<Mutex<TransferState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, TransferState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set `Aborted`. Returns `false` if it already was.
fn mark_aborted(state: &SharedState) -> bool {
    let mut state = lock(state);
    if *state == TransferState::Aborted {
        return false;
    }
    *state = TransferState::Aborted;
    true
}

struct Registration {
    handler: SliceHandler,
    /// Unset until `BeginTransfer` is flushed.
    link: Option<LinkId>,
    state: SharedState,
}

struct RegistryInner {
    channel: Arc<DuplexChannel>,
    next_id: AtomicU64,
    transfers: DashMap<TransferId, Registration>,
    subscription: HandlerId,
    disconnect_subscription: HandlerId,
}

impl RegistryInner {
    fn dispatch(&self, message: &Message) {
        let Message::TransferImage {
            transfer_id,
            image_index,
            payload,
        } = message
        else {
            return;
        };

        // Clone out of the map so the handler runs without a shard lock held.
        let handler = self
            .transfers
            .get(transfer_id)
            .map(|r| Arc::clone(&r.value().handler));
        match handler {
            Some(handler) => handler(*image_index, payload.clone()),
            None => tracing::trace!(
                transfer_id = %transfer_id,
                image_index,
                "Dropping image for unregistered transfer"
            ),
        }
    }

    fn link_lost(&self, link: LinkId) {
        self.transfers.retain(|id, registration| {
            if registration.link != Some(link) {
                return true;
            }
            mark_aborted(&registration.state);
            tracing::info!(transfer_id = %id, link = %link, "Transfer lost with its connection");
            false
        });
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.channel.remove_message_handler(self.subscription);
        self.channel
            .remove_disconnect_handler(self.disconnect_subscription);
    }
}

/// Allocates transfer ids and routes their slices.
#[derive(Clone)]
pub struct TransferRegistry {
    inner: Arc<RegistryInner>,
}

impl TransferRegistry {
    pub fn new(channel: Arc<DuplexChannel>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| {
            let subscription = channel.on_message({
                let weak = weak.clone();
                move |message| {
                    if let Some(inner) = weak.upgrade() {
                        inner.dispatch(message);
                    }
                }
            });
            let disconnect_subscription = channel.on_disconnect({
                let weak = weak.clone();
                move |link| {
                    if let Some(inner) = weak.upgrade() {
                        inner.link_lost(link);
                    }
                }
            });
            RegistryInner {
                channel,
                next_id: AtomicU64::new(1),
                transfers: DashMap::new(),
                subscription,
                disconnect_subscription,
            }
        });
        Self { inner }
    }

    pub fn channel(&self) -> &Arc<DuplexChannel> {
        &self.inner.channel
    }

    /// Start streaming `volume`, delivering each slice to `handler`.
    ///
    /// The handler is registered before `BeginTransfer` goes out so no early
    /// slice is lost. If the send fails, or the link drops before the
    /// transfer is bound to it, the registration is rolled back.
    pub async fn open<F>(
        &self,
        volume: VolumeSpecifier,
        handler: F,
    ) -> Result<TransferConnection, ChannelError>
    where
        F: Fn(u32, Bytes) + Send + Sync + 'static,
    {
        let id = TransferId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let state: SharedState = Arc::new(Mutex::new(TransferState::Active));
        self.inner.transfers.insert(
            id,
            Registration {
                handler: Arc::new(handler),
                link: None,
                state: Arc::clone(&state),
            },
        );

        tracing::debug!(transfer_id = %id, volume = %volume, "Beginning transfer");
        let begin = Message::BeginTransfer {
            transfer_id: id,
            volume,
        };
        let link = match self.inner.channel.send_tracked(begin).await {
            Ok(link) => link,
            Err(e) => {
                self.inner.transfers.remove(&id);
                return Err(e);
            }
        };

        if let Some(mut registration) = self.inner.transfers.get_mut(&id) {
            registration.link = Some(link);
        }
        // The link may have gone down before it was recorded above.
        if !self.inner.channel.is_link_open(link) {
            self.inner.transfers.remove(&id);
            mark_aborted(&state);
            return Err(ChannelError::Closed);
        }

        Ok(TransferConnection {
            id,
            link,
            registry: Arc::clone(&self.inner),
            state,
        })
    }

    pub fn is_registered(&self, id: TransferId) -> bool {
        self.inner.transfers.contains_key(&id)
    }

    /// Number of transfers currently receiving slices.
    pub fn len(&self) -> usize {
        self.inner.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.transfers.is_empty()
    }
}

/// Handle to one open transfer.
///
/// Dropping it without `abort` unregisters the handler but cannot tell the
/// server to stop.
pub struct TransferConnection {
    id: TransferId,
    link: LinkId,
    registry: Arc<RegistryInner>,
    state: SharedState,
}

impl TransferConnection {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// The connection this transfer was begun on.
    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn state(&self) -> TransferState {
        *lock(&self.state)
    }

    /// Swap the lifecycle state unless aborted. Returns `false` when aborted.
    fn transition(&self, next: TransferState) -> bool {
        let mut state = lock(&self.state);
        if *state == TransferState::Aborted {
            return false;
        }
        *state = next;
        true
    }

    /// Send a control message on this transfer's link. Never reconnects.
    async fn control(&self, message: Message) -> Result<(), ChannelError> {
        let channel = &self.registry.channel;
        if !channel.is_link_open(self.link) {
            if mark_aborted(&self.state) {
                self.registry.transfers.remove(&self.id);
                tracing::debug!(transfer_id = %self.id, "Connection gone, transfer aborted");
            }
            return Ok(());
        }
        channel.send_on(self.link, message).await
    }

    /// Ask the server to send `image_indices` at `priority`. Advisory only.
    pub async fn set_priority(
        &self,
        image_indices: Vec<u32>,
        priority: i32,
    ) -> Result<(), ChannelError> {
        if self.state() == TransferState::Aborted {
            tracing::debug!(transfer_id = %self.id, "Ignoring priority for aborted transfer");
            return Ok(());
        }
        self.control(Message::SetPriority {
            transfer_id: self.id,
            image_indices,
            priority,
        })
        .await
    }

    pub async fn pause(&self) -> Result<(), ChannelError> {
        if !self.transition(TransferState::Paused) {
            return Ok(());
        }
        self.control(Message::Pause {
            transfer_id: self.id,
        })
        .await
    }

    pub async fn resume(&self) -> Result<(), ChannelError> {
        if !self.transition(TransferState::Active) {
            return Ok(());
        }
        self.control(Message::Resume {
            transfer_id: self.id,
        })
        .await
    }

    /// Stop the transfer. Idempotent and infallible.
    ///
    /// The handler is unregistered first, so no slice is delivered once
    /// this is called. `Stop` is sent only over the transfer's own link,
    /// and only while it is up.
    pub async fn abort(&self) {
        if !mark_aborted(&self.state) {
            return;
        }
        self.registry.transfers.remove(&self.id);

        let channel = &self.registry.channel;
        if !channel.is_link_open(self.link) {
            tracing::debug!(transfer_id = %self.id, "Channel down, aborting locally");
            return;
        }
        if let Err(e) = channel
            .send_on(
                self.link,
                Message::Stop {
                    transfer_id: self.id,
                },
            )
            .await
        {
            tracing::debug!(transfer_id = %self.id, error = %e, "Failed to send stop");
        }
        tracing::debug!(transfer_id = %self.id, "Transfer aborted");
    }
}

impl Drop for TransferConnection {
    fn drop(&mut self) {
        if *lock(&self.state) != TransferState::Aborted {
            tracing::debug!(transfer_id = %self.id, "Transfer dropped without abort");
            self.registry.transfers.remove(&self.id);
        }
    }
}
