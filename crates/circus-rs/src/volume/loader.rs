//! Progressive volume loader.
//!
//! Fetches metadata, allocates the volume buffer and streams slices into it
//! over one transfer. Both loads are memoized: concurrent and repeated calls
//! share one in-flight task. A failed load is forgotten so the next call
//! starts over.
//!
//! Priority requests made before the transfer opens are queued and flushed
//! in call order once it does; after completion they are dropped.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_util::bytes::Bytes;

use super::buffer::VolumeBuffer;
use super::cache::{CacheKey, NullCache, VolumeCache};
use super::metadata::{MetadataSource, VolumeMetadata};
use crate::transfer::channel::ChannelError;
use crate::transfer::protocol::{DescriptorError, PartialVolumeDescriptor, VolumeSpecifier};
use crate::transfer::registry::{TransferConnection, TransferRegistry};

/// Load failure. Cloneable so every caller sharing a load sees the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("metadata unavailable: {0}")]
    Metadata(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("invalid partial volume: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    #[error("load aborted")]
    Aborted,
}

/// One slice arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub image_index: u32,
    pub finished: usize,
    pub total: usize,
}

#[derive(Clone)]
pub struct LoaderConfig {
    pub cache: Arc<dyn VolumeCache>,
    /// Progress events buffered per subscriber before it starts lagging.
    pub progress_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache: Arc::new(NullCache),
            progress_capacity: 256,
        }
    }
}

impl LoaderConfig {
    pub fn with_cache(mut self, cache: Arc<dyn VolumeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.progress_capacity = capacity.max(1);
        self
    }
}

type Memo<T> = Shared<BoxFuture<'static, Result<T, LoadError>>>;

/// Where priority requests go.
enum PriorityGate {
    /// Transfer not open yet; requests wait here in call order.
    Pending(Vec<(Vec<u32>, i32)>),
    Open(Arc<TransferConnection>),
    /// Volume complete, served from cache, or aborted.
    Closed,
}

struct LoaderInner {
    volume: VolumeSpecifier,
    key: CacheKey,
    metadata_source: Arc<dyn MetadataSource>,
    registry: TransferRegistry,
    cache: Arc<dyn VolumeCache>,

    meta: Mutex<Option<Memo<VolumeMetadata>>>,
    load: Mutex<Option<Memo<Arc<VolumeBuffer>>>>,
    task: Mutex<Option<AbortHandle>>,
    aborted: AtomicBool,

    buffer: OnceLock<Arc<VolumeBuffer>>,
    gate: tokio::sync::Mutex<PriorityGate>,
    progress: broadcast::Sender<Progress>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Memo still worth sharing: pending or succeeded.
fn reusable<T: Clone>(memo: &Option<Memo<T>>) -> Option<Memo<T>> {
    let memo = memo.as_ref()?;
    match memo.peek() {
        Some(Err(_)) => None,
        _ => Some(memo.clone()),
    }
}

/// Run `work` on its own task so it progresses whether or not anyone polls.
fn spawn_shared<T, F>(work: F) -> (Memo<T>, AbortHandle)
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T, LoadError>> + Send + 'static,
{
    let handle = tokio::spawn(work);
    let abort = handle.abort_handle();
    let memo = async move { handle.await.unwrap_or_else(|_| Err(LoadError::Aborted)) }
        .boxed()
        .shared();
    (memo, abort)
}

impl LoaderInner {
    fn load_meta(self: &Arc<Self>) -> Memo<VolumeMetadata> {
        let mut memo = lock(&self.meta);
        if let Some(memo) = reusable(&memo) {
            return memo;
        }
        let (shared, _) = spawn_shared(fetch_metadata(Arc::clone(self)));
        *memo = Some(shared.clone());
        shared
    }

    fn load_volume(self: &Arc<Self>) -> Memo<Arc<VolumeBuffer>> {
        let mut memo = lock(&self.load);
        if let Some(memo) = reusable(&memo) {
            return memo;
        }
        let (shared, abort) = spawn_shared(fetch_volume(Arc::clone(self)));
        *lock(&self.task) = Some(abort);
        *memo = Some(shared.clone());
        shared
    }

    /// Start routing priorities to `connection`. Returns `false` if the
    /// loader was closed meanwhile.
    async fn open_gate(&self, connection: &Arc<TransferConnection>) -> bool {
        let mut gate = self.gate.lock().await;
        match std::mem::replace(&mut *gate, PriorityGate::Closed) {
            PriorityGate::Closed => false,
            PriorityGate::Pending(queued) => {
                for (indices, priority) in queued {
                    if let Err(e) = connection.set_priority(indices, priority).await {
                        tracing::warn!(series_uid = %self.volume.series_uid, error = %e, "Failed to send queued priority");
                    }
                }
                *gate = PriorityGate::Open(Arc::clone(connection));
                true
            }
            PriorityGate::Open(_) => {
                *gate = PriorityGate::Open(Arc::clone(connection));
                true
            }
        }
    }

    /// The buffer for this volume, allocated on first use.
    fn install_buffer(&self, metadata: &VolumeMetadata) -> Arc<VolumeBuffer> {
        let buffer = self.buffer.get_or_init(|| {
            let geometry = match &self.volume.partial_volume_descriptor {
                Some(pvd) => metadata.for_partial(pvd),
                None => metadata.clone(),
            };
            Arc::new(VolumeBuffer::new(geometry))
        });
        Arc::clone(buffer)
    }

    async fn close_gate(&self) -> Option<Arc<TransferConnection>> {
        match std::mem::replace(&mut *self.gate.lock().await, PriorityGate::Closed) {
            PriorityGate::Open(connection) => Some(connection),
            _ => None,
        }
    }
}

/// Writes each arriving slice into `buffer` and reports progress.
fn slice_handler(
    pvd: Option<PartialVolumeDescriptor>,
    progress: broadcast::Sender<Progress>,
    buffer: Arc<VolumeBuffer>,
) -> impl Fn(u32, Bytes) + Send + Sync + 'static {
    move |image_index, payload| {
        let slot = match &pvd {
            Some(pvd) => pvd.slot_of(image_index),
            None => Some(image_index as usize),
        };
        let Some(slot) = slot else {
            tracing::warn!(image_index, "Ignoring slice outside partial volume");
            return;
        };
        match buffer.write_slice(slot, payload) {
            Ok(true) => {
                let finished = buffer.received_count();
                tracing::trace!(image_index, finished, "Slice stored");
                let _ = progress.send(Progress {
                    image_index,
                    finished,
                    total: buffer.total_slices(),
                });
            }
            Ok(false) => tracing::warn!(image_index, "Ignoring duplicate slice"),
            Err(e) => tracing::warn!(image_index, error = %e, "Ignoring slice"),
        }
    }
}

async fn fetch_metadata(inner: Arc<LoaderInner>) -> Result<VolumeMetadata, LoadError> {
    let metadata = match inner.cache.get_metadata(&inner.key).await {
        Some(metadata) => {
            tracing::debug!(series_uid = %inner.volume.series_uid, "Metadata cache hit");
            metadata
        }
        None => {
            let metadata = inner.metadata_source.fetch_metadata(&inner.volume).await?;
            inner.cache.put_metadata(&inner.key, &metadata).await;
            metadata
        }
    };
    tracing::debug!(
        series_uid = %inner.volume.series_uid,
        voxel_count = ?metadata.voxel_count,
        "Metadata loaded"
    );
    inner.install_buffer(&metadata);
    Ok(metadata)
}

async fn fetch_volume(inner: Arc<LoaderInner>) -> Result<Arc<VolumeBuffer>, LoadError> {
    if inner.aborted.load(Ordering::Acquire) {
        return Err(LoadError::Aborted);
    }
    let metadata = inner.load_meta().await?;
    let buffer = inner.install_buffer(&metadata);

    if let Some(data) = inner.cache.get_volume(&inner.key).await {
        match buffer.fill_from(data) {
            Ok(()) => {
                inner.close_gate().await;
                tracing::info!(series_uid = %inner.volume.series_uid, "Volume served from cache");
                return Ok(buffer);
            }
            Err(e) => {
                tracing::warn!(series_uid = %inner.volume.series_uid, error = %e, "Ignoring cached volume");
            }
        }
    }

    let connection = Arc::new(
        inner
            .registry
            .open(
                inner.volume.clone(),
                slice_handler(
                    inner.volume.partial_volume_descriptor,
                    inner.progress.clone(),
                    Arc::clone(&buffer),
                ),
            )
            .await?,
    );
    tracing::info!(
        series_uid = %inner.volume.series_uid,
        transfer_id = %connection.id(),
        slices = buffer.total_slices(),
        "Volume transfer started"
    );
    if !inner.open_gate(&connection).await {
        connection.abort().await;
        return Err(LoadError::Aborted);
    }

    buffer.wait_until_complete().await;

    inner.close_gate().await;
    connection.abort().await;
    inner.cache.put_volume(&inner.key, buffer.to_bytes()).await;
    tracing::info!(series_uid = %inner.volume.series_uid, "Volume loaded");
    Ok(buffer)
}

/// Loads one volume, identified by series and optional partial range.
#[derive(Clone)]
pub struct VolumeLoader {
    inner: Arc<LoaderInner>,
}

impl VolumeLoader {
    pub fn new(
        volume: VolumeSpecifier,
        metadata_source: impl MetadataSource,
        registry: TransferRegistry,
    ) -> Result<Self, LoadError> {
        Self::with_config(
            volume,
            Arc::new(metadata_source),
            registry,
            LoaderConfig::default(),
        )
    }

    pub fn with_config(
        volume: VolumeSpecifier,
        metadata_source: Arc<dyn MetadataSource>,
        registry: TransferRegistry,
        config: LoaderConfig,
    ) -> Result<Self, LoadError> {
        if let Some(pvd) = &volume.partial_volume_descriptor {
            pvd.validate()?;
        }
        let (progress, _) = broadcast::channel(config.progress_capacity.max(1));
        Ok(Self {
            inner: Arc::new(LoaderInner {
                key: CacheKey::new(&volume),
                volume,
                metadata_source,
                registry,
                cache: config.cache,
                meta: Mutex::new(None),
                load: Mutex::new(None),
                task: Mutex::new(None),
                aborted: AtomicBool::new(false),
                buffer: OnceLock::new(),
                gate: tokio::sync::Mutex::new(PriorityGate::Pending(Vec::new())),
                progress,
            }),
        })
    }

    pub fn volume_specifier(&self) -> &VolumeSpecifier {
        &self.inner.volume
    }

    pub fn partial_volume_descriptor(&self) -> Option<&PartialVolumeDescriptor> {
        self.inner.volume.partial_volume_descriptor.as_ref()
    }

    pub async fn load_meta(&self) -> Result<VolumeMetadata, LoadError> {
        self.inner.load_meta().await
    }

    /// Resolves once every slice has arrived (or immediately on a cache hit).
    ///
    /// If the channel drops mid-transfer this stays pending; use
    /// [`volume`](Self::volume) for the partial buffer.
    pub async fn load_volume(&self) -> Result<Arc<VolumeBuffer>, LoadError> {
        self.inner.load_volume().await
    }

    /// The buffer as filled so far. `None` until metadata has loaded.
    pub fn volume(&self) -> Option<Arc<VolumeBuffer>> {
        self.inner.buffer.get().cloned()
    }

    /// Buffer slot for an acquisition index.
    pub fn slot_of(&self, image_index: u32) -> Option<usize> {
        match self.partial_volume_descriptor() {
            Some(pvd) => pvd.slot_of(image_index),
            None => Some(image_index as usize),
        }
    }

    /// Acquisition index stored at a buffer slot.
    pub fn image_index_of(&self, slot: usize) -> Option<u32> {
        match self.partial_volume_descriptor() {
            Some(pvd) => pvd.image_index_of(slot),
            None => u32::try_from(slot).ok(),
        }
    }

    /// Ask for `image_indices` to be sent sooner.
    pub async fn set_priority(
        &self,
        image_indices: Vec<u32>,
        priority: i32,
    ) -> Result<(), LoadError> {
        let mut gate = self.inner.gate.lock().await;
        match &mut *gate {
            PriorityGate::Pending(queued) => {
                tracing::debug!(?image_indices, priority, "Queueing priority until transfer opens");
                queued.push((image_indices, priority));
            }
            PriorityGate::Open(connection) => {
                connection.set_priority(image_indices, priority).await?;
            }
            PriorityGate::Closed => {
                tracing::trace!(?image_indices, "Volume complete, ignoring priority");
            }
        }
        Ok(())
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<Progress> {
        self.inner.progress.subscribe()
    }

    pub async fn pause(&self) -> Result<(), LoadError> {
        if let PriorityGate::Open(connection) = &*self.inner.gate.lock().await {
            connection.pause().await?;
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), LoadError> {
        if let PriorityGate::Open(connection) = &*self.inner.gate.lock().await {
            connection.resume().await?;
        }
        Ok(())
    }

    /// Stop loading. Pending `load_volume` calls resolve `Aborted`; the
    /// partially-filled buffer stays readable.
    pub async fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        if let Some(task) = lock(&self.inner.task).take() {
            task.abort();
        }
        if let Some(connection) = self.inner.close_gate().await {
            connection.abort().await;
        }
        tracing::info!(series_uid = %self.inner.volume.series_uid, "Volume load aborted");
    }
}
