//! Single-flight render scheduling.
//!
//! At most one draw holds the execution gate at a time. Calls that queue up
//! behind it coalesce: when the gate frees, only the most recent caller
//! draws and the rest resolve `false`. A draft is painted at once and the
//! gate is released while its continuation runs; if a newer render takes
//! over in the meantime the continuation's result is dropped unpainted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::image_source::{
    DrawResult, ImageData, ImageSource, Painter, Quality, RenderError, ViewportSize,
};
use super::view_state::ViewState;

const STATE_CHANGE_CAPACITY: usize = 16;

#[derive(Clone)]
struct Session {
    source: Arc<dyn ImageSource>,
    cancel: CancellationToken,
    viewport: ViewportSize,
}

#[derive(Default)]
struct Slots {
    session: Option<Session>,
    requested: Option<Arc<ViewState>>,
    committed: Option<Arc<ViewState>>,
    /// Ticket of the most recent `render` call.
    next_render: u64,
    /// Ticket of the call whose output may still be painted.
    current_render: u64,
}

struct SchedulerInner {
    painter: Arc<dyn Painter>,
    slots: Mutex<Slots>,
    gate: tokio::sync::Mutex<()>,
    state_changes: broadcast::Sender<Arc<ViewState>>,
}

impl SchedulerInner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, ticket: u64, cancel: &CancellationToken) -> bool {
        !cancel.is_cancelled() && self.slots().current_render == ticket
    }

    fn commit_and_paint(&self, state: &Arc<ViewState>, image: &ImageData, quality: Quality) {
        let changed = {
            let mut slots = self.slots();
            let same = slots
                .committed
                .as_ref()
                .is_some_and(|committed| Arc::ptr_eq(committed, state));
            if !same {
                slots.committed = Some(Arc::clone(state));
            }
            !same
        };
        self.painter.paint(state, image, quality);
        if changed {
            tracing::debug!(kind = %state.kind(), "View state committed");
            let _ = self.state_changes.send(Arc::clone(state));
        }
    }
}

/// Drives one viewer: owns the requested view state and the attached
/// image source, and paints whatever the source draws.
#[derive(Clone)]
pub struct RenderScheduler {
    inner: Arc<SchedulerInner>,
}

impl RenderScheduler {
    pub fn new(painter: impl Painter) -> Self {
        Self::with_painter(Arc::new(painter))
    }

    pub fn with_painter(painter: Arc<dyn Painter>) -> Self {
        let (state_changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Self {
            inner: Arc::new(SchedulerInner {
                painter,
                slots: Mutex::new(Slots::default()),
                gate: tokio::sync::Mutex::new(()),
                state_changes,
            }),
        }
    }

    /// Draw the latest requested view state.
    ///
    /// Resolves `true` once this call's final image has been painted, and
    /// `false` if a later call superseded it (before it ran, or while a
    /// draft continuation was pending) or its source was detached.
    pub async fn render(&self) -> Result<bool, RenderError> {
        let ticket = {
            let mut slots = self.inner.slots();
            slots.next_render += 1;
            slots.next_render
        };

        let gate = self.inner.gate.lock().await;
        let (session, state) = {
            let mut slots = self.inner.slots();
            if slots.next_render != ticket {
                tracing::trace!(ticket, "Render superseded before drawing");
                return Ok(false);
            }
            let (Some(session), Some(state)) = (slots.session.clone(), slots.requested.clone())
            else {
                return Err(RenderError::NotInitialized);
            };
            slots.current_render = ticket;
            (session, state)
        };

        tracing::trace!(ticket, kind = %state.kind(), "Drawing");
        let draw = session
            .source
            .draw(&state, session.viewport, session.cancel.clone())
            .await;
        let mut gate = Some(gate);
        let mut result = match draw {
            Ok(result) => result,
            Err(RenderError::Cancelled) => return Ok(false),
            Err(e) => return Err(e),
        };

        loop {
            if !self.inner.is_current(ticket, &session.cancel) {
                tracing::debug!(ticket, "Dropping stale draw result");
                return Ok(false);
            }
            match result {
                DrawResult::Final(image) => {
                    self.inner.commit_and_paint(&state, &image, Quality::Final);
                    return Ok(true);
                }
                DrawResult::Draft { draft, next } => {
                    self.inner.commit_and_paint(&state, &draft, Quality::Draft);
                    // Let newer renders start while the refinement runs.
                    drop(gate.take());
                    result = match next.await {
                        Ok(result) => result,
                        Err(RenderError::Cancelled) => return Ok(false),
                        Err(e) => return Err(e),
                    };
                }
            }
        }
    }

    /// Request `state` and render it.
    pub async fn set_state(
        &self,
        state: impl Into<Arc<ViewState>>,
    ) -> Result<bool, RenderError> {
        self.inner.slots().requested = Some(state.into());
        self.render().await
    }

    /// Attach `source`, cancelling the previous one, and render its initial
    /// state. Resolves `false` if another source replaced it first.
    pub async fn set_image_source(
        &self,
        source: Arc<dyn ImageSource>,
        viewport: ViewportSize,
    ) -> Result<bool, RenderError> {
        let cancel = CancellationToken::new();
        {
            let mut slots = self.inner.slots();
            let previous = slots.session.replace(Session {
                source: Arc::clone(&source),
                cancel: cancel.clone(),
                viewport,
            });
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            slots.requested = None;
        }

        source.ready().await?;
        let initial = Arc::new(source.initial_state(viewport)?);
        {
            let mut slots = self.inner.slots();
            if cancel.is_cancelled() {
                return Ok(false);
            }
            slots.requested.get_or_insert(initial);
        }
        tracing::debug!(
            width = viewport.width,
            height = viewport.height,
            "Image source attached"
        );
        self.render().await
    }

    /// Change the viewport of the attached source and redraw.
    pub async fn resize(&self, viewport: ViewportSize) -> Result<bool, RenderError> {
        match self.inner.slots().session.as_mut() {
            Some(session) => session.viewport = viewport,
            None => return Err(RenderError::NotInitialized),
        }
        self.render().await
    }

    /// Cancel and forget the attached source. Draws in flight resolve `false`.
    pub fn detach(&self) -> Option<Arc<dyn ImageSource>> {
        let session = self.inner.slots().session.take()?;
        session.cancel.cancel();
        tracing::debug!("Image source detached");
        Some(session.source)
    }

    /// The most recently requested view state.
    pub fn state(&self) -> Option<Arc<ViewState>> {
        self.inner.slots().requested.clone()
    }

    /// The view state of the last painted image.
    pub fn committed_state(&self) -> Option<Arc<ViewState>> {
        self.inner.slots().committed.clone()
    }

    /// One event per distinct committed view state.
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<Arc<ViewState>> {
        self.inner.state_changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::metadata::PixelFormat;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, oneshot};

    fn image(fill: u8) -> ImageData {
        ImageData {
            width: 1,
            height: 1,
            pixel_format: PixelFormat::UInt8,
            pixels: vec![fill].into(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        painted: Mutex<Vec<(usize, u8, Quality)>>,
    }

    impl Recorder {
        fn painted(&self) -> Vec<(usize, u8, Quality)> {
            self.painted.lock().unwrap().clone()
        }
    }

    fn scheduler() -> (RenderScheduler, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let scheduler = RenderScheduler::new({
            let recorder = Arc::clone(&recorder);
            move |state: &Arc<ViewState>, image: &ImageData, quality: Quality| {
                let ViewState::TwoD(view) = &**state else {
                    panic!("unexpected view state");
                };
                recorder
                    .painted
                    .lock()
                    .unwrap()
                    .push((view.image_number, image.pixels[0], quality));
            }
        });
        (scheduler, recorder)
    }

    /// Final-only source whose draws block until released.
    struct SlowSource {
        draws: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl ImageSource for SlowSource {
        fn initial_state(&self, _viewport: ViewportSize) -> Result<ViewState, RenderError> {
            Ok(ViewState::two_d(0))
        }

        async fn draw(
            &self,
            state: &ViewState,
            _viewport: ViewportSize,
            _cancel: CancellationToken,
        ) -> Result<DrawResult, RenderError> {
            self.draws.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            let ViewState::TwoD(view) = state else {
                return Err(RenderError::UnsupportedViewState(state.kind()));
            };
            Ok(DrawResult::Final(image(view.image_number as u8)))
        }
    }

    fn slow_source() -> Arc<SlowSource> {
        Arc::new(SlowSource {
            draws: AtomicUsize::new(0),
            release: Notify::new(),
        })
    }

    async fn attach(scheduler: &RenderScheduler, source: Arc<SlowSource>) {
        source.release.notify_one();
        let attached = scheduler.set_image_source(source, ViewportSize::new(64, 64));
        assert!(attached.await.unwrap());
    }

    #[tokio::test]
    async fn render_without_source_is_not_initialized() {
        let (scheduler, _) = scheduler();
        assert!(matches!(scheduler.render().await, Err(RenderError::NotInitialized)));
        assert!(matches!(
            scheduler.resize(ViewportSize::new(1, 1)).await,
            Err(RenderError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn queued_renders_coalesce_to_the_last() {
        let (scheduler, recorder) = scheduler();
        let source = slow_source();
        attach(&scheduler, Arc::clone(&source)).await;

        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.set_state(ViewState::two_d(1)).await }
        });
        while source.draws.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        let mut queued = Vec::new();
        for n in 2..=4 {
            let scheduler = scheduler.clone();
            queued.push(tokio::spawn(async move {
                scheduler.set_state(ViewState::two_d(n)).await
            }));
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        source.release.notify_one();
        assert!(first.await.unwrap().unwrap());
        while source.draws.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        source.release.notify_one();

        let mut results = Vec::new();
        for handle in queued {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(results, vec![false, false, true]);
        assert_eq!(source.draws.load(Ordering::SeqCst), 3);
        let painted: Vec<usize> = recorder.painted().iter().map(|p| p.0).collect();
        assert_eq!(painted, vec![0, 1, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_leave_the_latest_ticket_queued() {
        let (scheduler, _) = scheduler();
        let source = slow_source();
        attach(&scheduler, Arc::clone(&source)).await;

        let blocking = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.render().await }
        });
        while source.draws.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        let queued: Vec<_> = (0..32)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.render().await })
            })
            .collect();
        // attach and the blocking render took tickets 1 and 2
        while scheduler.inner.slots().next_render < 34 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(scheduler.inner.slots().next_render, 34);

        source.release.notify_one();
        assert!(blocking.await.unwrap().unwrap());
        while source.draws.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        source.release.notify_one();

        let mut winners = 0;
        for handle in queued {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(source.draws.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn state_changes_fire_once_per_committed_state() {
        let (scheduler, recorder) = scheduler();
        let source = slow_source();
        let mut changes = scheduler.subscribe_state_changes();
        attach(&scheduler, Arc::clone(&source)).await;
        let initial = changes.try_recv().unwrap();
        assert!(Arc::ptr_eq(&initial, &scheduler.committed_state().unwrap()));

        // same Arc again: painted, but no new event
        source.release.notify_one();
        assert!(scheduler.render().await.unwrap());
        assert!(changes.try_recv().is_err());

        // equal value, different Arc: counts as a change
        source.release.notify_one();
        assert!(scheduler.set_state(ViewState::two_d(0)).await.unwrap());
        assert!(!Arc::ptr_eq(&changes.try_recv().unwrap(), &initial));
        assert_eq!(recorder.painted().len(), 3);
    }

    /// Source returning a draft whose refinement is handed over by the test.
    struct DraftSource {
        refinements: Mutex<Vec<oneshot::Receiver<u8>>>,
    }

    #[async_trait]
    impl ImageSource for DraftSource {
        fn initial_state(&self, _viewport: ViewportSize) -> Result<ViewState, RenderError> {
            Ok(ViewState::two_d(0))
        }

        async fn draw(
            &self,
            state: &ViewState,
            _viewport: ViewportSize,
            cancel: CancellationToken,
        ) -> Result<DrawResult, RenderError> {
            let ViewState::TwoD(view) = state else {
                return Err(RenderError::UnsupportedViewState(state.kind()));
            };
            let Some(refined) = self.refinements.lock().unwrap().pop() else {
                return Ok(DrawResult::Final(image(view.image_number as u8)));
            };
            Ok(DrawResult::draft(image(0), async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RenderError::Cancelled),
                    fill = refined => fill
                        .map(|fill| DrawResult::Final(image(fill)))
                        .map_err(|_| RenderError::Draw("refinement dropped".into())),
                }
            }))
        }
    }

    #[tokio::test]
    async fn draft_then_final() {
        let (scheduler, recorder) = scheduler();
        let (tx, rx) = oneshot::channel();
        let source = Arc::new(DraftSource {
            refinements: Mutex::new(vec![rx]),
        });

        let render = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .set_image_source(source, ViewportSize::new(8, 8))
                    .await
            }
        });
        while recorder.painted().is_empty() {
            tokio::task::yield_now().await;
        }
        tx.send(9).unwrap();
        assert!(render.await.unwrap().unwrap());
        assert_eq!(
            recorder.painted(),
            vec![(0, 0, Quality::Draft), (0, 9, Quality::Final)]
        );
    }

    #[tokio::test]
    async fn newer_render_preempts_draft_continuation() {
        let (scheduler, recorder) = scheduler();
        let (stale_tx, stale_rx) = oneshot::channel();
        let source = Arc::new(DraftSource {
            refinements: Mutex::new(vec![stale_rx]),
        });

        let stale = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .set_image_source(source, ViewportSize::new(8, 8))
                    .await
            }
        });
        while recorder.painted().is_empty() {
            tokio::task::yield_now().await;
        }

        // the gate is free while the draft refines, so this draws at once
        assert!(scheduler.set_state(ViewState::two_d(5)).await.unwrap());
        let _ = stale_tx.send(7);
        assert!(!stale.await.unwrap().unwrap());

        assert_eq!(
            recorder.painted(),
            vec![(0, 0, Quality::Draft), (5, 5, Quality::Final)]
        );
    }

    #[tokio::test]
    async fn detach_abandons_pending_continuation() {
        let (scheduler, recorder) = scheduler();
        let (_tx, rx) = oneshot::channel();
        let source = Arc::new(DraftSource {
            refinements: Mutex::new(vec![rx]),
        });

        let render = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .set_image_source(source, ViewportSize::new(8, 8))
                    .await
            }
        });
        while recorder.painted().is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(scheduler.detach().is_some());
        assert!(!render.await.unwrap().unwrap());
        assert_eq!(recorder.painted().len(), 1);
        assert!(matches!(scheduler.render().await, Err(RenderError::NotInitialized)));
    }
}
