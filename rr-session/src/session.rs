// The session controller. Presents one coherent "current position in the
// recording" over a backend that only answers point-based queries: at any
// time the session is either paused at a point or resuming toward one.
// Reentrancy is expected (a new warp can start while an older resume is
// still awaiting the backend), so every routine re-validates the cursor
// generation or cache epoch captured before an await, and discards stale
// results instead of acting on them.

use std::sync::{Arc, Mutex, MutexGuard};

use protocol::{
    BackendEvent, EvalResult, ExecutionPoint, Frame, FrameId, LoadedRegions, Message,
    PointDescription, ReplayClient, ResumeCommand, RpcResult, Scope, SessionId,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::breakpoints::BreakpointRegistry;
use crate::events::{EventChannel, SessionEvent};
use crate::logging::{category_session, category_step};
use crate::pauses::{Pause, PauseCache};
use crate::resume_targets::ResumeTargetCache;
use crate::sources::SourceRegistry;
use crate::sync::Latch;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub event_capacity: usize,
    pub precache: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            precache: true,
        }
    }
}

/// Redirection returned by a warp-adjustment hook, e.g. "always land on a
/// point with frames".
#[derive(Clone, Debug)]
pub struct WarpTarget {
    pub point: ExecutionPoint,
    pub time: f64,
    pub has_frames: bool,
}

type WarpHook = Box<dyn Fn(&ExecutionPoint, f64, bool) -> Option<WarpTarget> + Send + Sync>;

/// Generation token captured before an await and validated before any
/// state mutation that follows it. The cursor generation advances on
/// every warp, so a stale token means the result belongs to a position
/// the user has already left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorToken {
    generation: u64,
}

struct Cursor<C: ReplayClient> {
    point: ExecutionPoint,
    time: f64,
    has_frames: bool,
    pause: Option<Arc<Pause<C>>>,
    async_pauses: Vec<Arc<Pause<C>>>,
    generation: u64,
}

#[derive(Default)]
struct ResumeSequence {
    resumed_emitted: bool,
    landing: Option<Landing>,
    done: bool,
}

#[derive(Clone)]
enum Landing {
    Warp(PointDescription),
    StayPaused,
}

// Each directional step command, with the transitive steps to queue up
// once its target is known.
const PRECACHE_PLAN: [(ResumeCommand, &[ResumeCommand]); 4] = [
    (
        ResumeCommand::ReverseStepOver,
        &[ResumeCommand::ReverseStepOver, ResumeCommand::StepIn],
    ),
    (
        ResumeCommand::StepOver,
        &[ResumeCommand::StepOver, ResumeCommand::StepIn],
    ),
    (
        ResumeCommand::StepIn,
        &[ResumeCommand::StepOut, ResumeCommand::StepIn],
    ),
    (
        ResumeCommand::StepOut,
        &[
            ResumeCommand::ReverseStepOver,
            ResumeCommand::StepOver,
            ResumeCommand::StepIn,
            ResumeCommand::StepOut,
        ],
    ),
];

pub struct Session<C: ReplayClient> {
    pub(crate) client: Arc<C>,
    config: SessionConfig,
    session_id: Latch<SessionId>,
    initialized: Latch<()>,
    sources: SourceRegistry,
    pauses: PauseCache<C>,
    pub(crate) resume_targets: ResumeTargetCache,
    pub(crate) breakpoints: BreakpointRegistry,
    events: EventChannel,
    cursor: Mutex<Cursor<C>>,
    warp_hook: Mutex<Option<WarpHook>>,
}

impl<C: ReplayClient> Session<C> {
    pub fn new(client: C, config: SessionConfig) -> Arc<Self> {
        let events = EventChannel::new(config.event_capacity);
        Arc::new(Self {
            client: Arc::new(client),
            config,
            session_id: Latch::new(),
            initialized: Latch::new(),
            sources: SourceRegistry::new(),
            pauses: PauseCache::new(),
            resume_targets: ResumeTargetCache::new(),
            breakpoints: BreakpointRegistry::new(),
            events,
            cursor: Mutex::new(Cursor {
                point: ExecutionPoint::from("0"),
                time: 0.0,
                has_frames: false,
                pause: None,
                async_pauses: Vec::new(),
                generation: 0,
            }),
            warp_hook: Mutex::new(None),
        })
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    pub fn set_session_id(&self, session_id: SessionId) {
        debug!("{} got session id {session_id}", category_session());
        if !self.session_id.open(session_id) {
            warn!("{} session id set twice; keeping the first", category_session());
        }
    }

    pub async fn wait_for_session(&self) -> SessionId {
        self.session_id.wait().await
    }

    pub(crate) fn require_session_id(&self) -> SessionId {
        self.session_id
            .peek()
            .expect("session id required before it was set")
    }

    /// First warp, to the recording's entry point (supplied externally).
    /// Resume-family operations wait for this.
    pub fn initialize(self: &Arc<Self>, point: ExecutionPoint, time: f64, has_frames: bool) {
        self.time_warp(point, time, has_frames, true);
        self.initialized.open(());
    }

    pub async fn initialized(&self) {
        self.initialized.wait().await;
    }

    pub fn set_warp_hook(
        &self,
        hook: impl Fn(&ExecutionPoint, f64, bool) -> Option<WarpTarget> + Send + Sync + 'static,
    ) {
        *self.warp_hook.lock().expect("warp hook lock poisoned") = Some(Box::new(hook));
    }

    pub fn clear_warp_hook(&self) {
        *self.warp_hook.lock().expect("warp hook lock poisoned") = None;
    }

    fn cursor(&self) -> MutexGuard<'_, Cursor<C>> {
        self.cursor.lock().expect("cursor lock poisoned")
    }

    pub fn current_point(&self) -> ExecutionPoint {
        self.cursor().point.clone()
    }

    pub fn current_time(&self) -> f64 {
        self.cursor().time
    }

    pub fn current_point_has_frames(&self) -> bool {
        self.cursor().has_frames
    }

    fn paused_position(&self) -> (ExecutionPoint, f64, bool) {
        let cursor = self.cursor();
        (cursor.point.clone(), cursor.time, cursor.has_frames)
    }

    pub fn checkpoint(&self) -> CursorToken {
        CursorToken {
            generation: self.cursor().generation,
        }
    }

    pub fn still_at(&self, token: CursorToken) -> bool {
        self.cursor().generation == token.generation
    }

    /// Direct jump to a position (timeline click, console message). The
    /// warp-adjustment hook may redirect the target unless `force` is set.
    pub fn time_warp(self: &Arc<Self>, point: ExecutionPoint, time: f64, has_frames: bool, force: bool) {
        let (point, time, has_frames) = self.adjust_warp(point, time, has_frames, force);
        debug!("{} warp to {point}", category_session());
        {
            let mut cursor = self.cursor();
            cursor.generation += 1;
            cursor.point = point.clone();
            cursor.time = time;
            cursor.has_frames = has_frames;
            cursor.pause = None;
            cursor.async_pauses.clear();
        }
        self.events.emit(SessionEvent::Paused {
            point,
            time,
            has_frames,
        });
        self.spawn_precache();
    }

    /// Same as `time_warp`, but reuses an already-materialized Pause.
    pub fn time_warp_to_pause(self: &Arc<Self>, pause: Arc<Pause<C>>) {
        let point = pause.point().clone();
        let time = pause.time();
        let has_frames = pause.has_frames();
        debug!("{} warp to {point} using existing pause", category_session());
        {
            let mut cursor = self.cursor();
            cursor.generation += 1;
            cursor.point = point.clone();
            cursor.time = time;
            cursor.has_frames = has_frames;
            cursor.pause = Some(pause);
            cursor.async_pauses.clear();
        }
        self.events.emit(SessionEvent::Paused {
            point,
            time,
            has_frames,
        });
        self.spawn_precache();
    }

    fn adjust_warp(
        &self,
        point: ExecutionPoint,
        time: f64,
        has_frames: bool,
        force: bool,
    ) -> (ExecutionPoint, f64, bool) {
        if force {
            return (point, time, has_frames);
        }
        let hook = self.warp_hook.lock().expect("warp hook lock poisoned");
        match hook.as_ref().and_then(|hook| hook(&point, time, has_frames)) {
            Some(target) => (target.point, target.time, target.has_frames),
            None => (point, time, has_frames),
        }
    }

    pub fn ensure_pause(
        &self,
        point: &ExecutionPoint,
        time: f64,
        has_frames: bool,
    ) -> Arc<Pause<C>> {
        let session_id = self.require_session_id();
        self.pauses
            .ensure_pause(&self.client, &session_id, point, time, has_frames)
    }

    pub fn ensure_current_pause(&self) -> Arc<Pause<C>> {
        let session_id = self.require_session_id();
        let mut cursor = self.cursor();
        if let Some(pause) = &cursor.pause {
            return pause.clone();
        }
        let pause = self.pauses.ensure_pause(
            &self.client,
            &session_id,
            &cursor.point,
            cursor.time,
            cursor.has_frames,
        );
        cursor.pause = Some(pause.clone());
        pause
    }

    pub fn current_pause(&self) -> Option<Arc<Pause<C>>> {
        self.cursor().pause.clone()
    }

    /// Call stack at the current position. Empty if the position has no
    /// frames, or if the cursor moved while the fetch was in flight.
    pub async fn get_frames(&self) -> RpcResult<Vec<Frame>> {
        if !self.current_point_has_frames() {
            return Ok(Vec::new());
        }
        self.sources.all_sources_known().await;
        let token = self.checkpoint();
        let pause = self.ensure_current_pause();
        let frames = pause.frames().await?;
        if !self.still_at(token) {
            return Ok(Vec::new());
        }
        Ok(frames)
    }

    // Index 0 is the current pause; higher indices walk the reconstructed
    // async chain. An index past the chain is a broken precondition.
    fn pause_for_async_index(&self, async_index: usize) -> Arc<Pause<C>> {
        let current = self.ensure_current_pause();
        if async_index == 0 {
            current
        } else {
            self.cursor()
                .async_pauses
                .get(async_index - 1)
                .cloned()
                .expect("async pause index past the reconstructed chain")
        }
    }

    fn last_async_pause(&self) -> Arc<Pause<C>> {
        let current = self.ensure_current_pause();
        self.cursor().async_pauses.last().cloned().unwrap_or(current)
    }

    pub async fn get_scopes(&self, async_index: usize, frame_id: &FrameId) -> RpcResult<Vec<Scope>> {
        self.sources.all_sources_known().await;
        let token = self.checkpoint();
        let pause = self.pause_for_async_index(async_index);
        let scopes = pause.scopes(frame_id).await?;
        if !self.still_at(token) {
            return Ok(Vec::new());
        }
        Ok(scopes)
    }

    pub async fn get_frame_steps(
        &self,
        async_index: usize,
        frame_id: &FrameId,
    ) -> RpcResult<Vec<PointDescription>> {
        self.sources.all_sources_known().await;
        let token = self.checkpoint();
        let pause = self.pause_for_async_index(async_index);
        let steps = pause.frame_steps(frame_id).await?;
        if !self.still_at(token) {
            return Ok(Vec::new());
        }
        Ok(steps)
    }

    /// Evaluates in a frame of the current (or an async-parent) pause.
    /// An empty result is returned if the cursor moved mid-flight.
    pub async fn evaluate(
        &self,
        async_index: usize,
        frame_id: Option<&FrameId>,
        expression: &str,
    ) -> RpcResult<EvalResult> {
        self.sources.all_sources_known().await;
        let token = self.checkpoint();
        let pause = self.pause_for_async_index(async_index);
        let result = pause.evaluate(frame_id, expression).await?;
        if !self.still_at(token) {
            return Ok(EvalResult::default());
        }
        Ok(result)
    }

    /// Extends the async call-stack chain by one parent: the entry point
    /// of the frame that scheduled the chain's current tail. Returns that
    /// parent's frames minus the first (it duplicates the call site
    /// already shown), or nothing if the cursor moved mid-reconstruction.
    pub async fn load_async_parent_frames(&self) -> RpcResult<Vec<Frame>> {
        self.sources.all_sources_known().await;
        let token = self.checkpoint();
        let base = self.last_async_pause();
        let base_frames = base.frames().await?;
        if !Arc::ptr_eq(&base, &self.last_async_pause()) || base_frames.is_empty() {
            return Ok(Vec::new());
        }
        let outermost = base_frames
            .last()
            .expect("non-empty frame list has an outermost frame");
        let steps = base.frame_steps(&outermost.frame_id).await?;
        if !Arc::ptr_eq(&base, &self.last_async_pause()) {
            return Ok(Vec::new());
        }
        // The first recorded step is the entry point of the async caller.
        let Some(entry) = steps.first() else {
            return Ok(Vec::new());
        };
        let entry_pause = self.ensure_pause(&entry.point, entry.time, true);
        {
            let mut cursor = self.cursor();
            if cursor.generation != token.generation {
                return Ok(Vec::new());
            }
            cursor.async_pauses.push(entry_pause.clone());
        }
        let frames = entry_pause.frames().await?;
        if !Arc::ptr_eq(&entry_pause, &self.last_async_pause()) {
            return Ok(Vec::new());
        }
        Ok(frames.into_iter().skip(1).collect())
    }

    pub async fn load_root_document(&self) -> RpcResult<Option<Value>> {
        self.sources.all_sources_known().await;
        let token = self.checkpoint();
        let pause = self.ensure_current_pause();
        let document = pause.document().await?;
        Ok(self.still_at(token).then_some(document))
    }

    pub async fn search_dom(&self, query: &str) -> RpcResult<Option<Vec<Value>>> {
        self.sources.all_sources_known().await;
        let token = self.checkpoint();
        let pause = self.ensure_current_pause();
        let nodes = pause.search_dom(query).await?;
        Ok(self.still_at(token).then_some(nodes))
    }

    pub async fn get_mouse_target(&self, x: f64, y: f64) -> RpcResult<Option<Value>> {
        self.sources.all_sources_known().await;
        let token = self.checkpoint();
        let pause = self.ensure_current_pause();
        let target = pause.mouse_target(x, y).await?;
        if !self.still_at(token) {
            return Ok(None);
        }
        Ok(target)
    }

    pub(crate) async fn find_resume_target(
        &self,
        point: &ExecutionPoint,
        command: ResumeCommand,
    ) -> RpcResult<PointDescription> {
        let session_id = self.require_session_id();
        self.sources.all_sources_known().await;

        if let Some(target) = self.resume_targets.lookup(point, command) {
            return Ok(target);
        }

        let epoch = self.resume_targets.epoch();
        let target = self
            .client
            .find_resume_target(&session_id, point, command)
            .await?;
        self.resume_targets
            .store_if_current(epoch, point, command, target.clone());
        Ok(target)
    }

    pub async fn resume(self: &Arc<Self>, origin: Option<ExecutionPoint>, regions: &LoadedRegions) {
        self.resume_operation(ResumeCommand::Resume, origin, regions).await;
    }

    pub async fn rewind(self: &Arc<Self>, origin: Option<ExecutionPoint>, regions: &LoadedRegions) {
        self.resume_operation(ResumeCommand::Rewind, origin, regions).await;
    }

    pub async fn step_over(self: &Arc<Self>, origin: Option<ExecutionPoint>, regions: &LoadedRegions) {
        self.resume_operation(ResumeCommand::StepOver, origin, regions).await;
    }

    pub async fn step_in(self: &Arc<Self>, origin: Option<ExecutionPoint>, regions: &LoadedRegions) {
        self.resume_operation(ResumeCommand::StepIn, origin, regions).await;
    }

    pub async fn step_out(self: &Arc<Self>, origin: Option<ExecutionPoint>, regions: &LoadedRegions) {
        self.resume_operation(ResumeCommand::StepOut, origin, regions).await;
    }

    pub async fn reverse_step_over(
        self: &Arc<Self>,
        origin: Option<ExecutionPoint>,
        regions: &LoadedRegions,
    ) {
        self.resume_operation(ResumeCommand::ReverseStepOver, origin, regions)
            .await;
    }

    /// Where `resume` would land from `point`, without moving the cursor.
    pub async fn resume_target(&self, point: &ExecutionPoint) -> RpcResult<PointDescription> {
        self.initialized.wait().await;
        self.find_resume_target(point, ResumeCommand::Resume).await
    }

    async fn resume_operation(
        self: &Arc<Self>,
        command: ResumeCommand,
        origin: Option<ExecutionPoint>,
        regions: &LoadedRegions,
    ) {
        // No resumes until the initial warp to the endpoint has happened.
        self.initialized.wait().await;
        debug!("{} {:?}", category_step(), command);

        let sequence = Arc::new(Mutex::new(ResumeSequence::default()));

        // Emit "resumed" on the next scheduling turn, never synchronously.
        // If the target is already staged by then, the landing warp runs on
        // a further turn, so the UI always observes resumed before paused
        // even when the target resolves instantly.
        tokio::spawn({
            let session = Arc::clone(self);
            let sequence = Arc::clone(&sequence);
            async move {
                tokio::task::yield_now().await;
                let staged = {
                    let mut seq = sequence.lock().expect("resume sequence lock poisoned");
                    session.emit(SessionEvent::Resumed);
                    seq.resumed_emitted = true;
                    if seq.done { None } else { seq.landing.clone() }
                };
                if let Some(landing) = staged {
                    tokio::task::yield_now().await;
                    let run = {
                        let mut seq = sequence.lock().expect("resume sequence lock poisoned");
                        if seq.done {
                            false
                        } else {
                            seq.done = true;
                            true
                        }
                    };
                    if run {
                        session.perform_landing(landing);
                    }
                }
            }
        });

        let origin = origin.unwrap_or_else(|| self.current_point());
        let landing = match self.find_resume_target(&origin, command).await {
            Ok(target) if regions.contains_time(target.time) => Landing::Warp(target),
            Ok(target) => {
                // The backend has not finished processing that region yet;
                // the operation is a no-op for the user.
                debug!(
                    "{} target {} at {} is outside the loaded regions",
                    category_step(),
                    target.point,
                    target.time
                );
                Landing::StayPaused
            }
            Err(err) => {
                warn!("{} resume target lookup failed: {err}", category_step());
                Landing::StayPaused
            }
        };

        let run_now = {
            let mut seq = sequence.lock().expect("resume sequence lock poisoned");
            seq.landing = Some(landing.clone());
            if seq.resumed_emitted && !seq.done {
                seq.done = true;
                true
            } else {
                false
            }
        };
        if run_now {
            self.perform_landing(landing);
        }
    }

    fn perform_landing(self: &Arc<Self>, landing: Landing) {
        match landing {
            Landing::Warp(target) => {
                let has_frames = target.has_frames();
                self.time_warp(target.point, target.time, has_frames, false);
            }
            Landing::StayPaused => {
                let (point, time, has_frames) = self.paused_position();
                self.events.emit(SessionEvent::Paused {
                    point,
                    time,
                    has_frames,
                });
            }
        }
    }

    /// Speculatively resolves step targets from the current point, and one
    /// level of likely follow-up steps from each target. Prefetches are
    /// abandoned once the epoch advances or the cursor moves away; they
    /// never delay a user-initiated operation.
    pub(crate) fn spawn_precache(self: &Arc<Self>) {
        if !self.config.precache || self.session_id.peek().is_none() {
            return;
        }
        let (point, _, has_frames) = self.paused_position();
        if !has_frames {
            return;
        }
        let epoch = self.resume_targets.epoch();

        for (command, transitive) in PRECACHE_PLAN {
            let session = Arc::clone(self);
            let point = point.clone();
            tokio::spawn(async move {
                let Ok(target) = session.find_resume_target(&point, command).await else {
                    return;
                };
                if session.resume_targets.epoch() != epoch || !target.has_frames() {
                    return;
                }
                session.ensure_pause(&target.point, target.time, true);
                if session.current_point() != point {
                    return;
                }
                for &next in transitive {
                    let session = Arc::clone(&session);
                    let origin = point.clone();
                    let from = target.point.clone();
                    tokio::spawn(async move {
                        let Ok(transitive_target) =
                            session.find_resume_target(&from, next).await
                        else {
                            return;
                        };
                        if session.resume_targets.epoch() != epoch
                            || session.current_point() != origin
                            || !transitive_target.has_frames()
                        {
                            return;
                        }
                        session.ensure_pause(&transitive_target.point, transitive_target.time, true);
                    });
                }
            });
        }
    }

    pub async fn wait_for_invalidations_to_settle(&self) {
        self.resume_targets.wait_for_invalidations_to_settle().await;
    }

    /// Subscribes to backend push events, drives source registration, and
    /// opens the all-sources-known barrier once enumeration completes.
    /// Emits one `NewSource` session event per equivalence class.
    pub async fn sync_sources(self: &Arc<Self>) -> RpcResult<()> {
        let session_id = self.wait_for_session().await;
        let mut rx = self.client.subscribe();

        self.client.find_sources(&session_id).await?;
        // The channel is ordered: every source announced before
        // find_sources resolved is already buffered. Drain before grouping
        // runs, then hand the receiver to the long-lived pump.
        loop {
            match rx.try_recv() {
                Ok(event) => self.handle_backend_event(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(
                        "{} backend event stream lagged; skipped {skipped} events",
                        category_session()
                    );
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }
        let representatives = self.sources.mark_all_sources_known();
        for source in representatives {
            self.events.emit(SessionEvent::NewSource(source));
        }
        self.spawn_backend_event_pump(rx);
        Ok(())
    }

    /// Begins console message discovery; messages arrive through the
    /// backend event pump started by `sync_sources`.
    pub async fn find_console_messages(&self) -> RpcResult<()> {
        let session_id = self.wait_for_session().await;
        self.client.find_messages(&session_id).await
    }

    fn spawn_backend_event_pump(self: &Arc<Self>, mut rx: broadcast::Receiver<BackendEvent>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => session.handle_backend_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "{} backend event stream lagged; skipped {skipped} events",
                            category_session()
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn handle_backend_event(self: &Arc<Self>, event: BackendEvent) {
        match event {
            BackendEvent::NewSource(source) => {
                self.sources.register_source(source);
            }
            BackendEvent::NewMessage(message) => {
                // Messages wait for the sources barrier; handle them off the
                // pump so source registrations keep flowing.
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    session.handle_console_message(message).await;
                });
            }
            BackendEvent::LoadedRegionsChanged(regions) => {
                self.emit(SessionEvent::LoadedRegionsChanged(regions));
            }
        }
    }

    async fn handle_console_message(&self, mut message: Message) {
        self.sources.all_sources_known().await;
        let session_id = self.require_session_id();
        self.pauses.adopt(
            &self.client,
            &session_id,
            message.pause_id.clone(),
            &message.point.point,
            message.point.time,
            message.point.frame.is_some(),
        );
        if let Some(source_id) = &message.source_id {
            message.source_id = Some(self.sources.canonical_source_id(source_id));
        }
        self.events.emit(SessionEvent::ConsoleMessage(message));
    }
}
