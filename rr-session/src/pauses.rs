// Snapshot objects for execution points. A Pause materializes lazily:
// the backend-side pause is created on first use, and frames, frame
// steps, and scopes are fetched once and memoized. The cache guarantees
// a single live Pause per execution point for the life of the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::{
    EvalResult, ExecutionPoint, Frame, FrameId, PauseId, PointDescription, ReplayClient, RpcResult,
    Scope, SessionId,
};
use serde_json::Value;
use tokio::sync::OnceCell;

pub struct Pause<C: ReplayClient> {
    client: Arc<C>,
    session_id: SessionId,
    point: ExecutionPoint,
    time: f64,
    has_frames: bool,
    pause_id: OnceCell<PauseId>,
    frames: OnceCell<Vec<Frame>>,
    frame_steps: Mutex<HashMap<FrameId, Arc<OnceCell<Vec<PointDescription>>>>>,
    scopes: Mutex<HashMap<FrameId, Arc<OnceCell<Vec<Scope>>>>>,
    document: OnceCell<Value>,
}

impl<C: ReplayClient> Pause<C> {
    fn new(
        client: Arc<C>,
        session_id: SessionId,
        point: ExecutionPoint,
        time: f64,
        has_frames: bool,
    ) -> Self {
        Self {
            client,
            session_id,
            point,
            time,
            has_frames,
            pause_id: OnceCell::new(),
            frames: OnceCell::new(),
            frame_steps: Mutex::new(HashMap::new()),
            scopes: Mutex::new(HashMap::new()),
            document: OnceCell::new(),
        }
    }

    /// A pause the backend has already materialized (console messages
    /// arrive with their pause id attached); no create round-trip needed.
    fn instantiated(
        client: Arc<C>,
        session_id: SessionId,
        pause_id: PauseId,
        point: ExecutionPoint,
        time: f64,
        has_frames: bool,
    ) -> Self {
        let pause = Self::new(client, session_id, point, time, has_frames);
        pause
            .pause_id
            .set(pause_id)
            .expect("fresh pause cannot already have an id");
        pause
    }

    pub fn point(&self) -> &ExecutionPoint {
        &self.point
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn has_frames(&self) -> bool {
        self.has_frames
    }

    async fn pause_id(&self) -> RpcResult<&PauseId> {
        self.pause_id
            .get_or_try_init(|| self.client.create_pause(&self.session_id, &self.point))
            .await
    }

    /// Call stack at this point, outermost frame last. Fetched once.
    pub async fn frames(&self) -> RpcResult<Vec<Frame>> {
        let frames = self
            .frames
            .get_or_try_init(|| async {
                let pause_id = self.pause_id().await?;
                self.client.get_frames(&self.session_id, pause_id).await
            })
            .await?;
        Ok(frames.clone())
    }

    pub async fn frame_steps(&self, frame_id: &FrameId) -> RpcResult<Vec<PointDescription>> {
        let cell = entry(&self.frame_steps, frame_id);
        let steps = cell
            .get_or_try_init(|| async {
                let pause_id = self.pause_id().await?;
                self.client
                    .get_frame_steps(&self.session_id, pause_id, frame_id)
                    .await
            })
            .await?;
        Ok(steps.clone())
    }

    pub async fn scopes(&self, frame_id: &FrameId) -> RpcResult<Vec<Scope>> {
        let cell = entry(&self.scopes, frame_id);
        let scopes = cell
            .get_or_try_init(|| async {
                let pause_id = self.pause_id().await?;
                self.client
                    .get_scopes(&self.session_id, pause_id, frame_id)
                    .await
            })
            .await?;
        Ok(scopes.clone())
    }

    // Evaluation results are never memoized; the same expression can be
    // asked with different frames in scope.
    pub async fn evaluate(
        &self,
        frame_id: Option<&FrameId>,
        expression: &str,
    ) -> RpcResult<EvalResult> {
        let pause_id = self.pause_id().await?;
        self.client
            .evaluate(&self.session_id, pause_id, frame_id, expression)
            .await
    }

    pub async fn document(&self) -> RpcResult<Value> {
        let document = self
            .document
            .get_or_try_init(|| async {
                let pause_id = self.pause_id().await?;
                self.client.load_document(&self.session_id, pause_id).await
            })
            .await?;
        Ok(document.clone())
    }

    pub async fn search_dom(&self, query: &str) -> RpcResult<Vec<Value>> {
        let pause_id = self.pause_id().await?;
        self.client
            .search_dom(&self.session_id, pause_id, query)
            .await
    }

    pub async fn mouse_target(&self, x: f64, y: f64) -> RpcResult<Option<Value>> {
        let pause_id = self.pause_id().await?;
        self.client
            .get_mouse_target(&self.session_id, pause_id, x, y)
            .await
    }
}

fn entry<T>(
    map: &Mutex<HashMap<FrameId, Arc<OnceCell<T>>>>,
    frame_id: &FrameId,
) -> Arc<OnceCell<T>> {
    map.lock()
        .expect("pause memo lock poisoned")
        .entry(frame_id.clone())
        .or_default()
        .clone()
}

/// Single-flight store of every Pause created this session, keyed by
/// execution point. Entries are never removed.
pub struct PauseCache<C: ReplayClient> {
    pauses: Mutex<HashMap<ExecutionPoint, Arc<Pause<C>>>>,
}

impl<C: ReplayClient> PauseCache<C> {
    pub fn new() -> Self {
        Self {
            pauses: Mutex::new(HashMap::new()),
        }
    }

    fn pauses(&self) -> MutexGuard<'_, HashMap<ExecutionPoint, Arc<Pause<C>>>> {
        self.pauses.lock().expect("pause cache lock poisoned")
    }

    /// Returns the existing Pause for `point`, or constructs and registers
    /// one. The first construction wins; callers always share one instance.
    pub fn ensure_pause(
        &self,
        client: &Arc<C>,
        session_id: &SessionId,
        point: &ExecutionPoint,
        time: f64,
        has_frames: bool,
    ) -> Arc<Pause<C>> {
        self.pauses()
            .entry(point.clone())
            .or_insert_with(|| {
                Arc::new(Pause::new(
                    Arc::clone(client),
                    session_id.clone(),
                    point.clone(),
                    time,
                    has_frames,
                ))
            })
            .clone()
    }

    /// Registers a backend-announced pause. If a Pause already exists for
    /// the point it wins, keeping the one-instance-per-point invariant.
    pub fn adopt(
        &self,
        client: &Arc<C>,
        session_id: &SessionId,
        pause_id: PauseId,
        point: &ExecutionPoint,
        time: f64,
        has_frames: bool,
    ) -> Arc<Pause<C>> {
        self.pauses()
            .entry(point.clone())
            .or_insert_with(|| {
                Arc::new(Pause::instantiated(
                    Arc::clone(client),
                    session_id.clone(),
                    pause_id,
                    point.clone(),
                    time,
                    has_frames,
                ))
            })
            .clone()
    }
}

impl<C: ReplayClient> Default for PauseCache<C> {
    fn default() -> Self {
        Self::new()
    }
}
