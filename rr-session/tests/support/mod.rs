#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::{
    BackendEvent, BreakpointId, EvalResult, ExecutionPoint, Frame, FrameId, Location, Message,
    MessageLevel, NewSource, PauseId, PointDescription, ReplayClient, ResumeCommand, RpcError,
    RpcResult, SameLineSourceLocations, Scope, SessionId, SourceId, SourceKind, SourceLocation,
};
use serde_json::{Value, json};
use session::{Latch, Session, SessionConfig, SessionEvent};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const TEST_SESSION_ID: &str = "test-session";

#[derive(Default)]
struct MockState {
    sources: Mutex<Vec<NewSource>>,
    messages: Mutex<Vec<Message>>,
    resume_targets: Mutex<HashMap<(ExecutionPoint, ResumeCommand), Result<PointDescription, RpcError>>>,
    frames: Mutex<HashMap<ExecutionPoint, Vec<Frame>>>,
    frame_steps: Mutex<HashMap<(ExecutionPoint, FrameId), Vec<PointDescription>>>,
    scopes: Mutex<HashMap<(ExecutionPoint, FrameId), Vec<Scope>>>,
    pause_points: Mutex<HashMap<PauseId, ExecutionPoint>>,
    installed: Mutex<HashMap<BreakpointId, Location>>,
    invalid_breakpoint_sources: Mutex<HashSet<SourceId>>,
    frames_gate: Mutex<Option<Arc<Latch<()>>>>,
    target_gate: Mutex<Option<Arc<Latch<()>>>>,
    calls: Mutex<Vec<String>>,
}

/// Scriptable in-process backend. Cloning shares all state, so tests keep
/// a handle after handing one clone to the session.
#[derive(Clone)]
pub struct MockReplayClient {
    state: Arc<MockState>,
    events: broadcast::Sender<BackendEvent>,
}

impl MockReplayClient {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            state: Arc::new(MockState::default()),
            events,
        }
    }

    fn log(&self, call: String) {
        self.state.calls.lock().expect("calls lock").push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().expect("calls lock").clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn add_source(&self, source: NewSource) {
        self.state.sources.lock().expect("sources lock").push(source);
    }

    pub fn add_message(&self, message: Message) {
        self.state
            .messages
            .lock()
            .expect("messages lock")
            .push(message);
    }

    pub fn send_event(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    pub fn stub_resume_target(
        &self,
        point: &ExecutionPoint,
        command: ResumeCommand,
        target: PointDescription,
    ) {
        self.state
            .resume_targets
            .lock()
            .expect("targets lock")
            .insert((point.clone(), command), Ok(target));
    }

    pub fn fail_resume_target(&self, point: &ExecutionPoint, command: ResumeCommand) {
        self.state.resume_targets.lock().expect("targets lock").insert(
            (point.clone(), command),
            Err(RpcError::Transport("mock backend unreachable".to_string())),
        );
    }

    pub fn stub_frames(&self, point: &ExecutionPoint, frames: Vec<Frame>) {
        self.state
            .frames
            .lock()
            .expect("frames lock")
            .insert(point.clone(), frames);
    }

    pub fn stub_frame_steps(
        &self,
        point: &ExecutionPoint,
        frame_id: &FrameId,
        steps: Vec<PointDescription>,
    ) {
        self.state
            .frame_steps
            .lock()
            .expect("steps lock")
            .insert((point.clone(), frame_id.clone()), steps);
    }

    pub fn stub_scopes(&self, point: &ExecutionPoint, frame_id: &FrameId, scopes: Vec<Scope>) {
        self.state
            .scopes
            .lock()
            .expect("scopes lock")
            .insert((point.clone(), frame_id.clone()), scopes);
    }

    pub fn mark_invalid_breakpoint_source(&self, source_id: &SourceId) {
        self.state
            .invalid_breakpoint_sources
            .lock()
            .expect("invalid sources lock")
            .insert(source_id.clone());
    }

    /// Makes `get_frames` block until the returned latch is opened.
    pub fn gate_frames(&self) -> Arc<Latch<()>> {
        let gate = Arc::new(Latch::new());
        *self.state.frames_gate.lock().expect("frames gate lock") = Some(gate.clone());
        gate
    }

    /// Makes `find_resume_target` block until the returned latch is opened.
    pub fn gate_resume_targets(&self) -> Arc<Latch<()>> {
        let gate = Arc::new(Latch::new());
        *self.state.target_gate.lock().expect("target gate lock") = Some(gate.clone());
        gate
    }

    pub fn installed_breakpoints(&self) -> Vec<Location> {
        self.state
            .installed
            .lock()
            .expect("installed lock")
            .values()
            .cloned()
            .collect()
    }

    fn point_for_pause(&self, pause_id: &PauseId) -> ExecutionPoint {
        self.state
            .pause_points
            .lock()
            .expect("pause points lock")
            .get(pause_id)
            .cloned()
            .expect("pause id should come from create_pause or register_pause")
    }

    /// Associates a backend-announced pause id with a point, mirroring
    /// pauses attached to console messages.
    pub fn register_pause(&self, pause_id: &PauseId, point: &ExecutionPoint) {
        self.state
            .pause_points
            .lock()
            .expect("pause points lock")
            .insert(pause_id.clone(), point.clone());
    }

    async fn maybe_wait(gate: &Mutex<Option<Arc<Latch<()>>>>) {
        let gate = gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
    }
}

impl ReplayClient for MockReplayClient {
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    async fn find_sources(&self, _session: &SessionId) -> RpcResult<()> {
        self.log("find_sources".to_string());
        let sources = self.state.sources.lock().expect("sources lock").clone();
        for source in sources {
            let _ = self.events.send(BackendEvent::NewSource(source));
        }
        Ok(())
    }

    async fn find_messages(&self, _session: &SessionId) -> RpcResult<()> {
        self.log("find_messages".to_string());
        let messages = self.state.messages.lock().expect("messages lock").clone();
        for message in messages {
            let _ = self.events.send(BackendEvent::NewMessage(message));
        }
        Ok(())
    }

    async fn get_possible_breakpoints(
        &self,
        _session: &SessionId,
        source_id: &SourceId,
        _range: Option<(SourceLocation, SourceLocation)>,
    ) -> RpcResult<Vec<SameLineSourceLocations>> {
        self.log(format!("get_possible_breakpoints {source_id}"));
        Ok(Vec::new())
    }

    async fn set_breakpoint(
        &self,
        _session: &SessionId,
        location: &Location,
        _condition: Option<&str>,
    ) -> RpcResult<BreakpointId> {
        self.log(format!(
            "set_breakpoint {}:{}:{}",
            location.source_id, location.line, location.column
        ));
        let invalid = self
            .state
            .invalid_breakpoint_sources
            .lock()
            .expect("invalid sources lock")
            .contains(&location.source_id);
        if invalid {
            return Err(RpcError::Protocol {
                code: 29,
                message: format!("no breakpoint positions at {}", location.source_id),
            });
        }
        let breakpoint_id = BreakpointId::new(format!("bp-{}", Uuid::new_v4()));
        self.state
            .installed
            .lock()
            .expect("installed lock")
            .insert(breakpoint_id.clone(), location.clone());
        Ok(breakpoint_id)
    }

    async fn remove_breakpoint(
        &self,
        _session: &SessionId,
        breakpoint_id: &BreakpointId,
    ) -> RpcResult<()> {
        self.log(format!("remove_breakpoint {breakpoint_id}"));
        self.state
            .installed
            .lock()
            .expect("installed lock")
            .remove(breakpoint_id);
        Ok(())
    }

    async fn blackbox_source(
        &self,
        _session: &SessionId,
        source_id: &SourceId,
        _begin: SourceLocation,
        _end: SourceLocation,
    ) -> RpcResult<()> {
        self.log(format!("blackbox_source {source_id}"));
        Ok(())
    }

    async fn unblackbox_source(
        &self,
        _session: &SessionId,
        source_id: &SourceId,
        _begin: SourceLocation,
        _end: SourceLocation,
    ) -> RpcResult<()> {
        self.log(format!("unblackbox_source {source_id}"));
        Ok(())
    }

    async fn find_resume_target(
        &self,
        _session: &SessionId,
        point: &ExecutionPoint,
        command: ResumeCommand,
    ) -> RpcResult<PointDescription> {
        self.log(format!("find_resume_target {point} {command:?}"));
        Self::maybe_wait(&self.state.target_gate).await;
        self.state
            .resume_targets
            .lock()
            .expect("targets lock")
            .get(&(point.clone(), command))
            .cloned()
            .unwrap_or_else(|| {
                Err(RpcError::Protocol {
                    code: 77,
                    message: format!("no {command:?} target stubbed for {point}"),
                })
            })
    }

    async fn create_pause(
        &self,
        _session: &SessionId,
        point: &ExecutionPoint,
    ) -> RpcResult<PauseId> {
        self.log(format!("create_pause {point}"));
        let pause_id = PauseId::new(format!("pause-{}", Uuid::new_v4()));
        self.register_pause(&pause_id, point);
        Ok(pause_id)
    }

    async fn get_frames(&self, _session: &SessionId, pause_id: &PauseId) -> RpcResult<Vec<Frame>> {
        let point = self.point_for_pause(pause_id);
        self.log(format!("get_frames {point}"));
        Self::maybe_wait(&self.state.frames_gate).await;
        Ok(self
            .state
            .frames
            .lock()
            .expect("frames lock")
            .get(&point)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_frame_steps(
        &self,
        _session: &SessionId,
        pause_id: &PauseId,
        frame_id: &FrameId,
    ) -> RpcResult<Vec<PointDescription>> {
        let point = self.point_for_pause(pause_id);
        self.log(format!("get_frame_steps {point} {frame_id}"));
        Ok(self
            .state
            .frame_steps
            .lock()
            .expect("steps lock")
            .get(&(point, frame_id.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_scopes(
        &self,
        _session: &SessionId,
        pause_id: &PauseId,
        frame_id: &FrameId,
    ) -> RpcResult<Vec<Scope>> {
        let point = self.point_for_pause(pause_id);
        self.log(format!("get_scopes {point} {frame_id}"));
        Ok(self
            .state
            .scopes
            .lock()
            .expect("scopes lock")
            .get(&(point, frame_id.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn evaluate(
        &self,
        _session: &SessionId,
        pause_id: &PauseId,
        _frame_id: Option<&FrameId>,
        expression: &str,
    ) -> RpcResult<EvalResult> {
        let point = self.point_for_pause(pause_id);
        self.log(format!("evaluate {point} {expression}"));
        Ok(EvalResult {
            returned: Some(json!({ "expression": expression, "point": point.as_str() })),
            exception: None,
        })
    }

    async fn load_document(&self, _session: &SessionId, pause_id: &PauseId) -> RpcResult<Value> {
        let point = self.point_for_pause(pause_id);
        self.log(format!("load_document {point}"));
        Ok(json!({ "node": "document", "point": point.as_str() }))
    }

    async fn search_dom(
        &self,
        _session: &SessionId,
        pause_id: &PauseId,
        query: &str,
    ) -> RpcResult<Vec<Value>> {
        let point = self.point_for_pause(pause_id);
        self.log(format!("search_dom {point} {query}"));
        Ok(Vec::new())
    }

    async fn get_mouse_target(
        &self,
        _session: &SessionId,
        pause_id: &PauseId,
        _x: f64,
        _y: f64,
    ) -> RpcResult<Option<Value>> {
        let point = self.point_for_pause(pause_id);
        self.log(format!("get_mouse_target {point}"));
        Ok(None)
    }
}

pub fn point(value: &str) -> ExecutionPoint {
    ExecutionPoint::from(value)
}

pub fn target(value: &str, time: f64, has_frames: bool) -> PointDescription {
    PointDescription {
        point: point(value),
        time,
        frame: has_frames.then(Vec::new),
    }
}

pub fn frame(id: &str, source: &str, line: u32) -> Frame {
    Frame {
        frame_id: FrameId::from(id),
        function_name: Some(format!("fn_{id}")),
        location: vec![Location {
            source_id: SourceId::from(source),
            line,
            column: 0,
        }],
    }
}

pub fn generated_source(id: &str, url: &str) -> NewSource {
    NewSource {
        source_id: SourceId::from(id),
        kind: SourceKind::Generated,
        url: Some(url.to_string()),
        generated_source_ids: Vec::new(),
    }
}

pub fn original_source(id: &str, url: &str, generated: &[&str]) -> NewSource {
    NewSource {
        source_id: SourceId::from(id),
        kind: SourceKind::SourceMapped,
        url: Some(url.to_string()),
        generated_source_ids: generated.iter().map(|g| SourceId::from(*g)).collect(),
    }
}

pub fn console_message(pause_id: &str, at: &str, time: f64, source: Option<&str>, text: &str) -> Message {
    Message {
        pause_id: PauseId::from(pause_id),
        point: PointDescription {
            point: point(at),
            time,
            frame: None,
        },
        source_id: source.map(SourceId::from),
        text: text.to_string(),
        level: MessageLevel::Info,
    }
}

/// Everything loaded: targets anywhere in [0, 10_000] are reachable.
pub fn wide_regions() -> protocol::LoadedRegions {
    protocol::LoadedRegions {
        loaded: vec![protocol::TimeRange {
            begin: 0.0,
            end: 10_000.0,
        }],
    }
}

pub fn quiet_config() -> SessionConfig {
    SessionConfig {
        precache: false,
        ..SessionConfig::default()
    }
}

/// Session with the id set and sources synced, paused at `entry`.
pub async fn ready_session(
    mock: &MockReplayClient,
    config: SessionConfig,
    entry: &str,
    entry_time: f64,
    entry_has_frames: bool,
) -> Arc<Session<MockReplayClient>> {
    let session = Session::new(mock.clone(), config);
    session.set_session_id(SessionId::from(TEST_SESSION_ID));
    session
        .sync_sources()
        .await
        .expect("source sync should succeed");
    session.initialize(point(entry), entry_time, entry_has_frames);
    session
}

pub async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel should stay open")
}

/// Polls until `condition` holds; panics after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}
