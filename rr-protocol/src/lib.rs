// Wire-level data model for the record-replay backend, plus the
// `ReplayClient` capability trait the session controller drives. The
// transport and dispatch behind the trait are not specified here; the
// controller only relies on the ordering guarantees of one session-scoped
// message channel.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

macro_rules! string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(
            Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(SessionId);
string_id!(SourceId);
string_id!(PauseId);
string_id!(FrameId);
string_id!(BreakpointId);

string_id!(
    /// Opaque identifier of a moment in the recorded execution. Totally
    /// ordered by the backend's zero-padded encoding; the controller only
    /// relies on equality.
    ExecutionPoint
);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    Generated,
    SourceMapped,
    PrettyPrinted,
    Html,
    InlineScript,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSource {
    pub source_id: SourceId,
    pub kind: SourceKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub generated_source_ids: Vec<SourceId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub source_id: SourceId,
    pub line: u32,
    pub column: u32,
}

/// The same generated location expressed in every source that can
/// represent it (generated, original, pretty-printed, ...).
pub type MappedLocation = Vec<Location>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SameLineSourceLocations {
    pub line: u32,
    pub columns: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    #[serde(default)]
    pub function_name: Option<String>,
    pub location: MappedLocation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Global,
    Function,
    Block,
    With,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub scope_id: String,
    pub kind: ScopeKind,
    #[serde(default)]
    pub bindings: Vec<(String, Value)>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    #[serde(default)]
    pub returned: Option<Value>,
    #[serde(default)]
    pub exception: Option<Value>,
}

/// Where a resume-family command lands: the point, its time, and the
/// topmost frame if the point has stack frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointDescription {
    pub point: ExecutionPoint,
    pub time: f64,
    #[serde(default)]
    pub frame: Option<MappedLocation>,
}

impl PointDescription {
    pub fn has_frames(&self) -> bool {
        self.frame.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: f64,
    pub end: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadedRegions {
    #[serde(default)]
    pub loaded: Vec<TimeRange>,
}

impl LoadedRegions {
    pub fn contains_time(&self, time: f64) -> bool {
        self.loaded
            .iter()
            .any(|region| time >= region.begin && time <= region.end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeCommand {
    Resume,
    Rewind,
    StepOver,
    StepIn,
    StepOut,
    ReverseStepOver,
}

impl ResumeCommand {
    pub fn wire_method(self) -> &'static str {
        match self {
            ResumeCommand::Resume => "findResumeTarget",
            ResumeCommand::Rewind => "findRewindTarget",
            ResumeCommand::StepOver => "findStepOverTarget",
            ResumeCommand::StepIn => "findStepInTarget",
            ResumeCommand::StepOut => "findStepOutTarget",
            ResumeCommand::ReverseStepOver => "findReverseStepOverTarget",
        }
    }

    pub fn is_forward(self) -> bool {
        !matches!(self, ResumeCommand::Rewind | ResumeCommand::ReverseStepOver)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    #[default]
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub pause_id: PauseId,
    pub point: PointDescription,
    #[serde(default)]
    pub source_id: Option<SourceId>,
    pub text: String,
    #[serde(default)]
    pub level: MessageLevel,
}

/// Push notifications delivered outside the request/response flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    NewSource(NewSource),
    NewMessage(Message),
    LoadedRegionsChanged(LoadedRegions),
}

#[derive(Debug, Clone)]
pub enum RpcError {
    Transport(String),
    Protocol { code: u32, message: String },
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(message) => write!(f, "transport error: {message}"),
            RpcError::Protocol { code, message } => {
                write!(f, "backend error {code}: {message}")
            }
        }
    }
}

impl std::error::Error for RpcError {}

pub type RpcResult<T> = Result<T, RpcError>;

/// Session-scoped RPC capability the controller consumes. One ordered
/// message channel per session; calls may complete out of order relative
/// to each other, never relative to themselves.
///
/// `find_sources` resolves only after every source in the recording has
/// been announced through `BackendEvent::NewSource`.
pub trait ReplayClient: Send + Sync + 'static {
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;

    fn find_sources(&self, session: &SessionId) -> impl Future<Output = RpcResult<()>> + Send;

    fn find_messages(&self, session: &SessionId) -> impl Future<Output = RpcResult<()>> + Send;

    fn get_possible_breakpoints(
        &self,
        session: &SessionId,
        source_id: &SourceId,
        range: Option<(SourceLocation, SourceLocation)>,
    ) -> impl Future<Output = RpcResult<Vec<SameLineSourceLocations>>> + Send;

    fn set_breakpoint(
        &self,
        session: &SessionId,
        location: &Location,
        condition: Option<&str>,
    ) -> impl Future<Output = RpcResult<BreakpointId>> + Send;

    fn remove_breakpoint(
        &self,
        session: &SessionId,
        breakpoint_id: &BreakpointId,
    ) -> impl Future<Output = RpcResult<()>> + Send;

    fn blackbox_source(
        &self,
        session: &SessionId,
        source_id: &SourceId,
        begin: SourceLocation,
        end: SourceLocation,
    ) -> impl Future<Output = RpcResult<()>> + Send;

    fn unblackbox_source(
        &self,
        session: &SessionId,
        source_id: &SourceId,
        begin: SourceLocation,
        end: SourceLocation,
    ) -> impl Future<Output = RpcResult<()>> + Send;

    fn find_resume_target(
        &self,
        session: &SessionId,
        point: &ExecutionPoint,
        command: ResumeCommand,
    ) -> impl Future<Output = RpcResult<PointDescription>> + Send;

    fn create_pause(
        &self,
        session: &SessionId,
        point: &ExecutionPoint,
    ) -> impl Future<Output = RpcResult<PauseId>> + Send;

    fn get_frames(
        &self,
        session: &SessionId,
        pause_id: &PauseId,
    ) -> impl Future<Output = RpcResult<Vec<Frame>>> + Send;

    fn get_frame_steps(
        &self,
        session: &SessionId,
        pause_id: &PauseId,
        frame_id: &FrameId,
    ) -> impl Future<Output = RpcResult<Vec<PointDescription>>> + Send;

    fn get_scopes(
        &self,
        session: &SessionId,
        pause_id: &PauseId,
        frame_id: &FrameId,
    ) -> impl Future<Output = RpcResult<Vec<Scope>>> + Send;

    fn evaluate(
        &self,
        session: &SessionId,
        pause_id: &PauseId,
        frame_id: Option<&FrameId>,
        expression: &str,
    ) -> impl Future<Output = RpcResult<EvalResult>> + Send;

    fn load_document(
        &self,
        session: &SessionId,
        pause_id: &PauseId,
    ) -> impl Future<Output = RpcResult<Value>> + Send;

    fn search_dom(
        &self,
        session: &SessionId,
        pause_id: &PauseId,
        query: &str,
    ) -> impl Future<Output = RpcResult<Vec<Value>>> + Send;

    fn get_mouse_target(
        &self,
        session: &SessionId,
        pause_id: &PauseId,
        x: f64,
        y: f64,
    ) -> impl Future<Output = RpcResult<Option<Value>>> + Send;
}
