mod breakpoints;
mod events;
mod logging;
mod pauses;
mod resume_targets;
mod session;
mod sources;
mod sync;

pub use protocol::{
    BackendEvent, BreakpointId, EvalResult, ExecutionPoint, Frame, FrameId, LoadedRegions,
    Location, MappedLocation, Message, NewSource, PauseId, PointDescription, ReplayClient,
    ResumeCommand, RpcError, RpcResult, SameLineSourceLocations, Scope, SessionId, SourceId,
    SourceKind, SourceLocation, TimeRange,
};

pub use breakpoints::BreakpointRecord;
pub use events::SessionEvent;
pub use logging::init as init_logging;
pub use pauses::Pause;
pub use session::{CursorToken, Session, SessionConfig, WarpTarget};
pub use sources::{PreferredChoice, SourceError, SourceInfo, SourceRegistry};
pub use sync::Latch;
