// Breakpoint bookkeeping. A logical breakpoint at (line, column) is
// installed against every source in the location's equivalence class, so
// stepping behaves the same whichever member the user is looking at.
// Installation and removal are invalidating operations for the
// resume-target cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::{
    BreakpointId, Location, ReplayClient, RpcError, RpcResult, SameLineSourceLocations, SourceId,
    SourceLocation,
};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::logging::category_break;
use crate::session::Session;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRecord {
    pub location: Location,
    pub condition: Option<String>,
}

pub(crate) struct BreakpointRegistry {
    records: Mutex<HashMap<BreakpointId, BreakpointRecord>>,
    positions: Mutex<HashMap<SourceId, Arc<OnceCell<Vec<SameLineSourceLocations>>>>>,
}

impl BreakpointRegistry {
    pub(crate) fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<BreakpointId, BreakpointRecord>> {
        self.records.lock().expect("breakpoint records lock poisoned")
    }

    fn insert(&self, breakpoint_id: BreakpointId, record: BreakpointRecord) {
        self.records().insert(breakpoint_id, record);
    }

    // Removes every record matching any of `source_ids` at (line, column)
    // and returns their backend ids, for the removal RPCs.
    fn remove_matching(&self, source_ids: &[SourceId], line: u32, column: u32) -> Vec<BreakpointId> {
        let mut records = self.records();
        let matching: Vec<BreakpointId> = records
            .iter()
            .filter(|(_, record)| {
                record.location.line == line
                    && record.location.column == column
                    && source_ids.contains(&record.location.source_id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &matching {
            records.remove(id);
        }
        matching
    }

    fn snapshot(&self) -> Vec<(BreakpointId, BreakpointRecord)> {
        self.records()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    fn positions_cell(&self, source_id: &SourceId) -> Arc<OnceCell<Vec<SameLineSourceLocations>>> {
        self.positions
            .lock()
            .expect("breakpoint positions lock poisoned")
            .entry(source_id.clone())
            .or_default()
            .clone()
    }
}

// A location invalid for one corresponding source of a shared-URL
// document is expected (the registry does not know which locations are
// valid per inline source), so protocol failures stay at debug level;
// transport failures are surfaced in the log but still swallowed.
fn log_swallowed(source_id: &SourceId, action: &str, err: &RpcError) {
    match err {
        RpcError::Protocol { .. } => {
            debug!("{} {action} skipped for {source_id}: {err}", category_break());
        }
        RpcError::Transport(_) => {
            warn!("{} {action} failed for {source_id}: {err}", category_break());
        }
    }
}

impl<C: ReplayClient> Session<C> {
    /// Possible breakpoint positions for a whole source, memoized: one
    /// backend query per source for the life of the session.
    pub async fn breakpoint_positions(
        &self,
        source_id: &SourceId,
    ) -> RpcResult<Vec<SameLineSourceLocations>> {
        let session_id = self.require_session_id();
        let cell = self.breakpoints.positions_cell(source_id);
        let positions = cell
            .get_or_try_init(|| {
                self.client
                    .get_possible_breakpoints(&session_id, source_id, None)
            })
            .await?;
        Ok(positions.clone())
    }

    /// Range-limited position query; bypasses the whole-source memo.
    pub async fn breakpoint_positions_in_range(
        &self,
        source_id: &SourceId,
        begin: SourceLocation,
        end: SourceLocation,
    ) -> RpcResult<Vec<SameLineSourceLocations>> {
        let session_id = self.require_session_id();
        self.client
            .get_possible_breakpoints(&session_id, source_id, Some((begin, end)))
            .await
    }

    /// Installs a breakpoint against every source corresponding to
    /// `source_id`. Per-source failures are swallowed; the logical
    /// breakpoint exists as long as any member accepted it.
    pub async fn set_breakpoint(
        self: &Arc<Self>,
        source_id: &SourceId,
        line: u32,
        column: u32,
        condition: Option<String>,
    ) {
        self.sources().all_sources_known().await;
        let session_id = self.require_session_id();
        let source_ids = self.sources().corresponding_source_ids(source_id);

        let txn = self.resume_targets.begin_invalidation();
        for id in &source_ids {
            if let Err(err) = self.breakpoint_positions(id).await {
                log_swallowed(id, "position lookup", &err);
                continue;
            }
            let location = Location {
                source_id: id.clone(),
                line,
                column,
            };
            match self
                .client
                .set_breakpoint(&session_id, &location, condition.as_deref())
                .await
            {
                Ok(breakpoint_id) => {
                    debug!("{} installed {breakpoint_id} at {id}:{line}:{column}", category_break());
                    self.breakpoints.insert(
                        breakpoint_id,
                        BreakpointRecord {
                            location,
                            condition: condition.clone(),
                        },
                    );
                }
                Err(err) => log_swallowed(id, "install", &err),
            }
        }
        if txn.finish() {
            self.spawn_precache();
        }
    }

    /// Removes every installed breakpoint matching (line, column) in the
    /// equivalence class of `source_id`. Local records go away
    /// immediately; the backend removals follow inside the invalidation.
    pub async fn remove_breakpoint(self: &Arc<Self>, source_id: &SourceId, line: u32, column: u32) {
        self.sources().all_sources_known().await;
        let session_id = self.require_session_id();
        let source_ids = self.sources().corresponding_source_ids(source_id);
        let removed = self.breakpoints.remove_matching(&source_ids, line, column);
        if removed.is_empty() {
            return;
        }

        let txn = self.resume_targets.begin_invalidation();
        for breakpoint_id in &removed {
            debug!("{} removing {breakpoint_id}", category_break());
            if let Err(err) = self.client.remove_breakpoint(&session_id, breakpoint_id).await {
                log_swallowed(source_id, "removal", &err);
            }
        }
        if txn.finish() {
            self.spawn_precache();
        }
    }

    /// URL-keyed install: one logical breakpoint per equivalence class
    /// registered under the URL.
    pub async fn set_breakpoint_by_url(
        self: &Arc<Self>,
        url: &str,
        line: u32,
        column: u32,
        condition: Option<String>,
    ) {
        self.sources().all_sources_known().await;
        for choice in self.sources().chosen_sources_for_url(url) {
            self.set_breakpoint(&choice.source_id, line, column, condition.clone())
                .await;
        }
    }

    pub async fn remove_breakpoint_by_url(self: &Arc<Self>, url: &str, line: u32, column: u32) {
        self.sources().all_sources_known().await;
        for choice in self.sources().chosen_sources_for_url(url) {
            self.remove_breakpoint(&choice.source_id, line, column).await;
        }
    }

    /// Excludes a source range from stepping. Invalidates cached resume
    /// targets like any other stepping-behavior change.
    pub async fn blackbox_source(
        self: &Arc<Self>,
        source_id: &SourceId,
        begin: SourceLocation,
        end: SourceLocation,
    ) -> RpcResult<()> {
        let session_id = self.require_session_id();
        let txn = self.resume_targets.begin_invalidation();
        let result = self
            .client
            .blackbox_source(&session_id, source_id, begin, end)
            .await;
        if txn.finish() {
            self.spawn_precache();
        }
        result
    }

    pub async fn unblackbox_source(
        self: &Arc<Self>,
        source_id: &SourceId,
        begin: SourceLocation,
        end: SourceLocation,
    ) -> RpcResult<()> {
        let session_id = self.require_session_id();
        let txn = self.resume_targets.begin_invalidation();
        let result = self
            .client
            .unblackbox_source(&session_id, source_id, begin, end)
            .await;
        if txn.finish() {
            self.spawn_precache();
        }
        result
    }

    /// Snapshot of every breakpoint currently installed on the backend.
    pub fn installed_breakpoints(&self) -> Vec<(BreakpointId, BreakpointRecord)> {
        self.breakpoints.snapshot()
    }
}
