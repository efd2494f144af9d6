// Source identity resolution. Many physical sources (generated, original,
// pretty-printed, html, inline) can represent the same logical debugging
// location; this registry groups them into equivalence classes once the
// backend has finished enumerating sources, and applies the preference
// policy that decides which member the debugger shows.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use protocol::{Location, MappedLocation, NewSource, SourceId, SourceKind};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, trace};

use crate::logging::category_sources;
use crate::sync::Latch;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub kind: SourceKind,
    pub url: Option<String>,
    pub generated_source_ids: Vec<SourceId>,
}

/// Result of applying the preference policy to an equivalence class:
/// the source the debugger should use, and the member users may switch
/// to instead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredChoice {
    pub source_id: SourceId,
    pub alternate_id: Option<SourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    NotAGeneratedSource(SourceId),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::NotAGeneratedSource(id) => {
                write!(f, "source {id} is original; only generated sources can be preferred")
            }
        }
    }
}

impl std::error::Error for SourceError {}

#[derive(Default)]
struct RegistryState {
    sources: HashMap<SourceId, SourceInfo>,
    // Registration order, for deterministic grouping and class order.
    order: Vec<SourceId>,
    url_index: HashMap<String, Vec<SourceId>>,
    // Reverse of generated_source_ids: generated id -> original ids.
    original_ids: HashMap<SourceId, Vec<SourceId>>,
    corresponding: HashMap<SourceId, Vec<SourceId>>,
    preferred_generated: HashSet<SourceId>,
    waiters: HashMap<SourceId, Vec<oneshot::Sender<()>>>,
}

pub struct SourceRegistry {
    state: Mutex<RegistryState>,
    all_known: Latch<()>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            all_known: Latch::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("source registry lock poisoned")
    }

    /// Idempotent upsert. Wakes any `ensure_source` waiter blocked on this
    /// id. Sources are never deleted for the life of the session.
    pub fn register_source(&self, source: NewSource) {
        let NewSource {
            source_id,
            kind,
            url,
            generated_source_ids,
        } = source;

        let mut state = self.state();
        if !state.sources.contains_key(&source_id) {
            state.order.push(source_id.clone());
            if let Some(url) = &url {
                state
                    .url_index
                    .entry(url.clone())
                    .or_default()
                    .push(source_id.clone());
            }
            for generated in &generated_source_ids {
                state
                    .original_ids
                    .entry(generated.clone())
                    .or_default()
                    .push(source_id.clone());
            }
        }
        state.sources.insert(
            source_id.clone(),
            SourceInfo {
                kind,
                url,
                generated_source_ids,
            },
        );
        if let Some(waiters) = state.waiters.remove(&source_id) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        trace!("{} registered {source_id}", category_sources());
    }

    pub fn source_info(&self, id: &SourceId) -> Option<SourceInfo> {
        self.state().sources.get(id).cloned()
    }

    pub fn source_kind(&self, id: &SourceId) -> Option<SourceKind> {
        self.state().sources.get(id).map(|info| info.kind)
    }

    pub fn source_url(&self, id: &SourceId) -> Option<String> {
        self.state().sources.get(id).and_then(|info| info.url.clone())
    }

    /// Awaits registration of a specific source id.
    pub async fn ensure_source(&self, id: &SourceId) -> SourceInfo {
        let rx = {
            let mut state = self.state();
            if let Some(info) = state.sources.get(id) {
                return info.clone();
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(id.clone()).or_default().push(tx);
            rx
        };
        let _ = rx.await;
        self.state()
            .sources
            .get(id)
            .cloned()
            .expect("source waiter woken without a registration")
    }

    /// Barrier that opens once the backend has reported the complete
    /// source enumeration and grouping has run.
    pub async fn all_sources_known(&self) {
        self.all_known.wait().await;
    }

    pub fn is_all_known(&self) -> bool {
        self.all_known.is_open()
    }

    /// Runs equivalence grouping and opens the all-sources-known barrier.
    /// Returns one `NewSource` per equivalence class (its first member in
    /// registration order), for discovery events.
    pub fn mark_all_sources_known(&self) -> Vec<NewSource> {
        let representatives = {
            let mut state = self.state();
            state.group_sources();
            state.class_representatives()
        };
        self.all_known.open(());
        info!(
            "{} enumeration complete: {} sources in {} classes",
            category_sources(),
            self.state().order.len(),
            representatives.len(),
        );
        representatives
    }

    /// The full equivalence class containing `id`. Only meaningful after
    /// the all-sources-known barrier; unknown ids fail soft as `[id]`.
    pub fn corresponding_source_ids(&self, id: &SourceId) -> Vec<SourceId> {
        assert!(
            self.all_known.is_open(),
            "corresponding sources queried before enumeration finished"
        );
        self.state()
            .corresponding
            .get(id)
            .cloned()
            .unwrap_or_else(|| vec![id.clone()])
    }

    /// First member of `id`'s equivalence class, the canonical id used in
    /// outgoing locations.
    pub fn canonical_source_id(&self, id: &SourceId) -> SourceId {
        self.state().canonical(id)
    }

    /// Applies the preference policy to a set of sources representing the
    /// same logical location.
    pub fn preferred_source(&self, ids: &[SourceId]) -> PreferredChoice {
        self.state().choose(ids)
    }

    /// PrettyPrinted unwraps to the kind of the minified source it was
    /// printed from; every other kind is its own effective kind.
    pub fn resolve_effective_kind(&self, id: &SourceId) -> Option<SourceKind> {
        self.state().effective_kind(id)
    }

    /// Whether `id` is a minified source shadowed by a pretty-printed
    /// counterpart.
    pub fn is_minified_source(&self, id: &SourceId) -> bool {
        self.state().is_minified(id)
    }

    pub fn is_original_source(&self, id: &SourceId) -> bool {
        self.state().effective_kind(id) == Some(SourceKind::SourceMapped)
    }

    /// Per-session override: prefer the generated member of `id`'s class
    /// over the original one. Rejected for sources that are themselves
    /// original.
    pub fn set_preferred_generated_source(
        &self,
        id: &SourceId,
        enabled: bool,
    ) -> Result<(), SourceError> {
        let mut state = self.state();
        if state.effective_kind(id) == Some(SourceKind::SourceMapped) {
            return Err(SourceError::NotAGeneratedSource(id.clone()));
        }
        if enabled {
            state.preferred_generated.insert(id.clone());
        } else {
            state.preferred_generated.remove(id);
        }
        Ok(())
    }

    /// Source ids registered under `url`, dropping ids whose original
    /// counterpart shares the URL (the inline scripts of an HTML page,
    /// superseded by the page's own listing).
    pub fn source_ids_for_url(&self, url: &str) -> Vec<SourceId> {
        let state = self.state();
        let ids = state.url_index.get(url).cloned().unwrap_or_default();
        ids.iter()
            .filter(|id| {
                state
                    .original_ids
                    .get(*id)
                    .is_none_or(|originals| originals.iter().all(|original| !ids.contains(original)))
            })
            .cloned()
            .collect()
    }

    /// Mirror image of `source_ids_for_url`: drops ids whose generated
    /// counterpart shares the URL.
    pub fn generated_source_ids_for_url(&self, url: &str) -> Vec<SourceId> {
        let state = self.state();
        let ids = state.url_index.get(url).cloned().unwrap_or_default();
        ids.iter()
            .filter(|id| {
                state.sources.get(*id).is_none_or(|info| {
                    info.generated_source_ids
                        .iter()
                        .all(|generated| !ids.contains(generated))
                })
            })
            .cloned()
            .collect()
    }

    /// Partition the sources registered under `url` into equivalence
    /// classes and choose once per class.
    pub fn chosen_sources_for_url(&self, url: &str) -> Vec<PreferredChoice> {
        let mut remaining = self.source_ids_for_url(url);
        let state = self.state();
        let mut chosen = Vec::new();
        while let Some(head) = remaining.first().cloned() {
            let class = state
                .corresponding
                .get(&head)
                .cloned()
                .unwrap_or_else(|| vec![head.clone()]);
            let mut group: Vec<SourceId> = class
                .iter()
                .filter(|member| remaining.contains(member))
                .cloned()
                .collect();
            if group.is_empty() {
                group.push(head.clone());
            }
            chosen.push(state.choose(&group));
            remaining.retain(|id| !group.contains(id));
        }
        chosen
    }

    /// The location the debugger should display out of a mapped location.
    pub fn preferred_location(&self, mapped: &MappedLocation) -> Option<Location> {
        if mapped.is_empty() {
            return None;
        }
        let ids: Vec<SourceId> = mapped.iter().map(|l| l.source_id.clone()).collect();
        let choice = self.preferred_source(&ids);
        let location = mapped
            .iter()
            .find(|l| l.source_id == choice.source_id)
            .expect("preferred source must be drawn from the mapped location");
        Some(location.clone())
    }

    /// The non-chosen member users may switch to, if the class has one.
    pub fn alternate_location(&self, mapped: &MappedLocation) -> Option<Location> {
        if mapped.is_empty() {
            return None;
        }
        let ids: Vec<SourceId> = mapped.iter().map(|l| l.source_id.clone()).collect();
        let choice = self.preferred_source(&ids);
        let alternate = choice.alternate_id?;
        mapped.iter().find(|l| l.source_id == alternate).cloned()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryState {
    fn canonical(&self, id: &SourceId) -> SourceId {
        self.corresponding
            .get(id)
            .and_then(|class| class.first())
            .cloned()
            .unwrap_or_else(|| id.clone())
    }

    fn is_minified(&self, id: &SourceId) -> bool {
        self.original_ids.get(id).is_some_and(|originals| {
            originals.iter().any(|original| {
                self.sources
                    .get(original)
                    .is_some_and(|info| info.kind == SourceKind::PrettyPrinted)
            })
        })
    }

    fn effective_kind(&self, id: &SourceId) -> Option<SourceKind> {
        let info = self.sources.get(id)?;
        if info.kind != SourceKind::PrettyPrinted {
            return Some(info.kind);
        }
        let minified = info
            .generated_source_ids
            .first()
            .and_then(|generated| self.sources.get(generated))?;
        assert!(
            minified.kind != SourceKind::PrettyPrinted,
            "pretty-printed source {id} prints another pretty-printed source"
        );
        Some(minified.kind)
    }

    fn choose(&self, ids: &[SourceId]) -> PreferredChoice {
        let mut ids: Vec<SourceId> = ids.to_vec();

        // An HTML document's own listing supersedes its inline scripts.
        if ids
            .iter()
            .any(|id| self.sources.get(id).map(|info| info.kind) == Some(SourceKind::Html))
        {
            ids.retain(|id| {
                self.sources.get(id).map(|info| info.kind) != Some(SourceKind::InlineScript)
            });
        }

        // Minified sources are shown through their pretty-printed twins.
        ids.retain(|id| !self.is_minified(id));

        let mut generated: Option<SourceId> = None;
        let mut original: Option<SourceId> = None;
        for id in &ids {
            let Some(kind) = self.effective_kind(id) else {
                // Enumeration still in flight; fail soft with this member.
                return PreferredChoice {
                    source_id: id.clone(),
                    alternate_id: None,
                };
            };
            if kind == SourceKind::SourceMapped {
                assert!(
                    original.is_none(),
                    "equivalence class contains two original sources: {original:?} and {id}"
                );
                original = Some(id.clone());
            } else {
                assert!(
                    generated.is_none(),
                    "equivalence class contains two generated sources: {generated:?} and {id}"
                );
                generated = Some(id.clone());
            }
        }

        match (generated, original) {
            (Some(generated), None) => PreferredChoice {
                source_id: generated,
                alternate_id: None,
            },
            (None, Some(original)) => PreferredChoice {
                source_id: original,
                alternate_id: None,
            },
            (Some(generated), Some(original)) => {
                if self.preferred_generated.contains(&generated) {
                    PreferredChoice {
                        source_id: generated,
                        alternate_id: Some(original),
                    }
                } else {
                    PreferredChoice {
                        source_id: original,
                        alternate_id: Some(generated),
                    }
                }
            }
            (None, None) => panic!("cannot choose a preferred source from an empty class"),
        }
    }

    // Union each source's generated/original links transitively; sources
    // without a URL form singleton classes. Runs once, at the barrier.
    fn group_sources(&mut self) {
        let order = self.order.clone();
        let index: HashMap<&SourceId, usize> =
            order.iter().enumerate().map(|(i, id)| (id, i)).collect();

        for id in &order {
            if self.corresponding.contains_key(id) {
                continue;
            }
            let info = self
                .sources
                .get(id)
                .expect("ordered source id must be registered");
            if info.url.is_none() {
                self.corresponding.insert(id.clone(), vec![id.clone()]);
                continue;
            }

            let mut members: Vec<SourceId> = Vec::new();
            let mut worklist = vec![id.clone()];
            while let Some(next) = worklist.pop() {
                if members.contains(&next) {
                    continue;
                }
                let Some(next_info) = self.sources.get(&next) else {
                    panic!("source {next} is linked but was never registered");
                };
                if next_info.url.is_none() {
                    // Stays a singleton; handled by its own pass.
                    continue;
                }
                members.push(next.clone());
                worklist.extend(next_info.generated_source_ids.iter().cloned());
                if let Some(originals) = self.original_ids.get(&next) {
                    worklist.extend(originals.iter().cloned());
                }
            }
            members.sort_by_key(|member| index[member]);
            for member in &members {
                self.corresponding.insert(member.clone(), members.clone());
            }
        }
    }

    fn class_representatives(&self) -> Vec<NewSource> {
        self.order
            .iter()
            .filter(|id| self.canonical(id) == **id)
            .map(|id| {
                let info = self
                    .sources
                    .get(id)
                    .expect("ordered source id must be registered");
                NewSource {
                    source_id: id.clone(),
                    kind: info.kind,
                    url: info.url.clone(),
                    generated_source_ids: info.generated_source_ids.clone(),
                }
            })
            .collect()
    }
}
