//! # NodeDB
//!
//! The catalog of known relays: router contacts on disk and in memory, the
//! whitelist/greylist/greenlist role sets the staking oracle feeds us, and
//! the periodic RC/RID fetch machinery a client uses to keep its view of
//! the network honest.
//!
//! ## Consensus fetching
//!
//! On each refresh round the client asks one `fetch_source` relay for the
//! full RC set, and [`ROUTER_ID_SOURCE_COUNT`] randomly chosen whitelist
//! relays for their router-ID lists. A router ID is considered *active*
//! only when at least [`MIN_RID_FETCHES`] of the sources agree on it; a
//! round with too few useful answers, or whose consensus set is
//! implausibly small, is aborted and retried with fresh sources. After
//! [`MAX_FETCH_ATTEMPTS`] consecutive failures the client falls back to
//! its bootstrap contacts.
//!
//! ## Disk
//!
//! Every RC lives at `<root>/nodedb/<hex[..2]>/<hex>.signed`, written
//! temp-then-rename by the disk worker pool so a crash never leaves a torn
//! record. The in-memory mirror is authoritative; disk I/O is async via
//! the injected [`DiskCaller`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::contact::RouterContact;
use crate::identity::{distance_cmp, RouterId};

/// Number of relays asked for router-ID lists each round.
pub const ROUTER_ID_SOURCE_COUNT: usize = 12;

/// Votes required before a router ID counts as active.
pub const MIN_RID_FETCHES: usize = 8;

/// A source returning fewer router IDs than this is treated as erroring.
pub const MIN_ACTIVE_RIDS: usize = 24;

/// Maximum sources that may fail before the round aborts.
pub const MAX_RID_ERRORS: usize = ROUTER_ID_SOURCE_COUNT - MIN_RID_FETCHES;

/// Consecutive fetch failures tolerated before bootstrap fallback.
pub const MAX_FETCH_ATTEMPTS: u32 = 10;

/// Bootstrap attempts tolerated before starting over.
pub const MAX_BOOTSTRAP_FETCH_ATTEMPTS: u32 = 3;

/// Bootstrap RC request fan-out cap.
pub const BOOTSTRAP_SOURCE_COUNT: usize = 50;

/// Disk flush and refresh cadence.
pub const FLUSH_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// Relays drop RCs not refreshed within this horizon.
pub const RELAY_RC_STALE_MS: u64 = 12 * 60 * 60 * 1000;

/// Clients keep RCs much longer so an offline spell can be survived.
pub const CLIENT_RC_STALE_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Whether this node keeps client or relay semantics for connection policy
/// and RC staleness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Client,
    Relay,
}

/// Executor for disk jobs; the node hands in the blocking pool, tests run
/// jobs inline.
pub type DiskCaller = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// A [`DiskCaller`] that runs jobs on the calling thread.
pub fn inline_disk() -> DiskCaller {
    Arc::new(|job| job())
}

/// Work the owning node must perform for the fetch state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchDirective {
    /// Ask `source` for the full RC set.
    FetchRcs { source: RouterId },
    /// Ask each source for its current router-ID list.
    FetchRids { sources: Vec<RouterId> },
}

#[derive(Default)]
struct FetchState {
    source: Option<RouterId>,
    rid_sources: HashSet<RouterId>,
    fail_sources: HashSet<RouterId>,
    responses: HashMap<RouterId, HashSet<RouterId>>,
    fetch_failures: u32,
    bootstrap_failures: u32,
    using_bootstrap_fallback: bool,
}

/// On-disk + in-memory catalog of router contacts.
pub struct NodeDb {
    root: Option<PathBuf>,
    disk: DiskCaller,
    role: NodeRole,

    known_rcs: HashMap<RouterId, RouterContact>,
    last_update_times: HashMap<RouterId, u64>,

    /// This client's view of which relays are currently active, replaced
    /// atomically by RID consensus rounds.
    active_client_routers: HashSet<RouterId>,

    whitelist: HashSet<RouterId>,
    greylist: HashSet<RouterId>,
    greenlist: HashSet<RouterId>,
    registered: HashSet<RouterId>,

    pinned_edges: HashSet<RouterId>,
    bootstraps: Vec<RouterContact>,

    fetch: FetchState,
    next_flush_ms: u64,
}

impl NodeDb {
    /// A NodeDB rooted at `root`, or purely in-memory when `None`.
    pub fn new(root: Option<PathBuf>, role: NodeRole, disk: DiskCaller) -> Self {
        Self {
            root,
            disk,
            role,
            known_rcs: HashMap::new(),
            last_update_times: HashMap::new(),
            active_client_routers: HashSet::new(),
            whitelist: HashSet::new(),
            greylist: HashSet::new(),
            greenlist: HashSet::new(),
            registered: HashSet::new(),
            pinned_edges: HashSet::new(),
            bootstraps: Vec::new(),
            fetch: FetchState::default(),
            next_flush_ms: 0,
        }
    }

    /// In-memory catalog for tests and tooling.
    pub fn in_memory(role: NodeRole) -> Self {
        Self::new(None, role, inline_disk())
    }

    // ------------------------------------------------------------------
    // Role sets
    // ------------------------------------------------------------------

    /// Install the staking oracle's view. `registered` becomes the union.
    pub fn set_router_whitelist(
        &mut self,
        whitelist: &[RouterId],
        greylist: &[RouterId],
        greenlist: &[RouterId],
    ) {
        self.whitelist = whitelist.iter().copied().collect();
        self.greylist = greylist.iter().copied().collect();
        self.greenlist = greenlist.iter().copied().collect();
        self.registered = self
            .whitelist
            .iter()
            .chain(&self.greylist)
            .chain(&self.greenlist)
            .copied()
            .collect();
        debug!(
            white = self.whitelist.len(),
            grey = self.greylist.len(),
            green = self.greenlist.len(),
            "router role sets updated"
        );
    }

    pub fn whitelist(&self) -> &HashSet<RouterId> {
        &self.whitelist
    }

    pub fn greylist(&self) -> &HashSet<RouterId> {
        &self.greylist
    }

    pub fn registered_routers(&self) -> &HashSet<RouterId> {
        &self.registered
    }

    pub fn active_client_routers(&self) -> &HashSet<RouterId> {
        &self.active_client_routers
    }

    pub fn pinned_edges(&self) -> &HashSet<RouterId> {
        &self.pinned_edges
    }

    pub fn set_pinned_edges(&mut self, edges: HashSet<RouterId>) {
        self.pinned_edges = edges;
    }

    pub fn set_bootstraps(&mut self, bootstraps: Vec<RouterContact>) {
        self.bootstraps = bootstraps;
    }

    pub fn bootstraps(&self) -> &[RouterContact] {
        &self.bootstraps
    }

    // ------------------------------------------------------------------
    // Admission policy
    // ------------------------------------------------------------------

    /// Do we want this relay's RC at all? When the registration oracle has
    /// spoken, only registered identities are admitted.
    pub fn want_rc(&self, id: &RouterId) -> bool {
        if self.registered.is_empty() {
            return true;
        }
        self.registered.contains(id)
    }

    /// Client: with pinned edges only those and bootstraps, otherwise
    /// anyone. Relay: only registered, funded relays.
    pub fn is_connection_allowed(&self, id: &RouterId) -> bool {
        match self.role {
            NodeRole::Client => {
                if self.pinned_edges.is_empty() {
                    return true;
                }
                self.pinned_edges.contains(id)
                    || self.bootstraps.iter().any(|rc| rc.router_id == *id)
            }
            NodeRole::Relay => self.whitelist.contains(id) || self.greylist.contains(id),
        }
    }

    /// Paths are built only through fully serving relays.
    pub fn is_path_allowed(&self, id: &RouterId) -> bool {
        self.whitelist.contains(id)
    }

    /// First hops are additionally constrained by pinned edges.
    pub fn is_first_hop_allowed(&self, id: &RouterId) -> bool {
        if !self.pinned_edges.is_empty() {
            return self.pinned_edges.contains(id);
        }
        self.is_connection_allowed(id)
    }

    // ------------------------------------------------------------------
    // RC storage
    // ------------------------------------------------------------------

    pub fn num_loaded(&self) -> usize {
        self.known_rcs.len()
    }

    pub fn has_rc(&self, id: &RouterId) -> bool {
        self.known_rcs.contains_key(id)
    }

    pub fn get_rc(&self, id: &RouterId) -> Option<&RouterContact> {
        self.known_rcs.get(id)
    }

    /// Visit every known RC.
    pub fn rcs(&self) -> impl Iterator<Item = &RouterContact> {
        self.known_rcs.values()
    }

    /// Put (or replace) the RC if we want it. Returns true if stored.
    pub fn put_rc(&mut self, rc: RouterContact, now_ms: u64) -> bool {
        if !self.want_rc(&rc.router_id) {
            return false;
        }
        self.last_update_times.insert(rc.router_id, now_ms);
        self.known_rcs.insert(rc.router_id, rc);
        true
    }

    /// Put the RC only when strictly newer than what we hold. Never lowers
    /// `last_updated` for an identity.
    pub fn put_rc_if_newer(&mut self, rc: RouterContact, now_ms: u64) -> bool {
        if let Some(existing) = self.known_rcs.get(&rc.router_id) {
            if rc.last_updated <= existing.last_updated {
                return false;
            }
        }
        self.put_rc(rc, now_ms)
    }

    /// Remove from memory and asynchronously from disk.
    pub fn remove_router(&mut self, id: RouterId) {
        self.known_rcs.remove(&id);
        self.last_update_times.remove(&id);
        self.remove_many_from_disk_async([id].into());
    }

    /// Drop RCs older than the role's staleness horizon.
    pub fn remove_stale_rcs(&mut self, now_ms: u64) {
        let horizon = match self.role {
            NodeRole::Relay => RELAY_RC_STALE_MS,
            NodeRole::Client => CLIENT_RC_STALE_MS,
        };
        let stale: HashSet<RouterId> = self
            .known_rcs
            .values()
            .filter(|rc| now_ms.saturating_sub(rc.last_updated) > horizon)
            .map(|rc| rc.router_id)
            .collect();
        if stale.is_empty() {
            return;
        }
        info!(count = stale.len(), "evicting stale router contacts");
        for id in &stale {
            self.known_rcs.remove(id);
            self.last_update_times.remove(id);
        }
        self.remove_many_from_disk_async(stale);
    }

    /// Remove every RC matching `filter`, batching the disk unlinks.
    pub fn remove_if<F: Fn(&RouterContact) -> bool>(&mut self, filter: F) {
        let removed: HashSet<RouterId> = self
            .known_rcs
            .values()
            .filter(|rc| filter(rc))
            .map(|rc| rc.router_id)
            .collect();
        for id in &removed {
            self.known_rcs.remove(id);
            self.last_update_times.remove(id);
        }
        if !removed.is_empty() {
            self.remove_many_from_disk_async(removed);
        }
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// The `k` known RCs closest to `key` in XOR metric space, sorted by
    /// distance ascending, no duplicates.
    pub fn find_many_closest_to(&self, key: &RouterId, k: usize) -> Vec<RouterContact> {
        let mut candidates: Vec<&RouterContact> = self.known_rcs.values().collect();
        candidates.sort_by(|a, b| {
            let da = a.router_id.xor_distance(key);
            let db = b.router_id.xor_distance(key);
            distance_cmp(&da, &db)
        });
        candidates.into_iter().take(k).cloned().collect()
    }

    /// The single closest RC to `key`.
    pub fn find_closest_to(&self, key: &RouterId) -> Option<RouterContact> {
        self.find_many_closest_to(key, 1).into_iter().next()
    }

    /// A uniformly random whitelist member.
    pub fn get_random_whitelist_router(&self) -> Option<RouterId> {
        let ids: Vec<RouterId> = self.whitelist.iter().copied().collect();
        ids.choose(&mut OsRng).copied()
    }

    /// A random known RC satisfying `filter`.
    pub fn get_random_rc_conditional<F: Fn(&RouterContact) -> bool>(
        &self,
        filter: F,
    ) -> Option<RouterContact> {
        let mut candidates: Vec<&RouterContact> = self.known_rcs.values().collect();
        candidates.shuffle(&mut OsRng);
        candidates.into_iter().find(|rc| filter(rc)).cloned()
    }

    // ------------------------------------------------------------------
    // Disk
    // ------------------------------------------------------------------

    fn get_path_by_pubkey(root: &Path, id: &RouterId) -> PathBuf {
        let hex = id.to_hex();
        root.join("nodedb").join(&hex[..2]).join(format!("{}.signed", hex))
    }

    /// Synchronously load every RC under the root. Unreadable or invalid
    /// files are skipped with a warning; an unusable root is fatal.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => return Ok(0),
        };
        let nodedb_dir = root.join("nodedb");
        std::fs::create_dir_all(&nodedb_dir)
            .with_context(|| format!("creating nodedb root {}", nodedb_dir.display()))?;

        let mut loaded = 0usize;
        for entry in std::fs::read_dir(&nodedb_dir)
            .with_context(|| format!("reading nodedb root {}", nodedb_dir.display()))?
        {
            let subdir = entry?.path();
            if !subdir.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(&subdir)? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("signed") {
                    continue;
                }
                let data = match std::fs::read(&path) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(file = %path.display(), error = %err, "unreadable RC file");
                        continue;
                    }
                };
                match RouterContact::decode(&data).map(|rc| (rc.verify().is_ok(), rc)) {
                    Ok((true, rc)) => {
                        let updated = rc.last_updated;
                        if self.put_rc_if_newer(rc, updated) {
                            loaded += 1;
                        }
                    }
                    Ok((false, _)) | Err(_) => {
                        warn!(file = %path.display(), "skipping invalid RC file");
                    }
                }
            }
        }
        info!(loaded, "nodedb loaded from disk");
        Ok(loaded)
    }

    /// Write every RC atomically (write-temp-then-rename) on the disk pool.
    pub fn save_to_disk(&self) {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => return,
        };
        for rc in self.known_rcs.values() {
            let encoded = rc.encode();
            let path = Self::get_path_by_pubkey(&root, &rc.router_id);
            (self.disk)(Box::new(move || {
                if let Err(err) = write_atomic(&path, &encoded) {
                    warn!(file = %path.display(), error = %err, "failed to persist RC");
                }
            }));
        }
    }

    fn remove_many_from_disk_async(&self, ids: HashSet<RouterId>) {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => return,
        };
        (self.disk)(Box::new(move || {
            for id in ids {
                let path = Self::get_path_by_pubkey(&root, &id);
                let _ = std::fs::remove_file(path);
            }
        }));
    }

    // ------------------------------------------------------------------
    // RC/RID fetch state machine
    // ------------------------------------------------------------------

    pub fn fetch_failures(&self) -> u32 {
        self.fetch.fetch_failures
    }

    pub fn fail_sources(&self) -> &HashSet<RouterId> {
        &self.fetch.fail_sources
    }

    pub fn rid_sources(&self) -> &HashSet<RouterId> {
        &self.fetch.rid_sources
    }

    pub fn using_bootstrap_fallback(&self) -> bool {
        self.fetch.using_bootstrap_fallback
    }

    pub fn fetch_source(&self) -> Option<RouterId> {
        self.fetch.source
    }

    /// Choose the relay mediating RC fetches, preferring pinned edges.
    pub fn select_fetch_source(&mut self) {
        let pinned: Vec<RouterId> = self
            .pinned_edges
            .iter()
            .filter(|id| self.whitelist.contains(id))
            .copied()
            .collect();
        self.fetch.source = pinned
            .choose(&mut OsRng)
            .copied()
            .or_else(|| self.get_random_whitelist_router());
    }

    /// Select the router-ID sources for the next round, excluding known
    /// failures.
    pub fn select_router_id_sources(&mut self, excluded: &HashSet<RouterId>) {
        let mut candidates: Vec<RouterId> = self
            .whitelist
            .iter()
            .filter(|id| !excluded.contains(id))
            .copied()
            .collect();
        candidates.shuffle(&mut OsRng);
        self.fetch.rid_sources = candidates
            .into_iter()
            .take(ROUTER_ID_SOURCE_COUNT)
            .collect();
    }

    /// Record one source's answer. `None` (or an implausibly short list)
    /// marks the source as failed.
    pub fn ingest_rid_fetch_responses(
        &mut self,
        source: RouterId,
        ids: Option<HashSet<RouterId>>,
    ) {
        if !self.fetch.rid_sources.contains(&source) {
            return;
        }
        match ids {
            Some(ids) if ids.len() >= MIN_ACTIVE_RIDS => {
                self.fetch.responses.insert(source, ids);
            }
            _ => {
                self.fetch.fail_sources.insert(source);
            }
        }
    }

    /// Conclude a RID round. On consensus the active set is replaced
    /// atomically and counters reset; otherwise the round is aborted,
    /// sources reselected, and `false` returned.
    pub fn process_fetched_rids(&mut self) -> bool {
        let answered = self.fetch.responses.len();
        if answered >= ROUTER_ID_SOURCE_COUNT - MAX_RID_ERRORS {
            let mut votes: HashMap<RouterId, usize> = HashMap::new();
            for ids in self.fetch.responses.values() {
                for id in ids {
                    *votes.entry(*id).or_default() += 1;
                }
            }
            let consensus: HashSet<RouterId> = votes
                .into_iter()
                .filter(|(_, count)| *count >= MIN_RID_FETCHES)
                .map(|(id, _)| id)
                .collect();
            if consensus.len() >= MIN_ACTIVE_RIDS {
                info!(active = consensus.len(), "router ID consensus reached");
                self.active_client_routers = consensus;
                self.fetch.responses.clear();
                self.fetch.fail_sources.clear();
                self.fetch.fetch_failures = 0;
                self.fetch.using_bootstrap_fallback = false;
                return true;
            }
        }

        warn!(
            answered,
            failed = self.fetch.fail_sources.len(),
            "router ID round aborted, reselecting sources"
        );
        self.fetch.fetch_failures += 1;
        self.fetch.responses.clear();
        let excluded = self.fetch.fail_sources.clone();
        self.select_router_id_sources(&excluded);
        if self.fetch.fetch_failures >= MAX_FETCH_ATTEMPTS {
            self.fallback_to_bootstrap();
        }
        false
    }

    /// Ingest a full RC set from `source`. Returns how many were accepted.
    pub fn process_fetched_rcs(
        &mut self,
        source: RouterId,
        rcs: Vec<RouterContact>,
        now_ms: u64,
    ) -> usize {
        let mut accepted = 0;
        for rc in rcs {
            if rc.verify().is_err() {
                debug!(source = %source.short(), "fetched RC fails verification");
                continue;
            }
            if self.put_rc_if_newer(rc, now_ms) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Report the outcome of an RC fetch round.
    pub fn fetch_rcs_result(&mut self, error: bool) {
        if error {
            self.fetch.fetch_failures += 1;
            self.select_fetch_source();
            if self.fetch.fetch_failures >= MAX_FETCH_ATTEMPTS {
                self.fallback_to_bootstrap();
            }
        } else {
            self.fetch.fetch_failures = 0;
            self.fetch.using_bootstrap_fallback = false;
        }
    }

    /// Switch to bootstrap contacts after repeated failures. Bootstrap
    /// attempts are capped separately; past the cap all counters reset and
    /// the whole dance starts over.
    pub fn fallback_to_bootstrap(&mut self) {
        self.fetch.bootstrap_failures += 1;
        if self.fetch.bootstrap_failures > MAX_BOOTSTRAP_FETCH_ATTEMPTS {
            warn!("bootstrap fallback exhausted, resetting fetch state");
            self.fetch = FetchState::default();
            return;
        }
        warn!(
            attempt = self.fetch.bootstrap_failures,
            "falling back to bootstrap for RC fetching"
        );
        self.fetch.using_bootstrap_fallback = true;
        self.fetch.source = self
            .bootstraps
            .iter()
            .take(BOOTSTRAP_SOURCE_COUNT)
            .map(|rc| rc.router_id)
            .collect::<Vec<_>>()
            .choose(&mut OsRng)
            .copied();
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Flush to disk, evict stale records, and (for clients) emit the
    /// fetch work for this refresh cycle.
    pub fn tick(&mut self, now_ms: u64) -> Vec<FetchDirective> {
        if now_ms < self.next_flush_ms {
            return vec![];
        }
        self.next_flush_ms = now_ms + FLUSH_INTERVAL_MS;

        self.remove_stale_rcs(now_ms);
        self.save_to_disk();

        if self.role != NodeRole::Client || self.whitelist.is_empty() {
            return vec![];
        }

        let mut directives = Vec::new();
        if self.fetch.source.is_none() {
            self.select_fetch_source();
        }
        if let Some(source) = self.fetch.source {
            directives.push(FetchDirective::FetchRcs { source });
        }
        let excluded = self.fetch.fail_sources.clone();
        self.select_router_id_sources(&excluded);
        self.fetch.responses.clear();
        if !self.fetch.rid_sources.is_empty() {
            directives.push(FetchDirective::FetchRids {
                sources: self.fetch.rid_sources.iter().copied().collect(),
            });
        }
        directives
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("RC path has no parent"))?;
    std::fs::create_dir_all(parent)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
