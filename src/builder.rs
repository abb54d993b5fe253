//! # Path Handler and Builder
//!
//! The [`PathHandler`] owns every path this node has built: it picks hop
//! sequences against the NodeDB's role sets, rate-limits builds per first
//! hop with a decaying [`BuildLimiter`], drives per-path timers, records
//! [`BuildStats`], and backs off exponentially when builds fail.
//!
//! Selection rules for a hop sequence: the first hop must satisfy the
//! pinned-edge policy, every hop must be path-allowed (whitelist), no
//! relay appears twice, nothing from the blacklist, and the last hop is
//! the requested destination when one is given.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::contact::RouterContact;
use crate::crypto::SymmNonce;
use crate::identity::RouterId;
use crate::messages::{Envelope, HopId, LinkFrame, WireError};
use crate::nodedb::NodeDb;
use crate::path::{BuildOutcome, ControlResponse, Path, PathInbound, PathStatus};
use crate::transit::status;

/// Hard cap on live paths per handler.
pub const MAX_PATHS: usize = 32;

/// Soft limit between builds through the same first hop.
pub const MIN_PATH_BUILD_INTERVAL_MS: u64 = 500;

/// Base pacing between any two builds.
pub const PATH_BUILD_RATE_MS: u64 = 100;

/// Ceiling for the failure backoff.
pub const MAX_BUILD_INTERVAL_MS: u64 = 30_000;

// ============================================================================
// BuildLimiter
// ============================================================================

/// Decaying set keyed by first-hop router, preventing build storms through
/// one edge.
#[derive(Default)]
pub struct BuildLimiter {
    entries: HashMap<RouterId, u64>,
    ttl_ms: u64,
}

impl BuildLimiter {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms: MIN_PATH_BUILD_INTERVAL_MS,
        }
    }

    /// Attempt a build through `router`: false if currently limited,
    /// otherwise records the attempt and allows it.
    pub fn attempt(&mut self, router: &RouterId, now_ms: u64) -> bool {
        if self.entries.contains_key(router) {
            return false;
        }
        self.entries.insert(*router, now_ms);
        true
    }

    /// Drop entries whose TTL has elapsed.
    pub fn decay(&mut self, now_ms: u64) {
        let ttl = self.ttl_ms;
        self.entries
            .retain(|_, inserted| now_ms.saturating_sub(*inserted) < ttl);
    }

    /// Query without mutating.
    pub fn limited(&self, router: &RouterId) -> bool {
        self.entries.contains_key(router)
    }
}

// ============================================================================
// BuildStats
// ============================================================================

/// Counters over all builds of one handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub attempts: u64,
    pub success: u64,
    /// Builds that failed with an explicit status.
    pub build_fails: u64,
    /// Established paths that later died.
    pub path_fails: u64,
    /// Builds that never got an answer.
    pub timeouts: u64,
}

impl BuildStats {
    /// Below this ratio something is systematically wrong.
    pub const MIN_GOOD_RATIO: f64 = 0.25;

    pub fn success_ratio(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.success as f64 / self.attempts as f64
    }
}

impl std::fmt::Display for BuildStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempts={} success={} build_fails={} path_fails={} timeouts={}",
            self.attempts, self.success, self.build_fails, self.path_fails, self.timeouts
        )
    }
}

/// Error type for a refused build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// Global build pacing has not elapsed.
    Cooldown,
    /// The first hop is rate-limited.
    EdgeLimited,
    /// No hop sequence satisfies the constraints.
    NoHops,
    /// The handler is at [`MAX_PATHS`].
    TooManyPaths,
    /// Frame construction failed.
    Wire(WireError),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Cooldown => write!(f, "build cooldown in effect"),
            BuildError::EdgeLimited => write!(f, "first hop is rate-limited"),
            BuildError::NoHops => write!(f, "no eligible hop sequence"),
            BuildError::TooManyPaths => write!(f, "path cap reached"),
            BuildError::Wire(err) => write!(f, "build frame: {}", err),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<WireError> for BuildError {
    fn from(err: WireError) -> Self {
        BuildError::Wire(err)
    }
}

// ============================================================================
// PathHandler
// ============================================================================

/// Owner of this node's client paths.
pub struct PathHandler {
    pub num_paths_desired: usize,
    pub num_hops: usize,
    pub snode_blacklist: BTreeSet<RouterId>,

    /// Live paths keyed by their pivot router.
    paths: HashMap<RouterId, Path>,
    /// Inbound envelope routing: first-hop downstream id to pivot key.
    path_lookup: HashMap<HopId, RouterId>,

    limiter: BuildLimiter,
    stats: BuildStats,
    last_build_ms: u64,
    build_interval_limit_ms: u64,
}

impl PathHandler {
    pub fn new(num_paths_desired: usize, num_hops: usize) -> Self {
        Self {
            num_paths_desired: num_paths_desired.min(MAX_PATHS),
            num_hops,
            snode_blacklist: BTreeSet::new(),
            paths: HashMap::new(),
            path_lookup: HashMap::new(),
            limiter: BuildLimiter::new(),
            stats: BuildStats::default(),
            last_build_ms: 0,
            build_interval_limit_ms: PATH_BUILD_RATE_MS,
        }
    }

    pub fn num_paths(&self) -> usize {
        self.paths.len()
    }

    pub fn build_stats(&self) -> BuildStats {
        self.stats
    }

    pub fn limiter(&self) -> &BuildLimiter {
        &self.limiter
    }

    pub fn blacklist_snode(&mut self, id: RouterId) {
        self.snode_blacklist.insert(id);
    }

    pub fn get_path(&self, pivot: &RouterId) -> Option<&Path> {
        self.paths.get(pivot)
    }

    pub fn get_path_mut(&mut self, pivot: &RouterId) -> Option<&mut Path> {
        self.paths.get_mut(pivot)
    }

    pub fn get_path_by_hop(&self, hop_id: &HopId) -> Option<&Path> {
        self.path_lookup
            .get(hop_id)
            .and_then(|pivot| self.paths.get(pivot))
    }

    /// A random established, ready path.
    pub fn get_ready_path(&self, now_ms: u64) -> Option<&Path> {
        self.paths.values().find(|path| path.is_ready(now_ms))
    }

    pub fn for_each_path<F: FnMut(&Path)>(&self, mut visit: F) {
        for path in self.paths.values() {
            visit(path);
        }
    }

    /// True while the global pacing interval has not elapsed.
    pub fn build_cooldown(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_build_ms) < self.build_interval_limit_ms
    }

    pub fn should_build_more(&self, now_ms: u64) -> bool {
        self.paths.len() < self.num_paths_desired && !self.build_cooldown(now_ms)
    }

    // ------------------------------------------------------------------
    // Hop selection
    // ------------------------------------------------------------------

    /// Pick a first hop: pinned-edge policy, whitelist, not blacklisted,
    /// not excluded, not rate-limited.
    pub fn select_first_hop(
        &self,
        db: &NodeDb,
        exclude: &HashSet<RouterId>,
    ) -> Option<RouterContact> {
        db.get_random_rc_conditional(|rc| {
            let id = &rc.router_id;
            db.is_first_hop_allowed(id)
                && db.is_path_allowed(id)
                && !self.snode_blacklist.contains(id)
                && !exclude.contains(id)
                && !self.limiter.limited(id)
        })
    }

    /// Select `num_hops` distinct relays, ending at `dest` when given.
    pub fn aligned_hops_to_remote(
        &self,
        db: &NodeDb,
        dest: Option<&RouterId>,
        exclude: &HashSet<RouterId>,
    ) -> Option<Vec<RouterContact>> {
        let mut used: HashSet<RouterId> = exclude.clone();

        let terminal = match dest {
            Some(dest) => {
                let rc = db.get_rc(dest)?.clone();
                if !db.is_path_allowed(dest)
                    || self.snode_blacklist.contains(dest)
                    || used.contains(dest)
                {
                    return None;
                }
                used.insert(*dest);
                Some(rc)
            }
            None => None,
        };

        if self.num_hops == 1 {
            return match terminal {
                Some(rc) if db.is_first_hop_allowed(&rc.router_id) => Some(vec![rc]),
                Some(_) => None,
                None => self.select_first_hop(db, &used).map(|rc| vec![rc]),
            };
        }

        let first = self.select_first_hop(db, &used)?;
        used.insert(first.router_id);
        let mut hops = vec![first];

        let middle_target = self.num_hops - 1 - usize::from(terminal.is_some());
        for _ in 0..middle_target {
            let hop = db.get_random_rc_conditional(|rc| {
                let id = &rc.router_id;
                db.is_path_allowed(id)
                    && !self.snode_blacklist.contains(id)
                    && !used.contains(id)
            })?;
            used.insert(hop.router_id);
            hops.push(hop);
        }
        if let Some(rc) = terminal {
            hops.push(rc);
        }
        debug_assert_eq!(hops.len(), self.num_hops);
        Some(hops)
    }

    // ------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------

    /// Build a path over an explicit hop sequence. Returns the frame to
    /// send to the first hop.
    pub fn build(
        &mut self,
        rcs: Vec<RouterContact>,
        now_ms: u64,
    ) -> Result<(RouterId, LinkFrame), BuildError> {
        if self.paths.len() >= MAX_PATHS {
            return Err(BuildError::TooManyPaths);
        }
        let first = rcs.first().ok_or(BuildError::NoHops)?.router_id;
        if !self.limiter.attempt(&first, now_ms) {
            return Err(BuildError::EdgeLimited);
        }

        let path = Path::new(rcs, now_ms).map_err(BuildError::Wire)?;
        let frame = path.build_frame()?;
        info!(
            path = %path.short_name(),
            hops = %path.hops_string(),
            "building path"
        );

        self.stats.attempts += 1;
        self.last_build_ms = now_ms;
        let pivot = path.pivot_router();
        if self.paths.contains_key(&pivot) {
            self.remove_path(&pivot);
        }
        self.path_lookup.insert(path.upstream_id(), pivot);
        self.paths.insert(pivot, path);
        Ok(frame)
    }

    /// Build up to `n` new paths toward nowhere in particular.
    pub fn build_more(
        &mut self,
        db: &NodeDb,
        n: usize,
        now_ms: u64,
    ) -> Vec<(RouterId, LinkFrame)> {
        let mut frames = Vec::new();
        for _ in 0..n {
            if self.build_cooldown(now_ms) {
                break;
            }
            let exclude: HashSet<RouterId> = self.paths.keys().copied().collect();
            let hops = match self.aligned_hops_to_remote(db, None, &exclude) {
                Some(hops) => hops,
                None => {
                    debug!("no eligible hop sequence for build");
                    break;
                }
            };
            match self.build(hops, now_ms) {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    debug!(error = %err, "build refused");
                    break;
                }
            }
        }
        frames
    }

    /// Build a path whose pivot is `remote`.
    pub fn build_path_aligned_to_remote(
        &mut self,
        db: &NodeDb,
        remote: &RouterId,
        now_ms: u64,
    ) -> Result<(RouterId, LinkFrame), BuildError> {
        let hops = self
            .aligned_hops_to_remote(db, Some(remote), &HashSet::new())
            .ok_or(BuildError::NoHops)?;
        self.build(hops, now_ms)
    }

    /// Tear down and rebuild over the same relays with fresh IDs and keys.
    /// Pending callbacks of the old path all error out.
    pub fn rebuild(
        &mut self,
        pivot: &RouterId,
        now_ms: u64,
    ) -> Result<(RouterId, LinkFrame), BuildError> {
        let old = self.paths.get(pivot).ok_or(BuildError::NoHops)?;
        let rcs = old.hop_contacts();
        info!(path = %old.short_name(), "rebuilding path over the same hops");
        self.remove_path(pivot);

        // an explicit rebuild bypasses the per-edge limiter
        let path = Path::new(rcs, now_ms).map_err(BuildError::Wire)?;
        let frame = path.build_frame()?;
        self.stats.attempts += 1;
        self.last_build_ms = now_ms;
        let new_pivot = path.pivot_router();
        self.path_lookup.insert(path.upstream_id(), new_pivot);
        self.paths.insert(new_pivot, path);
        Ok(frame)
    }

    fn remove_path(&mut self, pivot: &RouterId) -> bool {
        match self.paths.remove(pivot) {
            Some(mut path) => {
                self.path_lookup.remove(&path.upstream_id());
                path.drain_pending(ControlResponse::Error);
                true
            }
            None => false,
        }
    }

    /// Drop a path outright, erroring its callbacks.
    pub fn drop_path(&mut self, pivot: &RouterId) {
        self.remove_path(pivot);
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Route a build status frame to its path and account the outcome.
    pub fn handle_status_frame(
        &mut self,
        path_id: HopId,
        bits: u64,
        nonce: SymmNonce,
        payload: Vec<u8>,
        now_ms: u64,
    ) -> Option<BuildOutcome> {
        let pivot = *self.path_lookup.get(&path_id)?;
        let path = self.paths.get_mut(&pivot)?;
        let outcome = path.handle_build_status(bits, nonce, payload, now_ms);
        match &outcome {
            BuildOutcome::Established => {
                self.stats.success += 1;
                self.build_interval_limit_ms = PATH_BUILD_RATE_MS;
                self.path_build_succeeded(&pivot);
            }
            BuildOutcome::Failed(bits) => {
                if bits & status::FAIL_TIMEOUT != 0 {
                    self.stats.timeouts += 1;
                } else {
                    self.stats.build_fails += 1;
                }
                self.path_build_backoff();
                self.remove_path(&pivot);
            }
        }
        Some(outcome)
    }

    /// Route an inbound traffic envelope to its path.
    pub fn handle_traffic(&mut self, envelope: Envelope, now_ms: u64) -> Option<PathInbound> {
        let pivot = *self.path_lookup.get(&envelope.hop_id)?;
        let path = self.paths.get_mut(&pivot)?;
        Some(path.handle_inbound(envelope, now_ms))
    }

    fn path_build_succeeded(&self, pivot: &RouterId) {
        info!(pivot = %pivot.short(), stats = %self.stats, "path build succeeded");
    }

    /// Exponential backoff on failed builds, capped.
    fn path_build_backoff(&mut self) {
        self.build_interval_limit_ms =
            (self.build_interval_limit_ms * 2).min(MAX_BUILD_INTERVAL_MS);
        warn!(
            interval_ms = self.build_interval_limit_ms,
            "path build backoff increased"
        );
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Drive every path's timers, expire the dead, and top the pool back
    /// up. Returns frames to transmit.
    pub fn tick(&mut self, db: &NodeDb, now_ms: u64) -> Vec<(RouterId, LinkFrame)> {
        self.limiter.decay(now_ms);

        let mut frames = Vec::new();
        for path in self.paths.values_mut() {
            frames.extend(path.tick(now_ms));
        }

        let expired: Vec<RouterId> = self
            .paths
            .iter()
            .filter(|(_, path)| path.is_expired(now_ms))
            .map(|(pivot, _)| *pivot)
            .collect();
        for pivot in expired {
            let (was_established, was_failed, ran_full_term, name) = {
                let path = &self.paths[&pivot];
                (
                    path.ever_established(),
                    path.status() == PathStatus::Failed,
                    now_ms >= path.expires_at_ms,
                    path.short_name().to_string(),
                )
            };
            debug!(path = %name, "expiring path");
            self.remove_path(&pivot);
            if was_failed {
                // already accounted when the failure status arrived
            } else if !was_established {
                self.stats.timeouts += 1;
                self.path_build_backoff();
            } else if !ran_full_term {
                // died mid-lifetime after establishing
                self.stats.path_fails += 1;
            }
        }

        if self.should_build_more(now_ms) {
            let want = self.num_paths_desired - self.paths.len();
            frames.extend(self.build_more(db, want, now_ms));
        }
        frames
    }

    /// Tear everything down, erroring every pending callback.
    pub fn stop(&mut self) {
        let pivots: Vec<RouterId> = self.paths.keys().copied().collect();
        for pivot in pivots {
            self.remove_path(&pivot);
        }
    }
}
