//! # Node
//!
//! The [`Node`] ties the path plane together: one actor task owns the
//! NodeDB, the path handler, the transit table, and the optional exit
//! endpoint, and processes everything — commands from handles, inbound
//! link frames, periodic ticks — sequentially from its inbox. That single
//! consumer *is* the cooperative event loop: no protocol state is ever
//! touched off it, so none of it needs locks.
//!
//! Disk work runs on the blocking pool; fetch requests run as detached
//! tasks whose results are marshalled back through the same inbox.
//!
//! ## Usage
//!
//! ```ignore
//! let hub = MemoryHub::new();
//! let keypair = Keypair::generate();
//! let (link, inbox) = hub.attach(keypair.router_id());
//! let node = Node::spawn(NodeConfig::client(), keypair, Arc::new(link), inbox);
//! node.build_paths(2).await;
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bencode::{self, DictBuilder, Value};
use crate::builder::{BuildStats, PathHandler};
use crate::contact::RouterContact;
use crate::crypto;
use crate::endpoint::{Endpoint, ExitEndpoint};
use crate::identity::{now_ms, Keypair, RouterId};
use crate::messages::{HopId, LinkFrame};
use crate::nodedb::{DiskCaller, FetchDirective, NodeDb, NodeRole};
use crate::packet::IpPacket;
use crate::path::{ControlResponse, PathInbound, PathStatus, ResponseCallback};
use crate::transit::{TransitContext, TransitEvent, TransitMetrics};
use crate::transport::{InboundFrame, LinkTransport};

/// Cadence of the actor's periodic tick.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Command queue depth; beyond this, handles await.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Static configuration of a node.
#[derive(Clone)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub root: Option<PathBuf>,
    /// Paths the handler keeps topped up on its own; zero disables
    /// automatic building.
    pub num_paths: usize,
    pub num_hops: usize,
    pub pinned_edges: HashSet<RouterId>,
    pub bootstraps: Vec<RouterContact>,
}

impl NodeConfig {
    /// A client keeping a small pool of paths of the default length.
    pub fn client() -> Self {
        Self {
            role: NodeRole::Client,
            root: None,
            num_paths: 4,
            num_hops: crate::path::DEFAULT_HOPS,
            pinned_edges: HashSet::new(),
            bootstraps: Vec::new(),
        }
    }

    /// A transit relay: no client paths of its own.
    pub fn relay() -> Self {
        Self {
            role: NodeRole::Relay,
            root: None,
            num_paths: 0,
            num_hops: crate::path::DEFAULT_HOPS,
            pinned_edges: HashSet::new(),
            bootstraps: Vec::new(),
        }
    }
}

/// A point-in-time view of one path.
#[derive(Clone, Debug)]
pub struct PathSnapshot {
    pub pivot: RouterId,
    pub status: PathStatus,
    pub latency_ms: u64,
    pub hops: Vec<RouterId>,
}

/// Aggregated node counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeStats {
    pub build: BuildStats,
    pub transit: TransitMetrics,
    pub known_rcs: usize,
    pub num_paths: usize,
}

enum NodeCommand {
    BuildPaths {
        count: usize,
        reply: oneshot::Sender<usize>,
    },
    SendData {
        pivot: RouterId,
        body: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    SendControl {
        pivot: RouterId,
        method: String,
        body: Vec<u8>,
        callback: ResponseCallback,
    },
    HandlePacket(IpPacket),
    PutRc {
        rc: RouterContact,
        reply: oneshot::Sender<bool>,
    },
    SetWhitelist {
        whitelist: Vec<RouterId>,
        greylist: Vec<RouterId>,
        greenlist: Vec<RouterId>,
    },
    Paths {
        reply: oneshot::Sender<Vec<PathSnapshot>>,
    },
    Stats {
        reply: oneshot::Sender<NodeStats>,
    },
    IngestRcFetch {
        source: RouterId,
        result: Option<Vec<RouterContact>>,
    },
    IngestRidFetch {
        source: RouterId,
        result: Option<HashSet<RouterId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle onto a running node actor. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    local_id: RouterId,
    cmd_tx: mpsc::Sender<NodeCommand>,
    data_rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
}

impl Node {
    /// Start an actor without an exit endpoint.
    pub fn spawn(
        config: NodeConfig,
        keypair: Keypair,
        transport: Arc<dyn LinkTransport>,
        inbox: mpsc::UnboundedReceiver<InboundFrame>,
    ) -> Self {
        Self::spawn_inner(config, keypair, transport, inbox, None)
    }

    /// Start a relay actor that serves exit sessions from `exit`.
    pub fn spawn_with_exit(
        config: NodeConfig,
        keypair: Keypair,
        transport: Arc<dyn LinkTransport>,
        inbox: mpsc::UnboundedReceiver<InboundFrame>,
        exit: ExitEndpoint,
    ) -> Self {
        Self::spawn_inner(config, keypair, transport, inbox, Some(exit))
    }

    fn spawn_inner(
        config: NodeConfig,
        keypair: Keypair,
        transport: Arc<dyn LinkTransport>,
        inbox: mpsc::UnboundedReceiver<InboundFrame>,
        exit: Option<ExitEndpoint>,
    ) -> Self {
        let local_id = keypair.router_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let disk: DiskCaller = Arc::new(|job| {
            tokio::task::spawn_blocking(job);
        });
        let mut nodedb = NodeDb::new(config.root.clone(), config.role, disk);
        if let Err(err) = nodedb.load_from_disk() {
            warn!(error = %err, "nodedb load failed, starting empty");
        }
        nodedb.set_pinned_edges(config.pinned_edges.clone());
        nodedb.set_bootstraps(config.bootstraps.clone());

        let mut transit = TransitContext::new(keypair.clone());
        let exit = exit.map(|exit| Arc::new(Mutex::new(exit)));
        if let Some(exit) = &exit {
            transit.set_control_handler(exit_control_handler(exit.clone()));
        }

        let handler = PathHandler::new(config.num_paths, config.num_hops);
        let actor = NodeActor {
            keypair,
            nodedb,
            handler,
            transit,
            exit,
            transport,
            cmd_tx: cmd_tx.clone(),
            data_tx,
            rid_round_pending: 0,
        };
        tokio::spawn(actor.run(cmd_rx, inbox));
        info!(id = %local_id.short(), "node actor started");
        Self {
            local_id,
            cmd_tx,
            data_rx: Arc::new(tokio::sync::Mutex::new(Some(data_rx))),
        }
    }

    pub fn local_id(&self) -> RouterId {
        self.local_id
    }

    /// Take the tunneled-data receiver. May be taken exactly once.
    pub async fn data_receiver(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.data_rx.lock().await.take()
    }

    /// Kick off up to `count` path builds; resolves to builds actually
    /// started.
    pub async fn build_paths(&self, count: usize) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::BuildPaths { count, reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Send opaque data over the path pivoting at `pivot`.
    pub async fn send_data(&self, pivot: RouterId, body: Vec<u8>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::SendData { pivot, body, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Send a control request over a path and await its outcome.
    pub async fn send_control(
        &self,
        pivot: RouterId,
        method: &str,
        body: Vec<u8>,
    ) -> ControlResponse {
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |resp| {
            let _ = tx.send(resp);
        });
        if self
            .cmd_tx
            .send(NodeCommand::SendControl {
                pivot,
                method: method.to_string(),
                body,
                callback,
            })
            .await
            .is_err()
        {
            return ControlResponse::Error;
        }
        rx.await.unwrap_or(ControlResponse::Error)
    }

    /// Feed one raw IP packet into the packet router / tunnel.
    pub async fn handle_packet(&self, pkt: IpPacket) {
        let _ = self.cmd_tx.send(NodeCommand::HandlePacket(pkt)).await;
    }

    /// Install a router contact.
    pub async fn put_rc(&self, rc: RouterContact) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::PutRc { rc, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Install the staking oracle's role sets.
    pub async fn set_whitelist(
        &self,
        whitelist: Vec<RouterId>,
        greylist: Vec<RouterId>,
        greenlist: Vec<RouterId>,
    ) {
        let _ = self
            .cmd_tx
            .send(NodeCommand::SetWhitelist {
                whitelist,
                greylist,
                greenlist,
            })
            .await;
    }

    pub async fn paths(&self) -> Vec<PathSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(NodeCommand::Paths { reply }).await.is_err() {
            return vec![];
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> NodeStats {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(NodeCommand::Stats { reply }).await.is_err() {
            return NodeStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the actor, erroring every pending control callback.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct NodeActor {
    keypair: Keypair,
    nodedb: NodeDb,
    handler: PathHandler,
    transit: TransitContext,
    exit: Option<Arc<Mutex<ExitEndpoint>>>,
    transport: Arc<dyn LinkTransport>,
    cmd_tx: mpsc::Sender<NodeCommand>,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Router-ID answers still outstanding in the current fetch round.
    rid_round_pending: usize,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<NodeCommand>,
        mut inbox: mpsc::UnboundedReceiver<InboundFrame>,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                frame = inbox.recv() => match frame {
                    Some((from, frame)) => self.handle_frame(from, frame).await,
                    None => break,
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
        self.handler.stop();
        debug!(id = %self.keypair.router_id().short(), "node actor stopped");
    }

    async fn handle_command(&mut self, cmd: NodeCommand) -> bool {
        let now = now_ms();
        match cmd {
            NodeCommand::BuildPaths { count, reply } => {
                let frames = self.handler.build_more(&self.nodedb, count, now);
                let started = frames.len();
                self.send_all(frames).await;
                let _ = reply.send(started);
            }
            NodeCommand::SendData { pivot, body, reply } => {
                let frame = self
                    .handler
                    .get_path(&pivot)
                    .and_then(|path| path.send_data(body, now));
                let sent = match frame {
                    Some((to, frame)) => self.transport.send_frame(to, frame).await,
                    None => false,
                };
                let _ = reply.send(sent);
            }
            NodeCommand::SendControl {
                pivot,
                method,
                body,
                callback,
            } => {
                let frame = match self.handler.get_path_mut(&pivot) {
                    Some(path) => path.send_control(&method, body, callback, now),
                    None => {
                        callback(ControlResponse::Error);
                        None
                    }
                };
                if let Some((to, frame)) = frame {
                    self.transport.send_frame(to, frame).await;
                }
            }
            NodeCommand::HandlePacket(pkt) => {
                if let Some(exit) = &self.exit {
                    exit.lock()
                        .expect("exit lock poisoned")
                        .tun()
                        .handle_packet(pkt);
                }
            }
            NodeCommand::PutRc { rc, reply } => {
                let accepted = rc.verify().is_ok() && self.nodedb.put_rc_if_newer(rc, now);
                let _ = reply.send(accepted);
            }
            NodeCommand::SetWhitelist {
                whitelist,
                greylist,
                greenlist,
            } => {
                self.nodedb
                    .set_router_whitelist(&whitelist, &greylist, &greenlist);
            }
            NodeCommand::Paths { reply } => {
                let mut snapshots = Vec::new();
                self.handler.for_each_path(|path| {
                    snapshots.push(PathSnapshot {
                        pivot: path.pivot_router(),
                        status: path.status(),
                        latency_ms: path.latency_ms,
                        hops: path.hops().iter().map(|h| h.rc.router_id).collect(),
                    });
                });
                let _ = reply.send(snapshots);
            }
            NodeCommand::Stats { reply } => {
                let _ = reply.send(NodeStats {
                    build: self.handler.build_stats(),
                    transit: self.transit.metrics(),
                    known_rcs: self.nodedb.num_loaded(),
                    num_paths: self.handler.num_paths(),
                });
            }
            NodeCommand::IngestRcFetch { source, result } => match result {
                Some(rcs) => {
                    let accepted = self.nodedb.process_fetched_rcs(source, rcs, now);
                    debug!(accepted, source = %source.short(), "RC fetch processed");
                    self.nodedb.fetch_rcs_result(false);
                }
                None => self.nodedb.fetch_rcs_result(true),
            },
            NodeCommand::IngestRidFetch { source, result } => {
                self.nodedb.ingest_rid_fetch_responses(source, result);
                self.rid_round_pending = self.rid_round_pending.saturating_sub(1);
                if self.rid_round_pending == 0 {
                    self.nodedb.process_fetched_rids();
                }
            }
            NodeCommand::Shutdown { reply } => {
                self.handler.stop();
                self.nodedb.save_to_disk();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_frame(&mut self, from: RouterId, frame: LinkFrame) {
        let now = now_ms();
        // Frames addressed to one of our own paths go to the handler;
        // everything else is transit work.
        let mine = match &frame {
            LinkFrame::Status { path_id, .. } => self.handler.get_path_by_hop(path_id).is_some(),
            LinkFrame::Traffic { envelope } => {
                self.handler.get_path_by_hop(&envelope.hop_id).is_some()
            }
            LinkFrame::Build { .. } => false,
        };
        if mine {
            match frame {
                LinkFrame::Status {
                    status,
                    path_id,
                    nonce,
                    payload,
                } => {
                    self.handler
                        .handle_status_frame(path_id, status, nonce, payload, now);
                }
                LinkFrame::Traffic { envelope } => {
                    if let Some(PathInbound::Data(payload)) =
                        self.handler.handle_traffic(envelope, now)
                    {
                        let _ = self.data_tx.send(payload);
                    }
                }
                LinkFrame::Build { .. } => unreachable!("build frames are never ours"),
            }
        } else {
            let events = self.transit.handle_frame(from, frame, now);
            self.dispatch_transit_events(events).await;
        }
    }

    async fn dispatch_transit_events(&mut self, events: Vec<TransitEvent>) {
        for event in events {
            match event {
                TransitEvent::Forward { to, frame } => {
                    if !self.transport.send_frame(to, frame).await {
                        debug!(peer = %to.short(), "transit forward failed");
                    }
                }
                TransitEvent::Deliver { path_id, payload } => {
                    self.deliver_exit_traffic(path_id, payload);
                }
            }
        }
    }

    fn deliver_exit_traffic(&mut self, path_id: HopId, payload: Vec<u8>) {
        match &self.exit {
            Some(exit) => {
                let now = now_ms();
                let mut guard = exit.lock().expect("exit lock poisoned");
                let forwarded = IpPacket::new(payload)
                    .and_then(|pkt| guard.handle_outbound(&path_id, pkt, now));
                if let Some(pkt) = forwarded {
                    // hand the permitted packet to the platform side
                    guard.tun().handle_packet(pkt);
                }
            }
            None => {
                // no exit endpoint: surface as local tunneled data
                let _ = self.data_tx.send(payload);
            }
        }
    }

    async fn tick(&mut self) {
        let now = now_ms();
        self.transit.expire(now);
        if let Some(exit) = &self.exit {
            exit.lock().expect("exit lock poisoned").tick(now);
        }

        let frames = self.handler.tick(&self.nodedb, now);
        self.send_all(frames).await;

        for directive in self.nodedb.tick(now) {
            self.spawn_fetch(directive);
        }
    }

    async fn send_all(&mut self, frames: Vec<(RouterId, LinkFrame)>) {
        for (to, frame) in frames {
            if !self.transport.send_frame(to, frame).await {
                debug!(peer = %to.short(), "send failed");
            }
        }
    }

    /// Run a fetch directive as a detached task; results marshal back
    /// through the command inbox.
    fn spawn_fetch(&mut self, directive: FetchDirective) {
        let transport = self.transport.clone();
        let cmd_tx = self.cmd_tx.clone();
        match directive {
            FetchDirective::FetchRcs { source } => {
                tokio::spawn(async move {
                    let result = transport
                        .request(source, "fetch_rcs", vec![])
                        .await
                        .ok()
                        .and_then(|body| decode_rc_list(&body).ok());
                    let _ = cmd_tx
                        .send(NodeCommand::IngestRcFetch { source, result })
                        .await;
                });
            }
            FetchDirective::FetchRids { sources } => {
                self.rid_round_pending = sources.len();
                for source in sources {
                    let transport = transport.clone();
                    let cmd_tx = cmd_tx.clone();
                    tokio::spawn(async move {
                        let result = transport
                            .request(source, "fetch_rids", vec![])
                            .await
                            .ok()
                            .and_then(|body| decode_rid_list(&body).ok());
                        let _ = cmd_tx
                            .send(NodeCommand::IngestRidFetch { source, result })
                            .await;
                    });
                }
            }
        }
    }
}

/// Terminal-hop control service backed by an exit endpoint.
fn exit_control_handler(
    exit: Arc<Mutex<ExitEndpoint>>,
) -> crate::transit::ControlHandler {
    Box::new(move |intro, method, body| {
        let now = now_ms();
        match method {
            "obtain_exit" => {
                let pubkey = match verify_exit_authorization(body) {
                    Ok(pubkey) => pubkey,
                    Err(err) => {
                        warn!(error = %err, "rejected exit authorization");
                        return Some(DictBuilder::new().insert_int("S", 0).build().encode());
                    }
                };
                let ip = exit
                    .lock()
                    .expect("exit lock poisoned")
                    .allocate_exit(pubkey, *intro, true, now);
                Some(match ip {
                    Some(ip) => DictBuilder::new()
                        .insert_bytes("I", &ip.to_be_bytes())
                        .insert_int("S", 1)
                        .build()
                        .encode(),
                    None => DictBuilder::new().insert_int("S", 0).build().encode(),
                })
            }
            "close_exit" => {
                let removed = match verify_exit_authorization(body) {
                    Ok(pubkey) => {
                        let mut guard = exit.lock().expect("exit lock poisoned");
                        match guard
                            .find_endpoint_by_path(intro)
                            .map(|s| (s.ip, s.pubkey))
                        {
                            Some((ip, owner)) if owner == pubkey => {
                                guard.del_endpoint_info(intro, ip, &pubkey);
                                true
                            }
                            _ => false,
                        }
                    }
                    Err(_) => false,
                };
                Some(
                    DictBuilder::new()
                        .insert_int("S", i64::from(removed))
                        .build()
                        .encode(),
                )
            }
            _ => None,
        }
    })
}

/// Wire form of an RC fetch response: bencoded list of encoded RCs.
pub fn encode_rc_list(rcs: &[RouterContact]) -> Vec<u8> {
    Value::List(rcs.iter().map(|rc| Value::Bytes(rc.encode())).collect()).encode()
}

pub fn decode_rc_list(buf: &[u8]) -> Result<Vec<RouterContact>> {
    let value = bencode::decode(buf).context("rc list is not bencoded")?;
    value
        .as_list()
        .context("rc list is not a list")?
        .iter()
        .map(|item| {
            let bytes = item.as_bytes().context("rc entry is not bytes")?;
            RouterContact::decode(bytes).map_err(|err| anyhow::anyhow!("{}", err))
        })
        .collect()
}

/// Wire form of a RID fetch response: bencoded list of 32-byte ids.
pub fn encode_rid_list(ids: &HashSet<RouterId>) -> Vec<u8> {
    Value::List(
        ids.iter()
            .map(|id| Value::Bytes(id.as_bytes().to_vec()))
            .collect(),
    )
    .encode()
}

pub fn decode_rid_list(buf: &[u8]) -> Result<HashSet<RouterId>> {
    let value = bencode::decode(buf).context("rid list is not bencoded")?;
    value
        .as_list()
        .context("rid list is not a list")?
        .iter()
        .map(|item| {
            let bytes = item.as_bytes().context("rid entry is not bytes")?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("rid entry has wrong length"))?;
            Ok(RouterId::from_bytes(arr))
        })
        .collect()
}

/// Parse and verify a signed exit authorization body, returning the
/// client key it authorizes.
pub fn verify_exit_authorization(body: &[u8]) -> Result<[u8; 32]> {
    let value = bencode::decode(body).context("exit body is not bencoded")?;
    let flag = value.get("E").and_then(Value::as_int).context("missing E")?;
    let pubkey: [u8; 32] = value
        .get("I")
        .and_then(Value::as_bytes)
        .and_then(|b| b.try_into().ok())
        .context("missing I")?;
    let tx = value
        .get("T")
        .and_then(Value::as_bytes)
        .context("missing T")?
        .to_vec();
    let signature = value
        .get("Z")
        .and_then(Value::as_bytes)
        .context("missing Z")?
        .to_vec();

    let unsigned = DictBuilder::new()
        .insert_int("E", flag)
        .insert_bytes("I", &pubkey)
        .insert_bytes("T", &tx)
        .insert_bytes("Z", &[0u8; crypto::SIG_SIZE])
        .build()
        .encode();
    crypto::verify(&pubkey, &unsigned, &signature)
        .map_err(|err| anyhow::anyhow!("exit authorization: {}", err))?;
    Ok(pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::AddressInfo;
    use crate::transport::MemoryHub;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::{sleep, timeout};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn make_rc(keypair: &Keypair, last: u8) -> RouterContact {
        RouterContact::new_signed(
            keypair,
            vec![AddressInfo::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
                1090,
            )],
            vec![],
            None,
            now_ms(),
        )
    }

    struct TestNet {
        hub: MemoryHub,
        client: Node,
        relays: Vec<Node>,
        relay_ids: Vec<RouterId>,
    }

    async fn spawn_net(num_relays: usize, num_hops: usize) -> TestNet {
        let hub = MemoryHub::new();

        let mut relays = Vec::new();
        let mut relay_ids = Vec::new();
        let mut rcs = Vec::new();
        for i in 0..num_relays {
            let keypair = Keypair::generate();
            relay_ids.push(keypair.router_id());
            rcs.push(make_rc(&keypair, i as u8 + 1));
            let (link, inbox) = hub.attach(keypair.router_id());
            relays.push(Node::spawn(
                NodeConfig::relay(),
                keypair,
                Arc::new(link),
                inbox,
            ));
        }

        let client_keypair = Keypair::generate();
        let (link, inbox) = hub.attach(client_keypair.router_id());
        let mut config = NodeConfig::client();
        // explicit builds only, so tests stay deterministic
        config.num_paths = 0;
        config.num_hops = num_hops;
        let client = Node::spawn(config, client_keypair, Arc::new(link), inbox);

        client
            .set_whitelist(relay_ids.clone(), vec![], vec![])
            .await;
        for rc in rcs {
            assert!(client.put_rc(rc).await);
        }

        TestNet {
            hub,
            client,
            relays,
            relay_ids,
        }
    }

    fn signed_exit_body(keypair: &Keypair, flag: i64) -> Vec<u8> {
        let unsigned = DictBuilder::new()
            .insert_int("E", flag)
            .insert_bytes("I", keypair.router_id().as_bytes())
            .insert_bytes("T", b"tx-exit")
            .insert_bytes("Z", &[0u8; crypto::SIG_SIZE])
            .build()
            .encode();
        let signature = keypair.sign(&unsigned);
        DictBuilder::new()
            .insert_int("E", flag)
            .insert_bytes("I", keypair.router_id().as_bytes())
            .insert_bytes("T", b"tx-exit")
            .insert_bytes("Z", &signature)
            .build()
            .encode()
    }

    async fn wait_for_established(client: &Node) -> PathSnapshot {
        timeout(TEST_TIMEOUT, async {
            loop {
                for snapshot in client.paths().await {
                    if snapshot.status == PathStatus::Established {
                        return snapshot;
                    }
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("path never established")
    }

    #[tokio::test]
    async fn end_to_end_path_build_over_memory_hub() {
        let net = spawn_net(3, 3).await;
        assert_eq!(net.client.build_paths(1).await, 1);

        let snapshot = wait_for_established(&net.client).await;
        assert_eq!(snapshot.hops.len(), 3);
        assert!(snapshot.hops.iter().all(|hop| net.relay_ids.contains(hop)));

        let stats = net.client.stats().await;
        assert_eq!(stats.build.success, 1);
        assert_eq!(stats.build.build_fails, 0);
        let _ = &net.hub;
        let _ = &net.relays;
    }

    #[tokio::test]
    async fn control_round_trip_over_built_path() {
        let net = spawn_net(3, 2).await;
        net.client.build_paths(1).await;
        let snapshot = wait_for_established(&net.client).await;

        let response = net
            .client
            .send_control(snapshot.pivot, "path_latency", b"echo".to_vec())
            .await;
        assert_eq!(response, ControlResponse::Payload(b"echo".to_vec()));
    }

    #[tokio::test]
    async fn unknown_pivot_errors_immediately() {
        let net = spawn_net(2, 2).await;
        let response = net
            .client
            .send_control(RouterId::from_bytes([9; 32]), "path_latency", vec![])
            .await;
        assert_eq!(response, ControlResponse::Error);
    }

    #[tokio::test]
    async fn exit_session_obtained_over_path() {
        // a relay fleet where one node serves exits; the client builds a
        // path pivoting there and negotiates a session over it
        let hub = MemoryHub::new();

        let mut relay_ids = Vec::new();
        let mut rcs = Vec::new();
        let mut relays = Vec::new();
        for i in 0..2 {
            let keypair = Keypair::generate();
            relay_ids.push(keypair.router_id());
            rcs.push(make_rc(&keypair, i + 1));
            let (link, inbox) = hub.attach(keypair.router_id());
            if i == 1 {
                // the pivot serves exits
                let tun = crate::endpoint::TunEndpoint::new(
                    "exit0",
                    "10.200.0.0/16".parse().unwrap(),
                    crate::packet::PacketRouter::new(Box::new(|_pkt| {})),
                );
                let exit = ExitEndpoint::new(tun, crate::policy::TrafficPolicy::default());
                relays.push(Node::spawn_with_exit(
                    NodeConfig::relay(),
                    keypair,
                    Arc::new(link),
                    inbox,
                    exit,
                ));
            } else {
                relays.push(Node::spawn(
                    NodeConfig::relay(),
                    keypair,
                    Arc::new(link),
                    inbox,
                ));
            }
        }

        let client_keypair = Keypair::generate();
        let (link, inbox) = hub.attach(client_keypair.router_id());
        let mut config = NodeConfig::client();
        config.num_paths = 0;
        config.num_hops = 2;
        // pinning the first hop forces the exit relay to be the pivot
        config.pinned_edges = [relay_ids[0]].into();
        let client = Node::spawn(config, client_keypair.clone(), Arc::new(link), inbox);
        client.set_whitelist(relay_ids.clone(), vec![], vec![]).await;
        for rc in rcs {
            assert!(client.put_rc(rc).await);
        }

        assert_eq!(client.build_paths(1).await, 1);
        let snapshot = wait_for_established(&client).await;
        assert_eq!(snapshot.pivot, relay_ids[1]);

        let body = signed_exit_body(&client_keypair, 1);
        let response = client
            .send_control(snapshot.pivot, "obtain_exit", body)
            .await;
        let payload = match response {
            ControlResponse::Payload(payload) => payload,
            other => panic!("unexpected response {:?}", other),
        };
        let value = bencode::decode(&payload).expect("response is bencoded");
        assert_eq!(value.get("S").and_then(Value::as_int), Some(1));
        let mapped = value
            .get("I")
            .and_then(Value::as_bytes)
            .expect("mapped address present");
        let ip = u128::from_be_bytes(mapped.try_into().unwrap());
        let range: crate::policy::IpRange = "10.200.0.0/16".parse().unwrap();
        assert!(range.contains(ip));

        // closing releases the session
        let body = signed_exit_body(&client_keypair, -1);
        let response = client
            .send_control(snapshot.pivot, "close_exit", body)
            .await;
        match response {
            ControlResponse::Payload(payload) => {
                let value = bencode::decode(&payload).unwrap();
                assert_eq!(value.get("S").and_then(Value::as_int), Some(1));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_is_clean() {
        let net = spawn_net(2, 2).await;
        net.client.build_paths(1).await;
        net.client.shutdown().await;
        for relay in &net.relays {
            relay.shutdown().await;
        }
    }

    #[test]
    fn rc_and_rid_list_roundtrip() {
        let keypair = Keypair::generate();
        let rcs = vec![make_rc(&keypair, 1)];
        let decoded = decode_rc_list(&encode_rc_list(&rcs)).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].router_id, rcs[0].router_id);

        let ids: HashSet<RouterId> = (0..5u8)
            .map(|i| RouterId::from_bytes([i + 1; 32]))
            .collect();
        assert_eq!(decode_rid_list(&encode_rid_list(&ids)).unwrap(), ids);

        assert!(decode_rc_list(b"junk").is_err());
        assert!(decode_rid_list(b"l2:abe").is_err());
    }

    #[test]
    fn exit_authorization_verification() {
        let keypair = Keypair::generate();
        let unsigned = DictBuilder::new()
            .insert_int("E", 1)
            .insert_bytes("I", keypair.router_id().as_bytes())
            .insert_bytes("T", b"tx-1")
            .insert_bytes("Z", &[0u8; crypto::SIG_SIZE])
            .build()
            .encode();
        let signature = keypair.sign(&unsigned);
        let body = DictBuilder::new()
            .insert_int("E", 1)
            .insert_bytes("I", keypair.router_id().as_bytes())
            .insert_bytes("T", b"tx-1")
            .insert_bytes("Z", &signature)
            .build()
            .encode();

        assert_eq!(
            verify_exit_authorization(&body).unwrap(),
            *keypair.router_id().as_bytes()
        );

        let mut tampered = body.clone();
        let len = tampered.len();
        tampered[len - 10] ^= 1;
        assert!(verify_exit_authorization(&tampered).is_err());
    }
}
