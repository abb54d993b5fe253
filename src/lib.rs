//! # Mixroute - Onion-Routed Mixnet Overlay Node
//!
//! Mixroute implements the path plane of an onion-routed mixnet node:
//! clients build multi-hop cryptographic tunnels ("paths") through a fleet
//! of relays and exchange arbitrary IP packets over them. A node can act
//! as a client, as a transit relay, or as an exit bridging traffic to the
//! outside.
//!
//! ## Architecture
//!
//! All protocol state lives behind the **actor pattern**: the [`Node`]
//! handle is cheap to clone, while a single actor task owns the NodeDB,
//! path handler, transit table, and endpoints, and processes commands,
//! inbound frames, and timer ticks sequentially. Cross-thread entry points
//! (transport receive, disk completions, fetch results) marshal through
//! the actor's inbox, so no protocol structure needs a lock.
//!
//! ## Security Model
//!
//! - Relay identity is its Ed25519 public key; contacts are signed records
//! - Per-hop keys come from X25519 against the key in the signed contact
//! - One involutive XChaCha20 onion step per hop, with deterministic nonce
//!   mutation so adjacent hops cannot correlate ciphertexts
//! - Role sets (whitelist/greylist/greenlist) from the staking oracle gate
//!   which relays carry paths at all
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `crypto` | Ed25519, X25519, SHA-512, the XChaCha20 onion step |
//! | `identity` | Router IDs, long-term keys, key files |
//! | `bencode` | canonical codec for every wire and disk format |
//! | `contact` | signed router contacts (RCs) |
//! | `nodedb` | RC catalog, role sets, RC/RID consensus fetching |
//! | `messages` | envelopes, link frames, build slots, inner frames |
//! | `transit` | per-relay circuit splice and forwarding |
//! | `path` | client-side path state machine |
//! | `builder` | hop selection, build pacing, statistics |
//! | `packet` | IP parsing and the ingress packet router |
//! | `policy` | traffic policies and IP ranges |
//! | `endpoint` | tun/exit endpoint capability |
//! | `transport` | link transport trait + in-process mesh |
//! | `node` | the actor facade combining everything |

pub mod bencode;
pub mod builder;
pub mod contact;
pub mod crypto;
pub mod endpoint;
pub mod identity;
pub mod messages;
pub mod node;
pub mod nodedb;
pub mod packet;
pub mod path;
pub mod policy;
pub mod transit;
pub mod transport;

pub use builder::{BuildLimiter, BuildStats, PathHandler, MAX_PATHS};
pub use contact::{AddressInfo, ExitInfo, RouterContact};
pub use identity::{Keypair, RouterId};
pub use messages::{Envelope, HopId, LinkFrame};
pub use node::{Node, NodeConfig, NodeStats, PathSnapshot};
pub use nodedb::{NodeDb, NodeRole};
pub use packet::{IpPacket, PacketRouter};
pub use path::{ControlResponse, Introduction, Path, PathStatus};
pub use policy::{IpRange, ProtocolInfo, TrafficPolicy};
pub use transit::{status, TransitContext, TransitHop, TransitTable};
pub use transport::{LinkTransport, MemoryHub, MemoryLink};
