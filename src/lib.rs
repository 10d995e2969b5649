//! # Wanlink - WAN Relay Link Protocol
//!
//! Wanlink lets geographically separated simulation sites exchange
//! real-time state traffic across the public Internet by relaying UDP
//! datagrams through a rendezvous node. A site joins the relay; the relay
//! opens a dedicated reverse path back to exactly the address it observed
//! the join arrive from, defeating NAT without port-forwarding
//! configuration on the site.
//!
//! ## Architecture
//!
//! Both ends of every path are [`Link`]s running the same machinery: an
//! explicit Down/Connecting/Up state machine, a background receive loop,
//! and a pacemaker task sustaining liveness. The relay side adds a single
//! listener admitting joins and a reflector fanning traffic between the
//! admitted sites' reverse links.
//!
//! ```text
//! site A ── Link ──► RelayListener ──► reverse Link ──► site A
//!                          │
//! site B ── Link ──────────┘          (one reverse Link per site)
//! ```
//!
//! Reliability-like guarantees (handshake completion, liveness detection,
//! graceful teardown) are built on top of a transport that offers none:
//! every request carries a correlation ID, is retried on a fixed budget,
//! and is matched to its response by the [`Correlator`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `config` | Link configuration, advertised subset, reverse derivation |
//! | `messages` | Control messages and the datagram codec |
//! | `correlator` | Request/response matching by correlation ID |
//! | `channel` | One bound UDP socket per link, activity clocks |
//! | `link` | The per-peer lifecycle state machine |
//! | `pacemaker` | Keep-alive emission and peer-silence detection |
//! | `relay` | The rendezvous listener and join admission |
//! | `reflector` | Named-link registry and bundle fan-out |
//! | `error` | The `LinkError` taxonomy |

pub mod channel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod link;
pub mod messages;
pub mod pacemaker;
pub mod reflector;
pub mod relay;

pub use channel::UdpChannel;
pub use config::{Bundling, IfaceSelector, LinkAdvert, LinkConfig, TransportKind, AUTO_ASSIGN};
pub use correlator::Correlator;
pub use error::LinkError;
pub use link::{BundleSink, Link, LinkState, NullSink};
pub use messages::{CodecError, Envelope, JoinBody, Message, ResponsePayload};
pub use reflector::Reflector;
pub use relay::{Distributor, RelayListener};
