//! Overlay components of a shoal node.
//!
//! Every component owns its state behind a synchronous lock that is never
//! held across an await. Components reach each other through `Arc`s handed
//! in at construction; [`node::OverlayNode`] does the wiring.

pub mod bootstrap;
pub mod close_peers;
pub mod coordinates;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod link_pool;
pub mod memory;
pub mod neighbors;
pub mod node;
pub mod overlay;
pub mod playback;
pub mod player;
pub mod responsibility;
pub mod sampling;
pub mod segment_cache;
pub mod segments;
pub mod telemetry;
pub mod transport;

pub use bootstrap::{Bootstrap, BootstrapQueue};
pub use close_peers::{ClosePeerExplorer, ClosePeerSet};
pub use coordinates::{CoordinateStore, Estimate, VivaldiProtocol};
pub use error::{FetchRejection, OverlayError, ServerReason, TransportError};
pub use link::Link;
pub use link_pool::LinkPool;
pub use memory::{MemoryBootstrap, MemoryNetwork, MemoryTransport};
pub use neighbors::{NeighborManager, NeighborSets};
pub use node::{NeighborStatus, NodeContext, NodeStatus, OverlayNode};
pub use overlay::OverlayController;
pub use playback::PlaybackState;
pub use player::{Bandwidth, BandwidthProbe, MediaPlayer, StaticProbe};
pub use responsibility::ResponsibilityCoordinator;
pub use sampling::{SamplingProtocol, SamplingView};
pub use segment_cache::SegmentCache;
pub use segments::{FetchMetrics, SegmentKind, SegmentOrchestrator, SegmentRequest};
pub use telemetry::{FetchSnapshot, FetchStats, Telemetry};
pub use transport::{ChannelLabel, Connection, Transport};
