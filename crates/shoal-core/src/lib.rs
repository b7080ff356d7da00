//! Shared types, wire format and configuration for shoal nodes.
//! All other Shoal crates depend on this one.

pub mod config;
pub mod coord;
pub mod peer;
pub mod wire;

pub use coord::{Coordinate, Vector};
pub use peer::{PeerDescriptor, PeerId};
pub use wire::{Label, Message, MessageKind};
