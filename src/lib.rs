#![doc = include_str!("../README.md")]

//! # Xornet
//! Message routing core of a Kademlia-style overlay network.
//!
//! Every participant owns an opaque 512-bit identifier compared under
//! XOR distance. A [Router] keeps the peers closest to its id in a
//! [RoutingTable], mirrors each close peer's own close group in a group
//! matrix, and classifies every inbound message: deliver it locally,
//! hand it to a specific peer, or push it onward toward the
//! destination's close group. Group-addressed traffic converges on a
//! deterministic replica set kept coherent across joins and departures.
//!
//! The transport is a collaborator behind the [transport::Transport]
//! trait; [transport::memory::Mesh] provides an in-memory network for
//! tests and simulations.

mod cache;
mod common;
mod error;
mod group_matrix;
mod timer;

pub mod client_table;
pub mod config;
pub mod group_change;
pub mod handler;
pub mod messages;
pub mod network;
pub mod response;
pub mod router;
pub mod routing_table;
pub mod rpcs;
pub mod service;
pub mod transport;

pub use crate::common::{Distance, Id, NodeInfo, ID_SIZE};
pub use crate::group_matrix::{GroupMatrix, MatrixChange};
pub use crate::handler::{MessageReceivedFunctor, ReplyFunctor};
pub use crate::router::Router;
pub use crate::routing_table::RoutingTable;
pub use crate::service::{MatrixChangedFunctor, RequestPublicKeyFunctor};
pub use crate::timer::{ResponseFunctor, Timer};
pub use error::Error;

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
