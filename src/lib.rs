//! Hypercards - collaborative whiteboard event relay
//!
//! Room-scoped pub/sub over a message broker: clients publish drawing events
//! to rooms and stream everyone else's events back, with join/leave presence
//! announced on their behalf.

pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod handlers;
pub mod routing;
pub mod utils;
pub mod validation;

pub mod proto {
    tonic::include_proto!("hypercards");
}
