//! A single-room WebSocket chat hub.
//!
//! Every text message a participant sends is broadcast to everyone in the
//! room, the sender included. Each module focuses on a concrete
//! responsibility:
//!
//! - [`hub`] owns room membership on a single task and fans messages out to
//!   each participant's bounded outbound queue, evicting readers that fall
//!   behind.
//! - [`participant`] defines the hub-side participant record and message type.
//! - [`pump`] moves frames between a connection and the hub.
//! - [`server`] upgrades `GET /room` requests with axum and runs the room.
//! - [`trace`] provides the pluggable tracer the hub reports activity to.
//! - [`cli`] and [`client`] implement the command line and a terminal client.
//!
//! Unit tests live next to each module; `tests/` drives real WebSocket
//! clients against an in-process server and the compiled binary.

pub mod cli;
pub mod client;
pub mod hub;
pub mod participant;
pub mod pump;
pub mod server;
pub mod trace;
