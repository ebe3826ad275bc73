//! Fixed-membership replicated subscriber directory.
//!
//! Every node serves three TCP channels derived from its id: an admin port
//! (`7000 + id`) that is always open, and a client port (`6000 + id`) plus a
//! peer port (`5000 + id`) that open once an operator sends the start
//! command. Clients register subscribers on any node; with a nonzero
//! fault-tolerance level each new record is pushed to the other members.
//!
//! - [`proto`] defines the protobuf entities on the wire.
//! - [`frame`] is the length-prefixed codec every channel shares.
//! - [`membership`] holds the cluster table and derives addresses.
//! - [`store`] is the per-node subscriber map.
//! - [`admin`], [`client_channel`], and [`peer`] serve the three channels.
//! - [`node`] ties them together behind the startup state machine.
//! - [`connector`] and [`monitor`] are the client-side tooling, and
//!   [`config`] / [`cli`] back the `dist-subs` binary.

pub mod admin;
pub mod cli;
pub mod client_channel;
pub mod config;
pub mod connector;
pub mod frame;
pub mod membership;
pub mod monitor;
pub mod node;
pub mod peer;
pub mod proto;
pub mod store;
