//! Admin control plane, open from process start.
//!
//! Each connection may carry any number of `[kind][len][payload]` requests:
//!
//! | kind | request         | reply                                        |
//! |------|-----------------|----------------------------------------------|
//! | 1    | `Capacity`      | `Capacity` with the ONLN count, or nothing    |
//! | 2    | `Configuration` | `Message{STRT, YEP or NOP}`                  |
//! | 3    | `Message` CPCTY | `Capacity` with the total count              |
//!
//! A kind-1 or kind-3 payload that fails to decode is answered with a
//! zero-length frame so the caller is not left waiting.

use std::net::SocketAddr;

use anyhow::Result;
use prost::Message as ProstMessage;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::frame::{AdminKind, read_admin_frame, write_frame};
use crate::node::Node;
use crate::proto::{Capacity, Configuration, DEMAND_CAPACITY, DEMAND_START, Message, Response};

/// What to send back for one admin request.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminReply {
    Capacity(Capacity),
    Message(Message),
    /// Zero-length frame: "no answer".
    Empty,
    /// Write nothing.
    Silent,
}

impl AdminReply {
    /// Frame payload to write, if any.
    pub fn payload(&self) -> Option<Vec<u8>> {
        match self {
            AdminReply::Capacity(capacity) => Some(capacity.encode_to_vec()),
            AdminReply::Message(message) => Some(message.encode_to_vec()),
            AdminReply::Empty => Some(Vec::new()),
            AdminReply::Silent => None,
        }
    }
}

pub async fn run_listener(listener: TcpListener, node: Node) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => spawn_connection(stream, peer, &node),
            Err(err) => warn!(node = node.id(), error = ?err, "failed to accept admin connection"),
        }
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, node: &Node) {
    let node = node.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_connection(stream, &node).await {
            warn!(node = node.id(), %peer, error = ?err, "admin connection closed with error");
        }
    });
}

async fn serve_connection(mut stream: TcpStream, node: &Node) -> Result<()> {
    while let Some((kind, payload)) = read_admin_frame(&mut stream).await? {
        let reply = handle_request(node, kind, &payload);
        if let Some(bytes) = reply.payload() {
            write_frame(&mut stream, &bytes).await?;
        }
    }
    debug!(node = node.id(), "admin connection ended");
    Ok(())
}

/// Dispatches one admin request by its kind byte.
pub fn handle_request(node: &Node, kind: u8, payload: &[u8]) -> AdminReply {
    match AdminKind::from_byte(kind) {
        Some(AdminKind::CapacityRequest) => capacity_request(node, payload),
        Some(AdminKind::Configuration) => configuration(node, payload),
        Some(AdminKind::CapacityQuery) => capacity_query(node, payload),
        None => {
            warn!(node = node.id(), kind, "unknown admin message kind");
            AdminReply::Silent
        }
    }
}

fn capacity_request(node: &Node, payload: &[u8]) -> AdminReply {
    let request = match Capacity::decode(payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(node = node.id(), error = %err, "malformed capacity request");
            return AdminReply::Empty;
        }
    };

    if request.server_id != node.id() {
        info!(node = node.id(), requested = request.server_id, "capacity request for another node");
        return AdminReply::Silent;
    }

    let capacity = node.active_capacity();
    debug!(node = node.id(), active = capacity.server_status, "capacity reply");
    AdminReply::Capacity(capacity)
}

fn configuration(node: &Node, payload: &[u8]) -> AdminReply {
    let nop = AdminReply::Message(Message::new(DEMAND_START, Response::Nop));

    let config = match Configuration::decode(payload) {
        Ok(config) => config,
        Err(err) => {
            warn!(node = node.id(), error = %err, "malformed configuration");
            return nop;
        }
    };

    if config.server_id != node.id() || config.method != DEMAND_START {
        info!(
            node = node.id(),
            requested = config.server_id,
            method = %config.method,
            "configuration not for this node"
        );
        return nop;
    }

    let level = config.fault_tolerance_level;
    if level < 0 {
        info!(node = node.id(), level, "negative fault tolerance level");
        return nop;
    }

    node.configure(config);
    match node.start_services() {
        Ok(started) => {
            info!(node = node.id(), fault_tolerance = level, started, "start command accepted");
            AdminReply::Message(Message::new(DEMAND_START, Response::Yep))
        }
        Err(err) => {
            error!(node = node.id(), error = ?err, "could not start services");
            nop
        }
    }
}

fn capacity_query(node: &Node, payload: &[u8]) -> AdminReply {
    let request = match Message::decode(payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(node = node.id(), error = %err, "malformed capacity query");
            return AdminReply::Empty;
        }
    };

    if request.demand != DEMAND_CAPACITY {
        info!(node = node.id(), demand = %request.demand, "unexpected admin demand");
        return AdminReply::Silent;
    }

    AdminReply::Capacity(node.total_capacity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{ClusterMembership, PortBases};
    use crate::node::NodeState;
    use crate::proto::Subscriber;

    fn node(base: u16) -> Node {
        let membership = ClusterMembership::with_port_bases(PortBases {
            admin: base,
            client: base + 100,
            peer: base + 200,
        })
        .expect("membership");
        Node::new(2, membership).expect("node")
    }

    fn reply_message(reply: AdminReply) -> Message {
        match reply {
            AdminReply::Message(message) => message,
            other => panic!("expected a message reply, got {other:?}"),
        }
    }

    #[test]
    fn capacity_request_for_other_node_is_ignored() {
        let node = node(32000);
        let request = Capacity::new(3, 0).encode_to_vec();
        assert_eq!(handle_request(&node, 1, &request), AdminReply::Silent);
    }

    #[test]
    fn malformed_capacity_request_gets_empty_reply() {
        let node = node(32010);
        let reply = handle_request(&node, 1, &[0xff, 0xff, 0xff]);
        assert_eq!(reply, AdminReply::Empty);
        assert_eq!(reply.payload(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn capacity_request_reports_active_count() {
        let node = node(32020);
        let record = node.register(Subscriber::registration("Ada", Vec::new())).await;
        node.register(Subscriber::registration("Grace", Vec::new())).await;
        let mut online = record;
        online.set_status(crate::proto::Status::Onln);
        node.upsert(online).await;

        let request = Capacity::new(2, 0).encode_to_vec();
        match handle_request(&node, 1, &request) {
            AdminReply::Capacity(capacity) => {
                assert_eq!(capacity.server_id, 2);
                assert_eq!(capacity.server_status, 1);
            }
            other => panic!("expected capacity, got {other:?}"),
        }

        let query = Message::capacity_query().encode_to_vec();
        match handle_request(&node, 3, &query) {
            AdminReply::Capacity(capacity) => assert_eq!(capacity.server_status, 2),
            other => panic!("expected capacity, got {other:?}"),
        }
    }

    #[test]
    fn configuration_for_other_node_is_refused() {
        let node = node(32030);
        let payload = Configuration::start(1, 2).encode_to_vec();
        let message = reply_message(handle_request(&node, 2, &payload));

        assert_eq!(message.demand, DEMAND_START);
        assert_eq!(message.response(), Response::Nop);
        assert!(node.configuration().is_none());
        assert_eq!(node.state(), NodeState::Init);
    }

    #[test]
    fn configuration_with_other_method_is_refused() {
        let node = node(32040);
        let mut config = Configuration::start(2, 1);
        config.method = "STOP".into();
        let message = reply_message(handle_request(&node, 2, &config.encode_to_vec()));
        assert_eq!(message.response(), Response::Nop);
        assert_eq!(node.fault_tolerance_level(), 0);
    }

    #[tokio::test]
    async fn start_command_runs_services_once() {
        let node = node(32050);
        let payload = Configuration::start(2, 1).encode_to_vec();

        let first = reply_message(handle_request(&node, 2, &payload));
        assert_eq!(first.response(), Response::Yep);
        assert_eq!(node.state(), NodeState::ServicesRunning);
        assert_eq!(node.fault_tolerance_level(), 1);

        let again = Configuration::start(2, 0).encode_to_vec();
        let second = reply_message(handle_request(&node, 2, &again));
        assert_eq!(second.response(), Response::Yep);
        assert_eq!(node.fault_tolerance_level(), 1);
    }

    #[test]
    fn capacity_query_with_other_demand_is_ignored() {
        let node = node(32060);
        let payload = Message::new("PING", Response::Unknown).encode_to_vec();
        assert_eq!(handle_request(&node, 3, &payload), AdminReply::Silent);
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let node = node(32070);
        assert_eq!(handle_request(&node, 9, &[]), AdminReply::Silent);
    }
}
