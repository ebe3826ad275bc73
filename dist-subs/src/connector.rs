//! Client-side access to a cluster: registrations with failover and admin
//! sessions. Addresses come from the injected [`ClusterMembership`].

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use prost::Message as ProstMessage;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::frame::{AdminKind, read_frame, read_message, write_admin_frame, write_message};
use crate::membership::{ClusterMembership, NodeId};
use crate::proto::{Capacity, Configuration, Message, Status, Subscriber};

/// Bound on how long a client waits for any single reply.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SubscriberClient {
    membership: ClusterMembership,
}

impl SubscriberClient {
    pub fn new(membership: ClusterMembership) -> Self {
        Self { membership }
    }

    /// Sends one registration to `node` and returns its reply as-is.
    pub async fn register_via(&self, node: NodeId, request: &Subscriber) -> Result<Subscriber> {
        let addr = self.membership.addrs(node)?.client;
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to node {node} at {addr}"))?;

        write_message(&mut stream, request).await?;
        let reply = timeout(RESPONSE_TIMEOUT, read_message::<_, Subscriber>(&mut stream))
            .await
            .with_context(|| format!("node {node} did not answer in time"))??;
        reply.ok_or_else(|| anyhow!("node {node} closed without a reply"))
    }

    /// Registers through `preferred`, then every other member in table
    /// order, until a node accepts. Returns the accepting node and record.
    pub async fn register(&self, preferred: NodeId, request: &Subscriber) -> Result<(NodeId, Subscriber)> {
        let mut order = vec![preferred];
        order.extend(self.membership.peers_of(preferred));

        let mut last_failure = anyhow!("no cluster members to try");
        for node in order {
            match self.register_via(node, request).await {
                Ok(reply) if reply.id > 0 && reply.status() != Status::Unknown => {
                    info!(node, subscriber = reply.id, "registered");
                    return Ok((node, reply));
                }
                Ok(reply) => {
                    debug!(node, status = reply.status().label(), "registration refused");
                    last_failure = anyhow!("node {node} refused the registration");
                }
                Err(err) => {
                    warn!(node, error = %err, "node unavailable, failing over");
                    last_failure = err;
                }
            }
        }
        Err(last_failure.context("every node failed the registration"))
    }
}

/// One long-lived admin connection to a single node.
pub struct AdminSession {
    node: NodeId,
    stream: TcpStream,
}

impl AdminSession {
    pub async fn connect(membership: &ClusterMembership, node: NodeId) -> Result<Self> {
        let addr = membership.addrs(node)?.admin;
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to reach admin port of node {node} at {addr}"))?;
        Ok(Self { node, stream })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Sends `STRT` and returns the node's reply envelope.
    pub async fn start(&mut self, fault_tolerance_level: i32) -> Result<Message> {
        let config = Configuration::start(self.node, fault_tolerance_level);
        write_admin_frame(&mut self.stream, AdminKind::Configuration, &config).await?;
        let payload = self.read_reply().await?;
        Ok(Message::decode(payload.as_slice())?)
    }

    /// ONLN count. `None` when the node answered with an empty frame.
    pub async fn active_capacity(&mut self) -> Result<Option<Capacity>> {
        let request = Capacity::new(self.node, 0);
        write_admin_frame(&mut self.stream, AdminKind::CapacityRequest, &request).await?;
        let payload = self.read_reply().await?;
        if payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(Capacity::decode(payload.as_slice())?))
    }

    /// Total subscriber count via a CPCTY query.
    pub async fn total_capacity(&mut self) -> Result<Capacity> {
        write_admin_frame(&mut self.stream, AdminKind::CapacityQuery, &Message::capacity_query()).await?;
        let payload = self.read_reply().await?;
        if payload.is_empty() {
            bail!("node {} sent an empty capacity reply", self.node);
        }
        Ok(Capacity::decode(payload.as_slice())?)
    }

    async fn read_reply(&mut self) -> Result<Vec<u8>> {
        let node = self.node;
        timeout(RESPONSE_TIMEOUT, read_frame(&mut self.stream))
            .await
            .with_context(|| format!("node {node} did not answer in time"))??
            .ok_or_else(|| anyhow!("node {node} closed the admin connection"))
    }
}
