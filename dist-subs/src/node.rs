//! One directory node: identity, configuration, and startup state machine.
//!
//! A node starts with only its admin listener open. The first matching
//! `STRT` configuration moves it to [`NodeState::ServicesRunning`], which
//! binds the peer and client ports, dials the other members, and begins
//! accepting registrations. [`Node`] is a cheap handle; clones share state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result, ensure};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::membership::{ClusterMembership, NodeAddrs, NodeId};
use crate::peer::PeerMesh;
use crate::proto::{Capacity, Configuration, Subscriber, epoch_millis};
use crate::store::{SubscriberStore, UpsertOutcome};
use crate::{admin, client_channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    AdminListening,
    ServicesRunning,
    /// Reached only through [`Node::stop`].
    Stopped,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    id: NodeId,
    addrs: NodeAddrs,
    store: Arc<SubscriberStore>,
    mesh: Arc<PeerMesh>,
    configuration: OnceLock<Configuration>,
    services_started: AtomicBool,
    state: watch::Sender<NodeState>,
}

impl Node {
    pub fn new(id: NodeId, membership: ClusterMembership) -> Result<Self> {
        let addrs = membership
            .addrs(id)
            .with_context(|| format!("cannot build node {id}"))?;
        let store = Arc::new(SubscriberStore::new());
        let (state, state_rx) = watch::channel(NodeState::Init);
        let mesh = Arc::new(PeerMesh::new(id, membership, Arc::clone(&store), state_rx));

        Ok(Self {
            inner: Arc::new(NodeInner {
                id,
                addrs,
                store,
                mesh,
                configuration: OnceLock::new(),
                services_started: AtomicBool::new(false),
                state,
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn addrs(&self) -> &NodeAddrs {
        &self.inner.addrs
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<NodeState> {
        self.inner.state.subscribe()
    }

    pub fn store(&self) -> &SubscriberStore {
        &self.inner.store
    }

    pub fn configuration(&self) -> Option<Configuration> {
        self.inner.configuration.get().cloned()
    }

    /// Configured level, or 0 before any configuration arrived.
    pub fn fault_tolerance_level(&self) -> i32 {
        self.inner
            .configuration
            .get()
            .map_or(0, |config| config.fault_tolerance_level)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.inner.mesh.connected_peers()
    }

    /// Count of ONLN subscribers.
    pub fn active_capacity(&self) -> Capacity {
        Capacity::new(self.id(), self.store().active_count())
    }

    /// Count of all stored subscribers.
    pub fn total_capacity(&self) -> Capacity {
        Capacity::new(self.id(), self.store().len())
    }

    /// Binds the admin port and starts serving admin connections.
    pub async fn start(&self) -> Result<SocketAddr> {
        ensure!(
            self.state() == NodeState::Init,
            "node {} already started",
            self.id()
        );

        let listener = TcpListener::bind(self.addrs().admin)
            .await
            .with_context(|| format!("failed to bind admin port {}", self.addrs().admin))?;
        let addr = listener.local_addr()?;

        self.inner.state.send_replace(NodeState::AdminListening);
        info!(node = self.id(), %addr, "admin listening");
        tokio::spawn(admin::run_listener(listener, self.clone()));

        Ok(addr)
    }

    /// Stores the configuration if none is set yet. Returns whether it was
    /// taken; an existing configuration is never replaced.
    pub fn configure(&self, configuration: Configuration) -> bool {
        let level = configuration.fault_tolerance_level;
        let accepted = self.inner.configuration.set(configuration).is_ok();
        if accepted {
            info!(node = self.id(), fault_tolerance = level, "configuration stored");
        } else {
            info!(node = self.id(), "configuration already set, keeping it");
        }
        accepted
    }

    /// Enters [`NodeState::ServicesRunning`] once.
    ///
    /// Returns `Ok(false)` when services were already running. Both service
    /// ports are bound before this returns.
    pub fn start_services(&self) -> Result<bool> {
        if self.inner.services_started.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let listeners = bind_listener(self.addrs().peer)
            .and_then(|peer| Ok((peer, bind_listener(self.addrs().client)?)));
        let (peer_listener, client_listener) = match listeners {
            Ok(listeners) => listeners,
            Err(err) => {
                self.inner.services_started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        self.inner.state.send_replace(NodeState::ServicesRunning);
        info!(
            node = self.id(),
            peer = %self.addrs().peer,
            client = %self.addrs().client,
            "services started"
        );

        let mesh = Arc::clone(&self.inner.mesh);
        tokio::spawn(mesh.listen(peer_listener));
        let mesh = Arc::clone(&self.inner.mesh);
        tokio::spawn(mesh.dial_peers());
        tokio::spawn(client_channel::run_listener(client_listener, self.clone()));

        Ok(true)
    }

    /// Store insert or merge; new records are pushed to peers when the
    /// fault-tolerance level is above zero.
    pub async fn upsert(&self, candidate: Subscriber) -> UpsertOutcome {
        let outcome = self.store().upsert(candidate, epoch_millis());
        if let UpsertOutcome::Inserted(record) = &outcome {
            info!(node = self.id(), subscriber = record.id, name = %record.name_surname, "subscriber added");
            if self.fault_tolerance_level() > 0 {
                let delivered = self.inner.mesh.broadcast(record).await;
                info!(node = self.id(), subscriber = record.id, delivered, "replication sent");
            }
        }
        outcome
    }

    /// Handles one client registration and returns the reply record.
    ///
    /// Only `SUBS` requests are accepted; they get a fresh id and both
    /// timestamps set to now. Anything else comes back marked `UNKNOWN`.
    pub async fn register(&self, request: Subscriber) -> Subscriber {
        if !request.is_registration() {
            info!(node = self.id(), status = request.status, "not a registration");
            return request.rejected();
        }

        let now = epoch_millis();
        let candidate = Subscriber {
            id: self.store().mint_id(),
            start_date: now,
            last_accessed: now,
            ..request.clone()
        };

        match self.upsert(candidate).await {
            UpsertOutcome::Inserted(record) | UpsertOutcome::Merged(record) => record,
            UpsertOutcome::Rejected => request.rejected(),
        }
    }

    /// Marks the node stopped and releases [`Node::wait_for_shutdown`].
    ///
    /// Already-blocked accepts and reads are not interrupted; only process
    /// exit frees every socket.
    pub fn stop(&self) {
        self.inner.state.send_replace(NodeState::Stopped);
        info!(node = self.id(), "node stopped");
    }

    pub async fn wait_for_shutdown(&self) {
        let mut state = self.watch_state();
        if state.wait_for(|state| *state == NodeState::Stopped).await.is_err() {
            warn!(node = self.id(), "state channel closed before shutdown");
        }
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
        .with_context(|| format!("failed to register listener on {addr}"))
}
