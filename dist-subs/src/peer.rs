//! Peer mesh: inbound listener, outbound dials, and per-link receive loops.
//!
//! Links are plain TCP connections. The dialing side announces its node id
//! with a raw handshake, after which either side may push replication
//! frames (a SYNC envelope followed by the subscriber record) at any time.
//! Nothing is acknowledged and nothing reconnects: a link that fails is
//! removed from the table and stays gone.
//!
//! Two members starting together dial each other, so a pair can hold two
//! connections. Both stay open with their receive loops running; the far
//! side may have picked either one for its own sends. Broadcasts use the
//! newest link per peer.
//!
//! Handshakes are read off the accept loop, so an inbound connection that
//! never sends its id holds only its own task.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prost::Message as ProstMessage;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::frame::{encode_frame, read_handshake, read_message, write_handshake};
use crate::membership::{ClusterMembership, NodeId};
use crate::node::NodeState;
use crate::proto::{Message, Subscriber};
use crate::store::SubscriberStore;

type SharedWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

struct PeerLink {
    serial: u64,
    writer: SharedWriter,
}

pub struct PeerMesh {
    local_id: NodeId,
    membership: ClusterMembership,
    store: Arc<SubscriberStore>,
    state: watch::Receiver<NodeState>,
    /// Live links per peer, oldest first.
    links: Mutex<HashMap<NodeId, Vec<PeerLink>>>,
    next_serial: AtomicU64,
}

impl PeerMesh {
    pub fn new(
        local_id: NodeId,
        membership: ClusterMembership,
        store: Arc<SubscriberStore>,
        state: watch::Receiver<NodeState>,
    ) -> Self {
        Self {
            local_id,
            membership,
            store,
            state,
            links: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Ids of peers with a live link, sorted.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.links().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Accepts inbound links until every other member has handshaken once.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        let expected = self.membership.peers_of(self.local_id).len();
        let mut registered = HashSet::new();
        let (handshaken_tx, mut handshaken_rx) = mpsc::unbounded_channel();

        while registered.len() < expected && self.services_running() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let mesh = Arc::clone(&self);
                        let handshaken = handshaken_tx.clone();
                        tokio::spawn(async move {
                            if let Some(peer_id) = mesh.accept_peer(stream, addr).await {
                                let _ = handshaken.send(peer_id);
                            }
                        });
                    }
                    Err(err) => warn!(node = self.local_id, error = ?err, "failed to accept peer"),
                },
                Some(peer_id) = handshaken_rx.recv() => {
                    registered.insert(peer_id);
                }
            }
        }

        info!(
            node = self.local_id,
            inbound = registered.len(),
            "peer listener finished accepting"
        );
    }

    async fn accept_peer(self: &Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> Option<NodeId> {
        let peer_id = match read_handshake(&mut stream).await {
            Ok(peer_id) => peer_id,
            Err(err) => {
                warn!(node = self.local_id, %addr, error = ?err, "peer handshake failed");
                return None;
            }
        };

        if peer_id == self.local_id || !self.membership.contains(peer_id) {
            warn!(node = self.local_id, peer = peer_id, %addr, "rejecting unknown peer id");
            return None;
        }

        info!(node = self.local_id, peer = peer_id, "peer connected");
        self.attach(peer_id, stream);
        Some(peer_id)
    }

    /// Dials every other member once. Failures are logged and not retried.
    pub async fn dial_peers(self: Arc<Self>) {
        for peer_id in self.membership.peers_of(self.local_id) {
            let addr = match self.membership.addrs(peer_id) {
                Ok(addrs) => addrs.peer,
                Err(err) => {
                    warn!(node = self.local_id, peer = peer_id, error = ?err, "no peer address");
                    continue;
                }
            };

            let mut stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(node = self.local_id, peer = peer_id, %addr, error = %err, "could not reach peer");
                    continue;
                }
            };

            if let Err(err) = write_handshake(&mut stream, self.local_id).await {
                warn!(node = self.local_id, peer = peer_id, error = %err, "handshake write failed");
                continue;
            }

            info!(node = self.local_id, peer = peer_id, "connected to peer");
            self.attach(peer_id, stream);
        }
    }

    /// Sends `record` to every live link. Returns how many links took it.
    pub async fn broadcast(&self, record: &Subscriber) -> usize {
        let frames = match replication_frames(record) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(node = self.local_id, error = %err, "could not encode replication frames");
                return 0;
            }
        };

        let targets: Vec<(NodeId, u64, SharedWriter)> = self
            .links()
            .iter()
            .filter_map(|(id, links)| {
                links
                    .last()
                    .map(|link| (*id, link.serial, Arc::clone(&link.writer)))
            })
            .collect();

        let mut delivered = 0;
        for (peer_id, serial, writer) in targets {
            let result = {
                let mut writer = writer.lock().await;
                match writer.write_all(&frames).await {
                    Ok(()) => writer.flush().await,
                    Err(err) => Err(err),
                }
            };
            match result {
                Ok(()) => {
                    delivered += 1;
                    debug!(node = self.local_id, peer = peer_id, subscriber = record.id, "replicated");
                }
                Err(err) => {
                    warn!(node = self.local_id, peer = peer_id, error = %err, "dropping peer after failed send");
                    self.detach(peer_id, serial);
                }
            }
        }
        delivered
    }

    fn attach(self: &Arc<Self>, peer_id: NodeId, stream: TcpStream) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        self.links().entry(peer_id).or_default().push(PeerLink {
            serial,
            writer: Arc::new(AsyncMutex::new(writer)),
        });

        let mesh = Arc::clone(self);
        tokio::spawn(async move {
            mesh.receive_loop(peer_id, serial, reader).await;
        });
    }

    async fn receive_loop(&self, peer_id: NodeId, serial: u64, mut reader: OwnedReadHalf) {
        while self.services_running() {
            let envelope = match read_message::<_, Message>(&mut reader).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    info!(node = self.local_id, peer = peer_id, "peer closed the link");
                    break;
                }
                Err(err) => {
                    warn!(node = self.local_id, peer = peer_id, error = %err, "peer link failed");
                    break;
                }
            };

            if !envelope.is_sync() {
                debug!(node = self.local_id, peer = peer_id, demand = %envelope.demand, "ignoring envelope");
                continue;
            }

            match read_message::<_, Subscriber>(&mut reader).await {
                Ok(Some(record)) => {
                    info!(node = self.local_id, peer = peer_id, subscriber = record.id, "applied replica");
                    self.store.apply_replica(record);
                }
                Ok(None) => {
                    info!(node = self.local_id, peer = peer_id, "peer closed mid-replication");
                    break;
                }
                Err(err) => {
                    warn!(node = self.local_id, peer = peer_id, error = %err, "bad replication record");
                    break;
                }
            }
        }
        self.detach(peer_id, serial);
    }

    /// Removes the link `serial` refers to. Other links to the same peer
    /// are left alone.
    fn detach(&self, peer_id: NodeId, serial: u64) {
        let mut links = self.links();
        let Some(peer_links) = links.get_mut(&peer_id) else {
            return;
        };
        peer_links.retain(|link| link.serial != serial);
        if peer_links.is_empty() {
            links.remove(&peer_id);
            info!(node = self.local_id, peer = peer_id, "peer link removed");
        } else {
            debug!(node = self.local_id, peer = peer_id, serial, "redundant peer link closed");
        }
    }

    fn services_running(&self) -> bool {
        *self.state.borrow() == NodeState::ServicesRunning
    }

    fn links(&self) -> MutexGuard<'_, HashMap<NodeId, Vec<PeerLink>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// SYNC envelope and record, framed back to back in one buffer.
fn replication_frames(record: &Subscriber) -> std::io::Result<Vec<u8>> {
    let mut frames = encode_frame(&Message::sync().encode_to_vec())?;
    frames.extend_from_slice(&encode_frame(&record.encode_to_vec())?);
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use crate::proto::Status;

    #[tokio::test]
    async fn replication_frames_decode_as_envelope_then_record() {
        let record = Subscriber {
            id: 5,
            ..Subscriber::registration("Ada", vec!["chess".into()])
        };
        let frames = replication_frames(&record).expect("encode");

        let mut reader = frames.as_slice();
        let envelope: Message = read_message(&mut reader).await.expect("read").expect("envelope");
        assert!(envelope.is_sync());
        let decoded: Subscriber = read_message(&mut reader).await.expect("read").expect("record");
        assert_eq!(decoded, record);
        assert_eq!(decoded.status(), Status::Subs);
        assert!(read_frame(&mut reader).await.expect("eof").is_none());
    }
}
