//! Client registration channel: one request and one reply per connection.

use std::net::SocketAddr;

use anyhow::{Result, bail};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::frame::{read_message, write_message};
use crate::node::{Node, NodeState};
use crate::proto::{Status, Subscriber};

/// Accepts registrations until the node is stopped.
///
/// The stop check happens between accepts, so a stopped node serves no
/// further client; the listener is dropped after the next connection.
pub async fn run_listener(listener: TcpListener, node: Node) {
    while node.state() == NodeState::ServicesRunning {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(node = node.id(), error = ?err, "failed to accept client");
                continue;
            }
        };

        if node.state() != NodeState::ServicesRunning {
            debug!(node = node.id(), %peer, "node stopped, dropping client");
            break;
        }
        spawn_connection(stream, peer, &node);
    }
    info!(node = node.id(), "client listener closed");
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, node: &Node) {
    let node = node.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_connection(stream, &node).await {
            warn!(node = node.id(), %peer, error = ?err, "client connection failed");
        }
    });
}

async fn serve_connection(mut stream: TcpStream, node: &Node) -> Result<()> {
    let Some(request) = read_message::<_, Subscriber>(&mut stream).await? else {
        bail!("client closed before sending a request");
    };
    debug!(node = node.id(), name = %request.name_surname, "registration request");

    let reply = node.register(request).await;
    write_message(&mut stream, &reply).await?;

    if reply.status() == Status::Unknown {
        info!(node = node.id(), "registration refused");
    } else {
        debug!(node = node.id(), subscriber = reply.id, "registration answered");
    }

    stream.shutdown().await?;
    Ok(())
}
