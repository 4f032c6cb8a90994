//! The storage node: a long-lived peer that serves block reads and writes
//! for the one DSS it belongs to. All state is process memory; a `FAIL`
//! request wipes it, which is how the client simulates losing a disk.

pub mod store;

use std::net::{IpAddr, SocketAddr};

use snafu::{ResultExt, Snafu};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::net;
use crate::protocol::peer::{PeerRequest, BLOCK_NOT_FOUND, FAIL_COMPLETE, MAX_DATAGRAM};
use crate::protocol::control;
use store::BlockStore;

#[derive(Debug, Snafu)]
pub enum NodeError {
    #[snafu(display("peer socket error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("could not reach the manager: {source}"))]
    Register { source: net::NetError },

    #[snafu(display("manager refused registration: {reply}"))]
    RegistrationRefused { reply: String },
}

/// How a node announces itself to the manager.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub ip: IpAddr,
    pub mport: u16,
    pub cport: u16,
}

/// Send `register-disk` and insist on `SUCCESS`. The management endpoint
/// itself serves nothing; the node only ever dials out from it.
pub async fn register(
    socket: &UdpSocket,
    manager: SocketAddr,
    registration: &Registration,
) -> Result<(), NodeError> {
    let line = format!(
        "register-disk {} {} {} {}",
        registration.name, registration.ip, registration.mport, registration.cport
    );
    let reply = net::request(
        socket,
        manager,
        line.as_bytes(),
        net::CONTROL_BUF,
        net::REPLY_TIMEOUT,
    )
    .await
    .context(RegisterSnafu)?;

    let reply = String::from_utf8_lossy(&reply);
    if !control::is_success(&reply) {
        return Err(NodeError::RegistrationRefused {
            reply: reply.into_owned(),
        });
    }
    info!(name = %registration.name, "registered with the manager");
    Ok(())
}

/// Serve the peer endpoint forever. One request at a time, so the store
/// needs no locking.
pub async fn run(socket: UdpSocket) -> Result<(), NodeError> {
    let mut store = BlockStore::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, sender) = socket.recv_from(&mut buf).await.context(IoSnafu)?;
        match PeerRequest::decode(&buf[..len]) {
            Ok(request) => handle(&socket, &mut store, request, sender).await?,
            Err(error) => {
                warn!(message = "Discarding malformed peer datagram.", %error, %sender)
            }
        }
    }
}

async fn handle(
    socket: &UdpSocket,
    store: &mut BlockStore,
    request: PeerRequest,
    sender: SocketAddr,
) -> Result<(), NodeError> {
    match request {
        PeerRequest::Write {
            file,
            stripe,
            role,
            payload,
        } => {
            debug!(%file, stripe, %role, len = payload.len(), "stored block");
            store.upsert(&file, stripe, role, payload);
        }
        PeerRequest::Read {
            file,
            stripe,
            drive,
        } => match store.get(&file, stripe) {
            Some(block) => {
                debug!(%file, stripe, drive, role = %block.role, "served block");
                socket
                    .send_to(&block.bytes, sender)
                    .await
                    .context(IoSnafu)?;
            }
            None => {
                debug!(%file, stripe, drive, "block not found");
                socket
                    .send_to(BLOCK_NOT_FOUND, sender)
                    .await
                    .context(IoSnafu)?;
            }
        },
        PeerRequest::Fail => {
            let files = store.wipe();
            info!(message = "Simulated disk failure, store cleared.", files);
            socket
                .send_to(FAIL_COMPLETE, sender)
                .await
                .context(IoSnafu)?;
        }
        PeerRequest::Delete { dss } => {
            // A node serves at most one DSS, so scoping the delete to the
            // named DSS means dropping everything we hold.
            let files = store.wipe();
            info!(message = "Dropped all blocks for decommissioned DSS.", %dss, files);
        }
    }
    Ok(())
}
