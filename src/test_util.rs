//! Helpers shared by the unit and integration tests: unused-port allocation,
//! one-line daemon spawning, random payloads.

#![allow(missing_docs)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use portpicker::pick_unused_port;
use rand::{thread_rng, RngCore};
use tokio::net::UdpSocket;

use crate::{manager, node};

pub fn next_addr_for_ip(ip: IpAddr) -> SocketAddr {
    SocketAddr::new(ip, pick_unused_port(ip))
}

pub fn next_addr() -> SocketAddr {
    next_addr_for_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub fn trace_init() {
    let levels = std::env::var("TEST_LOG").unwrap_or_else(|_| "error".to_string());
    crate::trace::init(&levels);
}

pub fn random_payload(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Run a manager on an unused loopback port, returning its address.
pub async fn spawn_manager() -> SocketAddr {
    let socket = UdpSocket::bind(next_addr()).await.expect("bind manager");
    let addr = socket.local_addr().expect("manager local addr");
    tokio::spawn(async move {
        if let Err(error) = manager::run(socket).await {
            panic!("manager loop died: {error}");
        }
    });
    addr
}

/// Run a storage node on an unused loopback port, returning its peer
/// address. Registration with a manager is up to the caller.
pub async fn spawn_node() -> SocketAddr {
    let socket = UdpSocket::bind(next_addr()).await.expect("bind node");
    let addr = socket.local_addr().expect("node local addr");
    tokio::spawn(async move {
        if let Err(error) = node::run(socket).await {
            panic!("node loop died: {error}");
        }
    });
    addr
}
