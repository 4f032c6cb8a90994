//! Datagram plumbing shared by every role: bounded request/reply with a
//! per-datagram timeout so a lost packet can never wedge a command.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use snafu::{ResultExt, Snafu};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// How long a single request waits for its reply datagram.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Control-plane replies fit comfortably under this.
pub const CONTROL_BUF: usize = 1024;

#[derive(Debug, Snafu)]
pub enum NetError {
    #[snafu(display("socket error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("no reply from {peer} within {wait:?}"))]
    Timeout { peer: SocketAddr, wait: Duration },
}

pub async fn bind(addr: SocketAddr) -> Result<UdpSocket, NetError> {
    UdpSocket::bind(addr).await.context(IoSnafu)
}

/// Send one datagram to `peer` and wait for one reply from it, discarding
/// datagrams that arrive from anyone else in the meantime.
pub async fn request(
    socket: &UdpSocket,
    peer: SocketAddr,
    payload: &[u8],
    reply_cap: usize,
    wait: Duration,
) -> Result<Bytes, NetError> {
    socket.send_to(payload, peer).await.context(IoSnafu)?;

    let mut buf = vec![0u8; reply_cap];
    let reply = timeout(wait, async {
        loop {
            let (len, sender) = socket.recv_from(&mut buf).await.context(IoSnafu)?;
            if sender == peer {
                return Ok(Bytes::copy_from_slice(&buf[..len]));
            }
            debug!(%sender, "discarding stray datagram");
        }
    })
    .await;

    match reply {
        Ok(result) => result,
        Err(_) => Err(NetError::Timeout { peer, wait }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::next_addr;

    #[tokio::test]
    async fn request_round_trip() {
        let echo_addr = next_addr();
        let echo = UdpSocket::bind(echo_addr).await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, sender) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..len], sender).await.unwrap();
        });

        let socket = UdpSocket::bind(next_addr()).await.unwrap();
        let reply = request(&socket, echo_addr, b"ping", 64, REPLY_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(&reply[..], b"ping");
    }

    #[tokio::test]
    async fn request_times_out_when_nobody_answers() {
        let silent = next_addr();
        let _holder = UdpSocket::bind(silent).await.unwrap();

        let socket = UdpSocket::bind(next_addr()).await.unwrap();
        let result = request(&socket, silent, b"ping", 64, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(NetError::Timeout { .. })));
    }
}
