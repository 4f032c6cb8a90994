//! The verified read path: fan out over the drives, gather one block per
//! drive, optionally bend bits, check parity, retry the whole stripe when
//! anything is off.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use bytes::BytesMut;
use futures::future::join_all;
use snafu::ResultExt;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::net::REPLY_TIMEOUT;
use crate::protocol::control::{self, DssView};
use crate::protocol::peer::{PeerRequest, BLOCK_NOT_FOUND, MAX_DATAGRAM};
use crate::raid;

use super::{BadDescriptorSnafu, Client, ClientError, IoSnafu, OutputSnafu};

/// Attempts per stripe, first try included.
pub const READ_ATTEMPTS: usize = 5;

/// One drive's answer within a gather.
pub(crate) enum Slot {
    /// No datagram arrived before the deadline.
    Pending,
    /// The node answered `BLOCK NOT FOUND`.
    Missing,
    Block(BytesMut),
}

impl Client {
    /// Read a file back, verify every stripe against its parity, and write
    /// the result to `read-<file>` under `out_dir`. Returns the recovered
    /// bytes.
    pub async fn read(
        &self,
        user: &str,
        file: &str,
        error_p: u8,
        out_dir: &Path,
    ) -> Result<Vec<u8>, ClientError> {
        let reply = self.command(&format!("read {user} {file}")).await?;
        if control::is_failure(&reply) {
            return Err(ClientError::ManagerRefused { reply });
        }
        let (size, view) = control::parse_read_descriptor(&reply).context(BadDescriptorSnafu)?;
        let geometry = view.geometry();
        info!(%file, size, dss = %view.name, error_p, "reading");

        let mut out = Vec::with_capacity(size as usize);
        for stripe in 0..geometry.stripe_count(size) {
            let blocks = self.read_stripe(&view, file, stripe, error_p).await?;
            let parity_pos = geometry.parity_position(stripe);
            for (drive, block) in blocks.iter().enumerate() {
                if drive == parity_pos {
                    continue;
                }
                // The declared size truncates the padded tail.
                let remaining = size as usize - out.len();
                if remaining == 0 {
                    break;
                }
                out.extend_from_slice(&block[..block.len().min(remaining)]);
            }
        }

        let out_path = out_dir.join(format!("read-{file}"));
        tokio::fs::write(&out_path, &out)
            .await
            .context(OutputSnafu { path: &out_path })?;
        info!(path = %out_path.display(), bytes = out.len(), "read complete");

        // Purely diagnostic: when the source file is still lying around
        // locally, check we reproduced it.
        if let Ok(original) = tokio::fs::read(file).await {
            if original == out {
                info!(%file, "read-back matches the local source");
            } else {
                warn!(%file, "read-back differs from the local source");
            }
        }

        Ok(out)
    }

    /// One stripe, verified. Any missing block or parity mismatch burns an
    /// attempt; attempts exhausted aborts the read naming the stripe.
    async fn read_stripe(
        &self,
        view: &DssView,
        file: &str,
        stripe: u64,
        error_p: u8,
    ) -> Result<Vec<BytesMut>, ClientError> {
        let geometry = view.geometry();
        let targets: Vec<(usize, SocketAddr)> = view
            .disks
            .iter()
            .enumerate()
            .map(|(drive, disk)| (drive, disk.addr))
            .collect();

        for attempt in 1..=READ_ATTEMPTS {
            if attempt > 1 {
                debug!(stripe, attempt, "retrying stripe");
            }

            let slots = self.gather_blocks(&targets, file, stripe).await?;
            let mut blocks = Vec::with_capacity(slots.len());
            for (slot, (drive, _)) in slots.into_iter().zip(&targets) {
                match slot {
                    Slot::Block(block) => blocks.push(block),
                    Slot::Missing | Slot::Pending => {
                        debug!(stripe, drive, "block unavailable");
                    }
                }
            }
            if blocks.len() != targets.len() {
                continue;
            }

            for block in &mut blocks {
                if super::fault::flip_random_bit(block, error_p) {
                    debug!(stripe, "injected a bit error");
                }
            }

            if raid::verify_stripe(&blocks, geometry.unit) {
                return Ok(blocks);
            }
            debug!(stripe, attempt, "parity mismatch");
        }

        Err(ClientError::StripeFailed {
            stripe,
            attempts: READ_ATTEMPTS,
        })
    }

    /// Fan a `READ` out to each target and gather the replies, attributing
    /// them by sender address (ports are unique per node, so the mapping is
    /// injective). Returns one [`Slot`] per target, in target order.
    pub(crate) async fn gather_blocks(
        &self,
        targets: &[(usize, SocketAddr)],
        file: &str,
        stripe: u64,
    ) -> Result<Vec<Slot>, ClientError> {
        let index: HashMap<SocketAddr, usize> = targets
            .iter()
            .enumerate()
            .map(|(position, (_, addr))| (*addr, position))
            .collect();

        let sends = targets.iter().map(|(drive, addr)| {
            let frame = PeerRequest::Read {
                file: file.to_string(),
                stripe,
                drive: *drive,
            }
            .encode();
            let addr = *addr;
            async move { self.peer.send_to(&frame, addr).await }
        });
        for sent in join_all(sends).await {
            sent.context(IoSnafu)?;
        }

        let mut slots: Vec<Slot> = targets.iter().map(|_| Slot::Pending).collect();
        let deadline = Instant::now() + REPLY_TIMEOUT;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        while slots.iter().any(|slot| matches!(slot, Slot::Pending)) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let Ok(received) = timeout(deadline - now, self.peer.recv_from(&mut buf)).await
            else {
                break;
            };
            let (len, sender) = received.context(IoSnafu)?;
            let Some(&position) = index.get(&sender) else {
                debug!(%sender, "discarding stray datagram");
                continue;
            };
            let payload = &buf[..len];
            slots[position] = if payload == BLOCK_NOT_FOUND {
                Slot::Missing
            } else {
                Slot::Block(BytesMut::from(payload))
            };
        }

        Ok(slots)
    }
}
