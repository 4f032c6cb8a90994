//! Simulated disk loss and parity reconstruction: pick a victim, wipe it,
//! rebuild every block it held from the survivors, hand them back.

use std::net::SocketAddr;

use rand::{thread_rng, Rng};
use snafu::ResultExt;
use tracing::{debug, info};

use crate::net::{self, CONTROL_BUF, REPLY_TIMEOUT};
use crate::protocol::control::{self, DssView};
use crate::protocol::peer::{PeerRequest, FAIL_COMPLETE};
use crate::raid::{self, Role};

use super::read::Slot;
use super::{BadDescriptorSnafu, Client, ClientError, IoSnafu, NetSnafu};

/// Stripes are written contiguously from zero, so probing stops at the first
/// missing block; the cap only bounds a runaway probe.
const PROBE_CAP: u64 = 1000;

impl Client {
    /// Fail one random drive of `dss` and reconstruct its blocks from the
    /// survivors. Returns the victim's drive index.
    pub async fn disk_failure(&self, dss: &str) -> Result<usize, ClientError> {
        let reply = self.command(&format!("disk-failure {dss}")).await?;
        if control::is_failure(&reply) {
            return Err(ClientError::ManagerRefused { reply });
        }
        let (view, files) = control::parse_repair_descriptor(&reply).context(BadDescriptorSnafu)?;

        let victim = thread_rng().gen_range(0..view.disks.len());
        let victim_disk = &view.disks[victim];
        info!(%dss, drive = victim, node = %victim_disk.name, "simulating disk failure");

        let reply = net::request(
            &self.peer,
            victim_disk.addr,
            &PeerRequest::Fail.encode(),
            CONTROL_BUF,
            REPLY_TIMEOUT,
        )
        .await
        .context(NetSnafu)?;
        if &reply[..] != FAIL_COMPLETE {
            return Err(ClientError::FailNotAcknowledged {
                node: victim_disk.name.clone(),
            });
        }

        for file in &files {
            self.rebuild_file(&view, victim, file).await?;
        }

        Self::expect_success(self.command("recovery-complete").await?)?;
        info!(%dss, drive = victim, files = files.len(), "reconstruction complete");
        Ok(victim)
    }

    async fn rebuild_file(
        &self,
        view: &DssView,
        victim: usize,
        file: &str,
    ) -> Result<(), ClientError> {
        let geometry = view.geometry();
        let survivors: Vec<(usize, SocketAddr)> = view
            .disks
            .iter()
            .enumerate()
            .filter(|(drive, _)| *drive != victim)
            .map(|(drive, disk)| (drive, disk.addr))
            .collect();
        let probe = survivors[0];

        let mut rebuilt = 0u64;
        for stripe in 0..PROBE_CAP {
            // The first survivor tells us whether this stripe exists at all.
            let slots = self.gather_blocks(&[probe], file, stripe).await?;
            match &slots[0] {
                Slot::Missing => break,
                Slot::Pending => {
                    return Err(ClientError::NodeUnavailable {
                        node: view.disks[probe.0].name.clone(),
                    })
                }
                Slot::Block(_) => {}
            }

            let slots = self.gather_blocks(&survivors, file, stripe).await?;
            let mut blocks = Vec::with_capacity(survivors.len());
            for (slot, (drive, _)) in slots.into_iter().zip(&survivors) {
                match slot {
                    Slot::Block(mut block) => {
                        // Short blocks cannot occur in a healthy array, but a
                        // padded XOR still reconstructs correctly.
                        block.resize(geometry.unit, 0);
                        blocks.push(block);
                    }
                    Slot::Missing | Slot::Pending => {
                        return Err(ClientError::NodeUnavailable {
                            node: view.disks[*drive].name.clone(),
                        })
                    }
                }
            }

            let payload = raid::reconstruct_block(&blocks, geometry.unit);
            let role = if victim == geometry.parity_position(stripe) {
                Role::Parity
            } else {
                Role::Data
            };
            let frame = PeerRequest::Write {
                file: file.to_string(),
                stripe,
                role,
                payload,
            };
            self.peer
                .send_to(&frame.encode(), view.disks[victim].addr)
                .await
                .context(IoSnafu)?;
            debug!(%file, stripe, %role, "restored block");
            rebuilt += 1;
        }

        info!(%file, stripes = rebuilt, "file reconstructed");
        Ok(())
    }
}
