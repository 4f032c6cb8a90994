//! The manager: single-task authority over users, disks, and DSS records.
//! One datagram in, one reply out, except for the two-phase verbs (`copy`,
//! `disk-failure`, `decommission-dss`), where the manager replies with a
//! descriptor and then blocks on the matching `*-complete` follow-up from
//! the same sender before touching any metadata. Anyone else knocking during
//! that window is told the manager is busy.

pub mod registry;

use std::net::SocketAddr;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::net::CONTROL_BUF;
use crate::protocol::control::{
    self, failure, format_read_descriptor, format_repair_descriptor, DiskAddr, DssView, Request,
    SUCCESS,
};
use registry::{Endpoint, FileRecord, Registry, RegistryError};

/// How long a phase-1 descriptor stays valid before the pending operation is
/// abandoned.
pub const FOLLOWUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Monotonic diagnostics, logged and never exposed on the wire.
#[derive(Debug, Default)]
struct Counters {
    requests: u64,
    failures: u64,
    copies: u64,
    reads: u64,
    repairs: u64,
    decommissions: u64,
}

#[derive(Debug, Default)]
pub struct Manager {
    registry: Registry,
    counters: Counters,
}

/// Serve the control plane forever on `socket`.
pub async fn run(socket: UdpSocket) -> crate::Result<()> {
    Manager::new().run(socket).await
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(mut self, socket: UdpSocket) -> crate::Result<()> {
        let mut buf = vec![0u8; CONTROL_BUF];
        loop {
            let (len, sender) = socket.recv_from(&mut buf).await?;
            let line = String::from_utf8_lossy(&buf[..len]).trim().to_string();
            self.counters.requests += 1;
            debug!(%sender, %line, "control request");
            self.dispatch(&socket, &line, sender).await?;
            trace!(
                requests = self.counters.requests,
                failures = self.counters.failures,
                copies = self.counters.copies,
                reads = self.counters.reads,
                repairs = self.counters.repairs,
                decommissions = self.counters.decommissions,
            );
        }
    }

    async fn dispatch(
        &mut self,
        socket: &UdpSocket,
        line: &str,
        sender: SocketAddr,
    ) -> crate::Result<()> {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(error) => return self.reply(socket, sender, &failure(error)).await,
        };

        match request {
            Request::Copy { file, size, owner } => {
                self.run_copy(socket, sender, file, size, owner).await
            }
            Request::DiskFailure { dss } => self.run_disk_failure(socket, sender, dss).await,
            Request::DecommissionDss { name } => {
                self.run_decommission(socket, sender, name).await
            }
            Request::RegisterUser {
                name,
                ip,
                mport,
                cport,
            } => {
                let result = self
                    .registry
                    .register_user(&name, Endpoint { ip, mport, cport });
                self.reply(socket, sender, &reply_of(result)).await
            }
            Request::RegisterDisk {
                name,
                ip,
                mport,
                cport,
            } => {
                let result = self
                    .registry
                    .register_disk(&name, Endpoint { ip, mport, cport });
                self.reply(socket, sender, &reply_of(result)).await
            }
            Request::DeregisterUser { name } => {
                let result = self.registry.deregister_user(&name);
                self.reply(socket, sender, &reply_of(result)).await
            }
            Request::DeregisterDisk { name } => {
                let result = self.registry.deregister_disk(&name);
                self.reply(socket, sender, &reply_of(result)).await
            }
            Request::ConfigureDss { name, drives, unit } => {
                let reply = match self.registry.configure_dss(&name, drives, unit) {
                    Ok(record) => {
                        info!(%name, drives, unit, disks = ?record.disks, "DSS configured");
                        SUCCESS.to_string()
                    }
                    Err(error) => failure(error),
                };
                self.reply(socket, sender, &reply).await
            }
            Request::Ls => {
                let listing = self.list();
                self.reply(socket, sender, &listing).await
            }
            Request::Read { user, file } => {
                let located = self
                    .registry
                    .locate_file(&file)
                    .map(|(dss, _, record)| (dss.to_string(), record.size));
                let reply = match located {
                    Some((dss, size)) => {
                        let view = self.view_of(&dss).expect("located DSS exists");
                        self.counters.reads += 1;
                        debug!(%user, %file, %dss, "read descriptor issued");
                        format_read_descriptor(size, &view)
                    }
                    None => failure(RegistryError::UnknownFile { file }),
                };
                self.reply(socket, sender, &reply).await
            }
            Request::CopyComplete | Request::RecoveryComplete | Request::DecommissionComplete => {
                self.reply(socket, sender, &failure("no operation is pending"))
                    .await
            }
        }
    }

    /// `copy` phase 1: pick a DSS uniformly at random, stage the file on it,
    /// hand the descriptor out. Phase 2 commits or abandons.
    async fn run_copy(
        &mut self,
        socket: &UdpSocket,
        sender: SocketAddr,
        file: String,
        size: u64,
        owner: String,
    ) -> crate::Result<()> {
        let staged = self.stage_copy(&file, size, &owner);
        let (dss, descriptor) = match staged {
            Ok(staged) => staged,
            Err(error) => return self.reply(socket, sender, &failure(error)).await,
        };
        self.reply(socket, sender, &descriptor).await?;

        match await_followup(socket, sender, FOLLOWUP_TIMEOUT).await? {
            Some(line) if line == "copy-complete" => {
                self.registry
                    .commit_copy(&dss)
                    .expect("staged copy is pending");
                self.counters.copies += 1;
                info!(%file, size, %owner, %dss, "copy committed");
                self.reply(socket, sender, SUCCESS).await
            }
            Some(line) => {
                self.registry.abandon_copy(&dss);
                warn!(message = "Copy abandoned by client.", %file, got = %line);
                self.reply(socket, sender, &failure("expected copy-complete"))
                    .await
            }
            None => {
                // The client's data-plane writes may have landed; without the
                // commit they are unrecorded, which we report and do not heal.
                self.registry.abandon_copy(&dss);
                warn!(
                    message = "No copy-complete within the window, copy abandoned.",
                    %file, %dss,
                );
                Ok(())
            }
        }
    }

    fn stage_copy(
        &mut self,
        file: &str,
        size: u64,
        owner: &str,
    ) -> Result<(String, String), RegistryError> {
        let dss = {
            let names = self.registry.dss_names();
            if names.is_empty() {
                return Err(RegistryError::NoDss);
            }
            names[thread_rng().gen_range(0..names.len())].to_string()
        };
        self.registry.stage_copy(
            &dss,
            FileRecord {
                name: file.to_string(),
                size,
                owner: owner.to_string(),
            },
        )?;
        let descriptor = self.view_of(&dss).expect("staged DSS exists").descriptor();
        Ok((dss, descriptor))
    }

    async fn run_disk_failure(
        &mut self,
        socket: &UdpSocket,
        sender: SocketAddr,
        dss: String,
    ) -> crate::Result<()> {
        let descriptor = match self.view_of(&dss) {
            Ok(view) => {
                let files: Vec<String> = self
                    .registry
                    .dss(&dss)
                    .expect("viewed DSS exists")
                    .files
                    .iter()
                    .map(|file| file.name.clone())
                    .collect();
                format_repair_descriptor(&view, &files)
            }
            Err(error) => return self.reply(socket, sender, &failure(error)).await,
        };
        self.reply(socket, sender, &descriptor).await?;

        match await_followup(socket, sender, FOLLOWUP_TIMEOUT).await? {
            Some(line) if line == "recovery-complete" => {
                self.counters.repairs += 1;
                info!(%dss, "reconstruction acknowledged");
                self.reply(socket, sender, SUCCESS).await
            }
            Some(line) => {
                warn!(message = "Unexpected follow-up to disk-failure.", got = %line);
                self.reply(socket, sender, &failure("expected recovery-complete"))
                    .await
            }
            None => {
                warn!(message = "No recovery-complete within the window.", %dss);
                Ok(())
            }
        }
    }

    async fn run_decommission(
        &mut self,
        socket: &UdpSocket,
        sender: SocketAddr,
        name: String,
    ) -> crate::Result<()> {
        let descriptor = match self.view_of(&name) {
            Ok(view) => view.descriptor(),
            Err(error) => return self.reply(socket, sender, &failure(error)).await,
        };
        self.reply(socket, sender, &descriptor).await?;

        match await_followup(socket, sender, FOLLOWUP_TIMEOUT).await? {
            Some(line) if line == "decommission-complete" => {
                self.registry
                    .decommission(&name)
                    .expect("existed at phase 1");
                self.counters.decommissions += 1;
                info!(%name, "DSS decommissioned");
                self.reply(socket, sender, SUCCESS).await
            }
            Some(line) => {
                warn!(message = "Unexpected follow-up to decommission-dss.", got = %line);
                self.reply(socket, sender, &failure("expected decommission-complete"))
                    .await
            }
            None => {
                warn!(message = "No decommission-complete within the window.", %name);
                Ok(())
            }
        }
    }

    fn list(&self) -> String {
        use std::fmt::Write as _;

        if !self.registry.has_dss() {
            return failure(RegistryError::NoDss);
        }
        let mut out = String::from(SUCCESS);
        for (name, dss) in self.registry.dsses() {
            let _ = write!(out, "\n{name} {} {}", dss.disks.len(), dss.unit);
            for disk in &dss.disks {
                let _ = write!(out, " {disk}");
            }
            for file in &dss.files {
                let _ = write!(out, "\n{} {} {}", file.name, file.size, file.owner);
            }
        }
        out
    }

    fn view_of(&self, name: &str) -> Result<DssView, RegistryError> {
        let record = self.registry.dss(name)?;
        let disks = record
            .disks
            .iter()
            .map(|disk_name| {
                let disk = self
                    .registry
                    .disk(disk_name)
                    .expect("DSS member disks are registered");
                DiskAddr {
                    name: disk_name.clone(),
                    addr: SocketAddr::new(disk.endpoint.ip, disk.endpoint.cport),
                }
            })
            .collect();
        Ok(DssView {
            name: name.to_string(),
            unit: record.unit,
            disks,
        })
    }

    async fn reply(
        &mut self,
        socket: &UdpSocket,
        sender: SocketAddr,
        text: &str,
    ) -> crate::Result<()> {
        if control::is_failure(text) {
            self.counters.failures += 1;
            debug!(%sender, reply = %text, "refused");
        }
        socket.send_to(text.as_bytes(), sender).await?;
        Ok(())
    }
}

fn reply_of<T>(result: Result<T, RegistryError>) -> String {
    match result {
        Ok(_) => SUCCESS.to_string(),
        Err(error) => failure(error),
    }
}

/// Block for the phase-2 datagram from `from`, telling everyone else to come
/// back later. `None` means the window timed out.
async fn await_followup(
    socket: &UdpSocket,
    from: SocketAddr,
    wait: Duration,
) -> crate::Result<Option<String>> {
    let mut buf = vec![0u8; CONTROL_BUF];
    let outcome = timeout(wait, async {
        loop {
            let (len, sender) = socket.recv_from(&mut buf).await?;
            if sender == from {
                return Ok::<_, std::io::Error>(
                    String::from_utf8_lossy(&buf[..len]).trim().to_string(),
                );
            }
            let _ = socket
                .send_to(failure("manager busy").as_bytes(), sender)
                .await;
        }
    })
    .await;

    match outcome {
        Ok(Ok(line)) => Ok(Some(line)),
        Ok(Err(source)) => Err(source.into()),
        Err(_elapsed) => Ok(None),
    }
}
