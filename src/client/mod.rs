//! The client: user-facing command driver and the half of the system that
//! does the actual RAID math. Control commands go to the manager; once a
//! descriptor comes back, the data plane talks straight to the storage nodes.

mod fault;
mod read;
mod repair;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use futures::future::join_all;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::AsyncBufReadExt;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::net::{self, CONTROL_BUF, REPLY_TIMEOUT};
use crate::protocol::control::{self, DescriptorError, DssView};
use crate::protocol::peer::PeerRequest;
use crate::raid;

pub use read::READ_ATTEMPTS;

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("socket error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("{source}"))]
    Net { source: net::NetError },

    #[snafu(display("manager refused: {reply}"))]
    ManagerRefused { reply: String },

    #[snafu(display("malformed manager reply: {source}"))]
    BadDescriptor { source: DescriptorError },

    #[snafu(display("cannot copy {}: {source}", path.display()))]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{} is empty", path.display()))]
    EmptySource { path: PathBuf },

    #[snafu(display("{} has no usable file name", path.display()))]
    BadSourceName { path: PathBuf },

    #[snafu(display("stripe {stripe} failed after {attempts} attempts"))]
    StripeFailed { stripe: u64, attempts: usize },

    #[snafu(display("node {node} did not answer"))]
    NodeUnavailable { node: String },

    #[snafu(display("node {node} did not acknowledge the simulated failure"))]
    FailNotAcknowledged { node: String },

    #[snafu(display("could not write {}: {source}", path.display()))]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct Client {
    control: UdpSocket,
    peer: UdpSocket,
    manager: SocketAddr,
}

impl Client {
    /// Bind the two local sockets: `control` speaks to the manager, `peer`
    /// speaks to storage nodes.
    pub async fn bind(
        control: SocketAddr,
        peer: SocketAddr,
        manager: SocketAddr,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            control: UdpSocket::bind(control).await.context(IoSnafu)?,
            peer: UdpSocket::bind(peer).await.context(IoSnafu)?,
            manager,
        })
    }

    /// One control-plane round trip, reply returned verbatim.
    pub async fn command(&self, line: &str) -> Result<String, ClientError> {
        let reply = net::request(
            &self.control,
            self.manager,
            line.as_bytes(),
            CONTROL_BUF,
            REPLY_TIMEOUT,
        )
        .await
        .context(NetSnafu)?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    fn expect_success(reply: String) -> Result<(), ClientError> {
        if control::is_success(&reply) {
            Ok(())
        } else {
            Err(ClientError::ManagerRefused { reply })
        }
    }

    /// Copy a local file onto whichever DSS the manager picks. Metadata is
    /// only committed once every stripe has been dispatched and the manager
    /// has acknowledged `copy-complete`.
    pub async fn copy(&self, path: &Path, owner: &str) -> Result<DssView, ClientError> {
        let metadata = tokio::fs::metadata(path).await.context(SourceSnafu { path })?;
        let size = metadata.len();
        if size == 0 {
            return EmptySourceSnafu { path }.fail();
        }
        let file = path
            .file_name()
            .and_then(|name| name.to_str())
            .context(BadSourceNameSnafu { path })?
            .to_string();
        let data = tokio::fs::read(path).await.context(SourceSnafu { path })?;

        let reply = self.command(&format!("copy {file} {size} {owner}")).await?;
        if control::is_failure(&reply) {
            return Err(ClientError::ManagerRefused { reply });
        }
        let view = DssView::parse(&reply).context(BadDescriptorSnafu)?;
        info!(
            %file,
            size,
            dss = %view.name,
            drives = view.disks.len(),
            unit = view.unit,
            "copying",
        );

        self.write_file(&view, &file, &data).await?;

        Self::expect_success(self.command("copy-complete").await?)?;
        info!(%file, "copy committed");
        Ok(view)
    }

    /// Stripe `data` across the DSS. Within one stripe the writes fan out in
    /// parallel; stripe k+1 is not touched until every send for stripe k has
    /// returned. Nodes do not acknowledge writes.
    async fn write_file(
        &self,
        view: &DssView,
        file: &str,
        data: &[u8],
    ) -> Result<(), ClientError> {
        let geometry = view.geometry();
        let stripes = geometry.stripe_count(data.len() as u64);
        debug!(
            data_blocks = geometry.data_blocks(),
            stripe_bytes = geometry.stripe_bytes(),
            stripes,
            "striping plan",
        );

        for stripe in 0..stripes {
            let start = stripe as usize * geometry.stripe_bytes();
            let end = data.len().min(start + geometry.stripe_bytes());
            let blocks = raid::split_stripe(&geometry, &data[start..end]);
            let parity = raid::xor_blocks(&blocks, geometry.unit);
            let placed = raid::layout_stripe(&geometry, stripe, blocks, parity);

            let sends = placed
                .into_iter()
                .zip(&view.disks)
                .map(|((role, payload), disk)| {
                    let frame = PeerRequest::Write {
                        file: file.to_string(),
                        stripe,
                        role,
                        payload,
                    }
                    .encode();
                    let addr = disk.addr;
                    async move { self.peer.send_to(&frame, addr).await }
                });
            for sent in join_all(sends).await {
                sent.context(IoSnafu)?;
            }
            trace!(stripe, "stripe dispatched");
        }
        Ok(())
    }

    /// Tear a DSS down: `DELETE` to every node, then let the manager forget
    /// it.
    pub async fn decommission(&self, name: &str) -> Result<(), ClientError> {
        let reply = self.command(&format!("decommission-dss {name}")).await?;
        if control::is_failure(&reply) {
            return Err(ClientError::ManagerRefused { reply });
        }
        let view = DssView::parse(&reply).context(BadDescriptorSnafu)?;

        let frame = PeerRequest::Delete {
            dss: name.to_string(),
        }
        .encode();
        for disk in &view.disks {
            self.peer
                .send_to(&frame, disk.addr)
                .await
                .context(IoSnafu)?;
            debug!(disk = %disk.name, "delete sent");
        }

        Self::expect_success(self.command("decommission-complete").await?)?;
        info!(%name, "DSS decommissioned");
        Ok(())
    }
}

/// The interactive driver: one command per line, `exit` quits. Commands the
/// client has no special handling for are forwarded to the manager verbatim
/// and the reply printed.
pub async fn repl(client: Client) -> crate::Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    println!("stripestore client ready; `exit` quits");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") {
            break;
        }
        match dispatch(&client, line).await {
            Ok(output) => println!("{output}"),
            Err(error) => eprintln!("error: {error}"),
        }
    }
    Ok(())
}

async fn dispatch(client: &Client, line: &str) -> Result<String, ClientError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        // The size argument is accepted for compatibility but the on-disk
        // size is what gets sent.
        ["copy", path, _size, owner] => {
            let view = client.copy(Path::new(path), owner).await?;
            Ok(format!("copied onto {}", view.name))
        }
        ["copy", ..] => Ok("usage: copy <filename> <size> <owner>".to_string()),
        ["read", user, file] => run_read(client, user, file, 0).await,
        ["read", user, file, error_p] => match error_p.parse::<u8>() {
            Ok(error_p) if error_p <= 100 => run_read(client, user, file, error_p).await,
            _ => Ok("usage: read <user> <filename> [error-p 0..=100]".to_string()),
        },
        ["read", ..] => Ok("usage: read <user> <filename> [error-p 0..=100]".to_string()),
        ["disk-failure", dss] => {
            let victim = client.disk_failure(dss).await?;
            Ok(format!("drive {victim} failed and reconstructed"))
        }
        ["decommission-dss", name] => {
            client.decommission(name).await?;
            Ok(format!("{name} decommissioned"))
        }
        _ => client.command(line).await,
    }
}

async fn run_read(
    client: &Client,
    user: &str,
    file: &str,
    error_p: u8,
) -> Result<String, ClientError> {
    let bytes = client.read(user, file, error_p, Path::new(".")).await?;
    Ok(format!("read {} bytes into read-{file}", bytes.len()))
}
