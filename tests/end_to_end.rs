//! Whole-system scenarios over loopback UDP: a real manager, real storage
//! nodes, and the library client driving them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use similar_asserts::assert_eq;
use tempfile::TempDir;
use tokio::net::UdpSocket;

use stripestore::client::Client;
use stripestore::net;
use stripestore::protocol::peer::{PeerRequest, BLOCK_NOT_FOUND, MAX_DATAGRAM};
use stripestore::test_util::{next_addr, random_payload, spawn_manager, spawn_node, trace_init};

const UNIT: usize = 128;

struct Cluster {
    client: Client,
    nodes: Vec<SocketAddr>,
    dir: TempDir,
    probe: UdpSocket,
}

impl Cluster {
    /// Manager plus `disks` registered storage nodes, no DSS yet.
    async fn start(disks: usize) -> Self {
        trace_init();
        let manager = spawn_manager().await;
        let client = Client::bind(next_addr(), next_addr(), manager)
            .await
            .expect("bind client");

        let mut nodes = Vec::new();
        for i in 0..disks {
            let peer = spawn_node().await;
            let mport = next_addr().port();
            let line = format!("register-disk d{i} {} {mport} {}", peer.ip(), peer.port());
            assert_eq!(client.command(&line).await.unwrap(), "SUCCESS");
            nodes.push(peer);
        }

        Cluster {
            client,
            nodes,
            dir: TempDir::new().expect("scratch dir"),
            probe: UdpSocket::bind(next_addr()).await.expect("bind probe"),
        }
    }

    async fn configure(&self, name: &str, drives: usize, unit: usize) {
        let line = format!("configure-dss {name} {drives} {unit}");
        assert_eq!(self.client.command(&line).await.unwrap(), "SUCCESS");
    }

    /// Drop a random file of `len` bytes into the scratch dir.
    fn source_file(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data = random_payload(len);
        let path = self.dir.path().join(name);
        std::fs::write(&path, &data).expect("write source");
        (path, data)
    }

    /// Raw block fetch straight off a node, bypassing the client.
    async fn fetch_block(&self, drive: usize, file: &str, stripe: u64) -> Option<Vec<u8>> {
        let frame = PeerRequest::Read {
            file: file.to_string(),
            stripe,
            drive,
        }
        .encode();
        let reply = net::request(
            &self.probe,
            self.nodes[drive],
            &frame,
            MAX_DATAGRAM,
            Duration::from_secs(2),
        )
        .await
        .expect("node reply");
        if &reply[..] == BLOCK_NOT_FOUND {
            None
        } else {
            Some(reply.to_vec())
        }
    }
}

/// Independent oracle for the expected on-disk bytes: pad a source slice to
/// the striping unit.
fn pad(source: &[u8], unit: usize) -> Vec<u8> {
    let mut block = source.to_vec();
    block.resize(unit, 0);
    block
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

fn slice(data: &[u8], start: usize, end: usize) -> &[u8] {
    &data[start.min(data.len())..end.min(data.len())]
}

#[tokio::test]
async fn s1_trivial_copy_round_trips() {
    let cluster = Cluster::start(3).await;
    cluster.configure("D", 3, UNIT).await;
    let (path, data) = cluster.source_file("foo", 200);

    cluster.client.copy(&path, "u").await.expect("copy");

    // One stripe; parity sits on drive 2 and the data fills drives 0 and 1.
    let d0 = cluster.fetch_block(0, "foo", 0).await.unwrap();
    let d1 = cluster.fetch_block(1, "foo", 0).await.unwrap();
    let d2 = cluster.fetch_block(2, "foo", 0).await.unwrap();
    assert_eq!(d0, pad(slice(&data, 0, 128), UNIT));
    assert_eq!(d1, pad(slice(&data, 128, 256), UNIT));
    assert_eq!(d2, xor(&d0, &d1));
    assert!(cluster.fetch_block(0, "foo", 1).await.is_none());

    let got = cluster
        .client
        .read("u", "foo", 0, cluster.dir.path())
        .await
        .expect("read");
    assert_eq!(got, data);

    // The read also lands on disk, truncated to the declared size.
    let written = std::fs::read(cluster.dir.path().join("read-foo")).unwrap();
    assert_eq!(written, data);
}

#[tokio::test]
async fn s2_parity_rotates_across_stripes() {
    let cluster = Cluster::start(3).await;
    cluster.configure("D", 3, UNIT).await;
    let (path, data) = cluster.source_file("rot", 600);

    cluster.client.copy(&path, "u").await.expect("copy");

    // Stripe 0: parity on drive 2.
    let s0d0 = pad(slice(&data, 0, 128), UNIT);
    let s0d1 = pad(slice(&data, 128, 256), UNIT);
    assert_eq!(cluster.fetch_block(0, "rot", 0).await.unwrap(), s0d0);
    assert_eq!(cluster.fetch_block(1, "rot", 0).await.unwrap(), s0d1);
    assert_eq!(
        cluster.fetch_block(2, "rot", 0).await.unwrap(),
        xor(&s0d0, &s0d1)
    );

    // Stripe 1: parity rotates to drive 1; data fills drives 0 then 2.
    let s1d0 = pad(slice(&data, 256, 384), UNIT);
    let s1d2 = pad(slice(&data, 384, 512), UNIT);
    assert_eq!(cluster.fetch_block(0, "rot", 1).await.unwrap(), s1d0);
    assert_eq!(
        cluster.fetch_block(1, "rot", 1).await.unwrap(),
        xor(&s1d0, &s1d2)
    );
    assert_eq!(cluster.fetch_block(2, "rot", 1).await.unwrap(), s1d2);

    // Stripe 2: parity on drive 0; the tail pads with zeros.
    let s2d1 = pad(slice(&data, 512, 640), UNIT);
    let s2d2 = pad(&[], UNIT);
    assert_eq!(
        cluster.fetch_block(0, "rot", 2).await.unwrap(),
        xor(&s2d1, &s2d2)
    );
    assert_eq!(cluster.fetch_block(1, "rot", 2).await.unwrap(), s2d1);
    assert_eq!(cluster.fetch_block(2, "rot", 2).await.unwrap(), s2d2);

    let got = cluster
        .client
        .read("u", "rot", 0, cluster.dir.path())
        .await
        .expect("read");
    assert_eq!(got, data);
}

#[tokio::test]
async fn s3_reads_survive_injected_bit_errors() {
    let cluster = Cluster::start(3).await;
    cluster.configure("D", 3, UNIT).await;
    let (path, data) = cluster.source_file("noisy", 600);
    cluster.client.copy(&path, "u").await.expect("copy");

    // At 30% per block a whole read can exhaust its per-stripe retries, so a
    // trial is "keep reading until one read verifies". Every verified read
    // must reproduce the file.
    let mut successes = 0;
    let mut attempts = 0;
    while successes < 20 {
        attempts += 1;
        assert!(attempts < 200, "bit-error reads kept exhausting retries");
        match cluster
            .client
            .read("u", "noisy", 30, cluster.dir.path())
            .await
        {
            Ok(got) => {
                assert_eq!(got, data);
                successes += 1;
            }
            Err(error) => {
                let text = error.to_string();
                assert!(text.contains("stripe"), "unexpected failure: {text}");
            }
        }
    }
}

#[tokio::test]
async fn s4_failed_drive_reconstructs() {
    let cluster = Cluster::start(3).await;
    cluster.configure("D", 3, UNIT).await;
    let (path, data) = cluster.source_file("frail", 600);
    cluster.client.copy(&path, "u").await.expect("copy");

    let victim = cluster.client.disk_failure("D").await.expect("repair");
    assert!(victim < 3);

    // Every stripe on every drive is back and the stripe XOR is zero again.
    for stripe in 0..3 {
        let blocks: Vec<Vec<u8>> = {
            let mut blocks = Vec::new();
            for drive in 0..3 {
                blocks.push(cluster.fetch_block(drive, "frail", stripe).await.unwrap());
            }
            blocks
        };
        let zero = xor(&xor(&blocks[0], &blocks[1]), &blocks[2]);
        assert!(zero.iter().all(|byte| *byte == 0), "stripe {stripe}");
    }

    let got = cluster
        .client
        .read("u", "frail", 0, cluster.dir.path())
        .await
        .expect("read after repair");
    assert_eq!(got, data);
}

#[tokio::test]
async fn s5_decommission_frees_the_nodes() {
    let cluster = Cluster::start(3).await;
    cluster.configure("D", 3, UNIT).await;
    let (path, _) = cluster.source_file("bye", 200);
    cluster.client.copy(&path, "u").await.expect("copy");

    cluster.client.decommission("D").await.expect("decommission");

    // The nodes dropped their blocks and the manager forgot the DSS.
    assert!(cluster.fetch_block(0, "bye", 0).await.is_none());
    assert!(cluster
        .client
        .command("ls")
        .await
        .unwrap()
        .starts_with("FAILURE"));

    // All three disks are Free again, so the same name reconfigures.
    cluster.configure("D", 3, UNIT).await;
}

#[tokio::test]
async fn manager_refusals_surface_to_the_client() {
    let cluster = Cluster::start(3).await;
    cluster.configure("D", 3, UNIT).await;

    // Unknown file.
    let error = cluster
        .client
        .read("u", "ghost", 0, cluster.dir.path())
        .await
        .unwrap_err();
    assert!(error.to_string().contains("FAILURE"));

    // Duplicate filename across copies.
    let (path, _) = cluster.source_file("dup", 300);
    cluster.client.copy(&path, "u").await.expect("first copy");
    let error = cluster.client.copy(&path, "u").await.unwrap_err();
    assert!(error.to_string().contains("FAILURE"));

    // Empty sources never reach the manager.
    let empty = cluster.dir.path().join("void");
    std::fs::write(&empty, b"").unwrap();
    let error = cluster.client.copy(&empty, "u").await.unwrap_err();
    assert!(error.to_string().contains("empty"));
}

#[tokio::test]
async fn exact_fit_and_single_stripe_boundaries() {
    let cluster = Cluster::start(3).await;
    cluster.configure("D", 3, UNIT).await;

    // Exactly one full stripe: no padding, still a single stripe.
    let (path, data) = cluster.source_file("fit", 256);
    cluster.client.copy(&path, "u").await.expect("copy");
    assert!(cluster.fetch_block(0, "fit", 1).await.is_none());
    let got = cluster
        .client
        .read("u", "fit", 0, cluster.dir.path())
        .await
        .expect("read");
    assert_eq!(got, data);

    // A tiny file occupies one stripe with a zero-padded tail.
    let (path, data) = cluster.source_file("tiny", 5);
    cluster.client.copy(&path, "u").await.expect("copy");
    let d0 = cluster.fetch_block(0, "tiny", 0).await.unwrap();
    assert_eq!(d0, pad(&data, UNIT));
    let got = cluster
        .client
        .read("u", "tiny", 0, cluster.dir.path())
        .await
        .expect("read");
    assert_eq!(got, data);
}

#[tokio::test]
async fn five_drive_arrays_stripe_and_repair_too() {
    let cluster = Cluster::start(5).await;
    cluster.configure("wide", 5, 256).await;
    let (path, data) = cluster.source_file("big", 5000);
    cluster.client.copy(&path, "u").await.expect("copy");

    let got = cluster
        .client
        .read("u", "big", 0, cluster.dir.path())
        .await
        .expect("read");
    assert_eq!(got, data);

    cluster.client.disk_failure("wide").await.expect("repair");
    let got = cluster
        .client
        .read("u", "big", 0, cluster.dir.path())
        .await
        .expect("read after repair");
    assert_eq!(got, data);
}
