//! A small distributed storage service in the RAID-5 style: files are split
//! into fixed-size blocks, striped across `n >= 3` storage nodes with one
//! rotating parity block per stripe, and can be read back, repaired after a
//! simulated disk loss, and torn down. Three roles cooperate over UDP: the
//! manager (metadata authority), the storage nodes (block-serving peers), and
//! the client (command driver plus the striping engine).

#![deny(unused_must_use)]

pub mod cli;
pub mod client;
pub mod manager;
pub mod net;
pub mod node;
pub mod protocol;
pub mod raid;
pub mod test_util;
pub mod trace;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;
