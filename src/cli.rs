//! Command-line surface. One binary, one subcommand per role. Service ports
//! live in the assigned range [13100, 13199]; anything else is an argument
//! error before a socket is ever touched.

use std::net::IpAddr;
use std::ops::RangeInclusive;

use clap::{Parser, Subcommand};

pub const PORT_RANGE: RangeInclusive<u16> = 13100..=13199;

#[derive(Debug, Parser)]
#[command(name = "stripestore", about, version)]
pub struct Opts {
    /// Tracing filter when RUST_LOG is unset, e.g. "info" or "stripestore=debug".
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the metadata manager.
    Manager {
        /// Control-plane port.
        #[arg(value_parser = service_port)]
        port: u16,

        /// Address to bind on.
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,
    },

    /// Run a storage node and register it with the manager.
    Node {
        /// Node name, at most 15 characters.
        name: String,

        /// Management port (used to dial the manager).
        #[arg(value_parser = service_port)]
        m_port: u16,

        /// Manager IP address.
        manager_ip: IpAddr,

        /// Manager port.
        #[arg(value_parser = service_port)]
        manager_port: u16,

        /// Peer port serving block requests.
        #[arg(value_parser = service_port)]
        c_port: u16,

        /// Address to bind both sockets on.
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Address other peers should dial, as registered with the manager.
        #[arg(long, default_value = "127.0.0.1")]
        advertise: IpAddr,
    },

    /// Run the interactive client.
    Client {
        /// Control port for talking to the manager.
        #[arg(value_parser = service_port)]
        c_port: u16,

        /// Manager IP address.
        manager_ip: IpAddr,

        /// Manager port.
        #[arg(value_parser = service_port)]
        manager_port: u16,

        /// Peer port for talking to storage nodes.
        #[arg(value_parser = service_port)]
        peer_port: u16,
    },
}

fn service_port(value: &str) -> Result<u16, String> {
    let port: u16 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a port number"))?;
    if PORT_RANGE.contains(&port) {
        Ok(port)
    } else {
        Err(format!(
            "port {port} is outside {}-{}",
            PORT_RANGE.start(),
            PORT_RANGE.end()
        ))
    }
}
