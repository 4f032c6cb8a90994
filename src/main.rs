use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use stripestore::cli::{Command, Opts};
use stripestore::node::Registration;
use stripestore::{client, manager, net, node, trace};

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    trace::init(&opts.log_level);

    match run(opts.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> stripestore::Result<()> {
    match command {
        Command::Manager { port, bind } => {
            let socket = net::bind(SocketAddr::new(bind, port)).await?;
            info!(addr = %socket.local_addr()?, "manager listening");
            manager::run(socket).await
        }
        Command::Node {
            name,
            m_port,
            manager_ip,
            manager_port,
            c_port,
            bind,
            advertise,
        } => {
            let management = net::bind(SocketAddr::new(bind, m_port)).await?;
            let peer = net::bind(SocketAddr::new(bind, c_port)).await?;

            let manager_addr = SocketAddr::new(manager_ip, manager_port);
            let registration = Registration {
                name,
                ip: advertise,
                mport: m_port,
                cport: c_port,
            };
            node::register(&management, manager_addr, &registration).await?;

            info!(addr = %peer.local_addr()?, "serving blocks");
            node::run(peer).await?;
            Ok(())
        }
        Command::Client {
            c_port,
            manager_ip,
            manager_port,
            peer_port,
        } => {
            let manager_addr = SocketAddr::new(manager_ip, manager_port);
            let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
            let client = client::Client::bind(
                SocketAddr::new(any, c_port),
                SocketAddr::new(any, peer_port),
                manager_addr,
            )
            .await?;
            client::repl(client).await
        }
    }
}
