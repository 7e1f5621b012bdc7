use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use log::{error, info, logger, warn, Level};
use tokio::time::Instant;
use udpconn_log::UdpConnLogger;
use udpconn_proto::{Connection, ConnectionFactory, ConnectionHandler, Server};

pub mod config;

/// Sample application handler: echoes every payload it receives back to the
/// peer over the same connection. `connection` is populated via `attach`
/// once the Server has constructed the `Connection` this handler belongs to,
/// giving `on_new_packet` a way to send data on its own initiative.
struct EchoHandler {
    remote: SocketAddr,
    connection: Weak<Connection>,
}

impl ConnectionHandler for EchoHandler {
    fn attach(&mut self, connection: Weak<Connection>) {
        self.connection = connection;
    }

    fn on_connected(&mut self) {
        info!("{}: connected", self.remote);
    }

    fn on_disconnected(&mut self) {
        info!("{}: disconnected", self.remote);
    }

    fn on_new_packet(&mut self, payload: &[u8]) {
        info!("{}: received {} byte payload, echoing back", self.remote, payload.len());

        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let remote = self.remote;
        let payload = payload.to_vec();
        tokio::spawn(async move {
            if connection.send(&[payload]).await != udpconn_proto::SendStatus::Ok {
                warn!("{remote}: echo did not complete");
            }
        });
    }
}

struct EchoFactory;

impl ConnectionFactory for EchoFactory {
    fn create(&self, remote: SocketAddr) -> Box<dyn ConnectionHandler> {
        Box::new(EchoHandler {
            remote,
            connection: Weak::new(),
        })
    }
}

#[tokio::main]
async fn main() {
    UdpConnLogger::init(Level::Info).expect("failed to install logger");

    let start_time = Instant::now();

    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let server = match Server::bind(&config.network.address, Arc::new(EchoFactory)).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind {}: {e}", config.network.address);
            std::process::exit(1);
        }
    };

    info!(
        "{} listening on {} (startup took {:.2}s)",
        config.server.name,
        server.local_addr().expect("bound socket has a local address"),
        start_time.elapsed().as_secs_f64()
    );

    if let Err(e) = server.run().await {
        error!("server loop terminated: {e}");
    }

    logger().flush();
}
