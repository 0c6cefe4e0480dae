//! TCP accept loop: one [`Connection`] task per accepted socket (spec §4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::debugger::Debugger;
use crate::error::Result;

/// Accepts TCP connections and spawns a [`Connection`] dispatch task for
/// each. Tracks active connections so `stop` can signal all of them before
/// the listener is dropped.
pub struct Server {
    config: Config,
    debugger: Arc<dyn Debugger>,
    running: AtomicBool,
    connections: Mutex<Vec<Arc<Connection<tokio::net::TcpStream>>>>,
}

impl Server {
    pub fn new(config: Config, debugger: Arc<dyn Debugger>) -> Self {
        Self {
            config,
            debugger,
            running: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Binds the listening socket and accepts connections until `stop` is
    /// called or the listener errors.
    #[tracing::instrument(name = "gdb::server", skip(self))]
    pub async fn run(&self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.listen.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "listening for gdb connections");
        self.running.store(true, Ordering::Relaxed);

        while self.running.load(Ordering::Relaxed) {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            info!(%peer, "accepted connection");

            let connection = Arc::new(Connection::new(
                socket,
                peer.to_string(),
                self.debugger.clone(),
                self.config.transport.packet_size,
                self.config.transport.transport_size,
                self.config.timeout(),
                self.config.ack_mode,
                self.config.transport.allow_inbound_rle,
            ));
            self.connections.lock().await.push(connection.clone());

            tokio::spawn(async move {
                if let Err(e) = connection.run().await {
                    warn!(error = %e, "connection exited with error");
                }
            });
        }
        Ok(())
    }

    /// Signals every active connection to stop and marks the accept loop for
    /// exit at its next iteration.
    pub async fn stop(&self) {
        info!("stopping server");
        self.running.store(false, Ordering::Relaxed);
        let mut connections = self.connections.lock().await;
        for connection in connections.iter() {
            connection.stop().await;
        }
        connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::NullDebugger;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepts_a_connection_and_answers_stop_reason() {
        let mut config = Config::default();
        config.listen.port = 0;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        config.listen.port = port;

        let server = Arc::new(Server::new(config, Arc::new(NullDebugger)));
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let mut client = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };

        client.write_all(b"$?#3f").await.unwrap();
        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [b'+']);

        let mut resp = [0u8; 64];
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], b"$S05#b8");

        server.stop().await;
        server_task.abort();
    }
}
