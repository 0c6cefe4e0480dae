//! This example shows basic usage of the async TCP-based gdb server.

use std::sync::Arc;

use gdbstub_rsp::{Config, NullDebugger, Server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut config = Config::default();
    config.listen.port = 9001;

    let server = Server::new(config, Arc::new(NullDebugger));
    if let Err(e) = server.run().await {
        eprintln!("server exited: {e}");
    }
}
