use std::net::SocketAddr;
use std::time::Duration;

use voicelink::{Server, ServerConfig};

fn main() {
    env_logger::init();
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:4242".to_string())
        .parse()
        .expect("listen address must be host:port");
    let server = Server::start(addr, ServerConfig::default()).expect("failed to start server");
    println!("voicelink server listening on {}", server.local_addr());
    loop {
        std::thread::sleep(Duration::from_secs(60));
        log::info!("{} connections", server.connection_count());
    }
}
