//! Telnet-style console gate built on the streamgate runtime.
//!
//! Accepts raw TCP connections, gates them behind a shared password, echoes
//! an acknowledgement for every line and understands two commands: `close`
//! (drop your own session) and `stop` (shut the whole service down). A
//! presence announcer broadcasts the service version alongside.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

use streamgate::announcer::Announcer;
use streamgate::config::ServerConfig;
use streamgate::server::{ClientHandle, Server, ServerEvents, ServerReason};

const PROMPT: &[u8] = b"user@streamgate:$ ";
const RESPONSE: &[u8] = b"Ok\n";
const CLOSE_MESSAGE: &[u8] = b"Connection closed.\n";
const STOP_MESSAGE: &[u8] = b"Server stopping.\n";

/// Console observer: password gate plus a tiny line-command vocabulary.
struct ConsoleGate {
    password: String,
    stop: Arc<Notify>,
}

impl ConsoleGate {
    /// Strips trailing control bytes (CR/LF and telnet padding) before
    /// comparing entered passwords.
    fn trimmed(data: &[u8]) -> &[u8] {
        let mut end = data.len();
        while end > 0 && data[end - 1] < 32 {
            end -= 1;
        }
        &data[..end]
    }
}

impl ServerEvents for ConsoleGate {
    fn on_start_listening(&self, server: &Server) {
        info!(addr = ?server.local_addr(), "listener started");
    }

    fn on_client_connect(&self, server: &Server, handle: ClientHandle) {
        info!(handle, "client connected");
        let _ = server.send_to_client(handle, PROMPT);
    }

    fn on_client_disconnect(&self, _server: &Server, handle: ClientHandle) {
        info!(handle, "client disconnected");
    }

    fn on_client_receive_data(&self, server: &Server, handle: ClientHandle, data: &[u8]) {
        let line = Self::trimmed(data);
        info!(handle, line = %String::from_utf8_lossy(line), "received");
        let _ = server.send_to_client(handle, RESPONSE);
        match line {
            b"close" => {
                let _ = server.send_to_client(handle, CLOSE_MESSAGE);
                let _ = server.close_client(handle);
            }
            b"stop" => {
                let _ = server.send_to_client(handle, STOP_MESSAGE);
                self.stop.notify_one();
            }
            _ => {
                let _ = server.send_to_client(handle, PROMPT);
            }
        }
    }

    fn on_update(&self, _server: &Server, reason: ServerReason, os_error: i32) {
        info!(?reason, os_error, "server update");
    }

    fn on_password_entered(&self, _server: &Server, handle: ClientHandle, data: &[u8]) -> bool {
        let ok = Self::trimmed(data) == self.password.as_bytes();
        if !ok {
            info!(handle, "password rejected");
        }
        ok
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env()?;
    config.validate()?;
    let password = std::env::var("SG_PASSWORD").unwrap_or_else(|_| "change-me".to_string());

    let stop = Arc::new(Notify::new());
    let gate = Arc::new(ConsoleGate {
        password,
        stop: Arc::clone(&stop),
    });

    let announcer = Announcer::new(config.announcer());
    announcer.start();
    if let Err(e) = announcer.renew(true, Some(Ipv4Addr::UNSPECIFIED)) {
        warn!(error = %e, "presence announcements unavailable");
    }

    let server = Server::new(config, gate);
    server.start();

    tokio::select! {
        _ = signal::ctrl_c() => info!("interrupt received"),
        _ = stop.notified() => info!("stop command received"),
    }

    server.stop().await;
    let _ = announcer.renew(false, None);
    announcer.stop().await;

    Ok(())
}
