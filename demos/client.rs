//! Minimal console client for a running streamgate instance.
//!
//! Connects, answers the password prompt and sends one line, printing
//! everything the server returns. Address and password come from the
//! command line: `cargo run --example client -- 127.0.0.1:10303 change-me`.

use std::env;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:10303".to_string());
    let password = args.next().unwrap_or_else(|| "change-me".to_string());

    let mut stream = TcpStream::connect(&addr).await.expect("failed to connect");
    println!("connected to {addr}");

    stream
        .write_all(format!("{password}\r\n").as_bytes())
        .await
        .expect("failed to send password");
    stream
        .write_all(b"hello\r\n")
        .await
        .expect("failed to send message");

    let mut buf = [0u8; 512];
    loop {
        match timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => print!("{}", String::from_utf8_lossy(&buf[..n])),
            Ok(Err(e)) => {
                eprintln!("read error: {e}");
                break;
            }
        }
    }
    println!();
}
