//! # Connect Example
//!
//! Opens a connection to a SignalR endpoint and prints every connection
//! event until interrupted.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example connect -- http://localhost:5000/chat
//! ```

use std::sync::Arc;

use signalr_client::{
    HttpConnection, HttpConnectionDelegate, HttpConnectionOptions, SignalRError,
};
use url::Url;

struct PrintDelegate;

impl HttpConnectionDelegate for PrintDelegate {
    fn connection_did_open(&self, connection_id: Option<String>) {
        println!("open (connection id: {connection_id:?})");
    }

    fn connection_did_fail_to_open(&self, error: SignalRError) {
        println!("failed to open: {error}");
    }

    fn connection_did_receive_data(&self, data: Vec<u8>) {
        println!("received {} bytes: {}", data.len(), String::from_utf8_lossy(&data));
    }

    fn connection_did_close(&self, error: Option<SignalRError>) {
        match error {
            Some(error) => println!("closed with error: {error}"),
            None => println!("closed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:5000/chat".to_owned());

    let connection = HttpConnection::new(Url::parse(&endpoint)?, HttpConnectionOptions::new());
    let delegate: Arc<dyn HttpConnectionDelegate> = Arc::new(PrintDelegate);
    connection.set_delegate(Arc::downgrade(&delegate));

    connection.start().await;
    println!("press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    connection.stop(None).await;
    Ok(())
}
