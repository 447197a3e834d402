//! In-memory peer for driving an [`RpcChannel`] in unit tests.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

use crate::transport::RpcChannel;

/// The peer's side of a duplex channel: requests in, responses out.
pub(crate) struct PeerEnd {
    pub lines: Lines<BufReader<DuplexStream>>,
    pub out: DuplexStream,
}

impl PeerEnd {
    pub async fn next_request(&mut self) -> Value {
        self.next_request_opt()
            .await
            .expect("client closed its end before sending a request")
    }

    pub async fn next_request_opt(&mut self) -> Option<Value> {
        let line = self.lines.next_line().await.unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    pub async fn send_line(&mut self, line: &str) {
        self.out.write_all(line.as_bytes()).await.unwrap();
        self.out.write_all(b"\n").await.unwrap();
        self.out.flush().await.unwrap();
    }

    /// Keep both pipes open without ever answering.
    pub async fn hold_open(self) {
        let _peer = self;
        std::future::pending::<()>().await;
    }
}

pub(crate) fn duplex_channel(
    read_timeout: Option<Duration>,
) -> (RpcChannel<DuplexStream, DuplexStream>, PeerEnd) {
    let (client_out, peer_in) = tokio::io::duplex(64 * 1024);
    let (peer_out, client_in) = tokio::io::duplex(64 * 1024);
    let channel = RpcChannel::new(client_in, client_out, read_timeout);
    let peer = PeerEnd {
        lines: BufReader::new(peer_in).lines(),
        out: peer_out,
    };
    (channel, peer)
}
