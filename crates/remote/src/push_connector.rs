//! Push channel over TCP: newline-delimited JSON frames `{"event": .., "payload": ..}`.
//!
//! The first frame written on every connection is a `join` carrying the identity
//! tuple and the bearer token. Reading and writing each run in their own task
//! and talk to the transport only through the channels of [`PushConnection`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use clinicsync_core::config::ChannelIdentity;
use clinicsync_core::errors::{Error, Result};
use clinicsync_core::transport::{
    PushConnection, PushConnector, PushFrame, EVENT_JOIN, PUSH_CHANNEL_CAPACITY,
};

use crate::auth::TokenProvider;

const CONNECT_TIMEOUT_SECS: u64 = 10;

pub struct TcpPushConnector {
    address: String,
    tokens: Arc<dyn TokenProvider>,
    connect_timeout: Duration,
}

impl TcpPushConnector {
    /// `address` is `host:port`; a leading `tcp://` is accepted.
    pub fn new(address: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        let address = address
            .trim()
            .trim_start_matches("tcp://")
            .trim_end_matches('/')
            .to_string();
        Self {
            address,
            tokens,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

fn encode_frame(frame: &PushFrame) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

async fn write_frames(mut writer: OwnedWriteHalf, mut outgoing: mpsc::Receiver<PushFrame>) {
    while let Some(frame) = outgoing.recv().await {
        let line = match encode_frame(&frame) {
            Ok(line) => line,
            Err(err) => {
                warn!("[Transport] Dropping unencodable frame {}: {}", frame.event, err);
                continue;
            }
        };
        if let Err(err) = writer.write_all(&line).await {
            warn!("[Transport] Write failed: {}", err);
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("[Transport] Writer finished");
}

async fn read_frames(reader: OwnedReadHalf, incoming: mpsc::Sender<PushFrame>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = incoming.closed() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PushFrame>(&line) {
                    Ok(frame) => {
                        if incoming.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("[Transport] Ignoring malformed frame: {}", err),
                }
            }
            Ok(None) => {
                debug!("[Transport] Server closed the channel");
                break;
            }
            Err(err) => {
                warn!("[Transport] Read failed: {}", err);
                break;
            }
        }
    }
}

#[async_trait]
impl PushConnector for TcpPushConnector {
    async fn connect(&self, identity: &ChannelIdentity) -> Result<PushConnection> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| Error::transport(format!("connect to {} timed out", self.address)))?
            .map_err(|e| Error::transport(format!("connect to {} failed: {}", self.address, e)))?;
        let (reader, mut writer) = stream.into_split();

        let join = PushFrame::new(
            EVENT_JOIN,
            json!({
                "businessId": identity.business_id,
                "userId": identity.user_id,
                "locationId": identity.location_id,
                "token": token,
            }),
        );
        writer
            .write_all(&encode_frame(&join)?)
            .await
            .map_err(|e| Error::transport(format!("join failed: {}", e)))?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        tokio::spawn(write_frames(writer, outgoing_rx));
        tokio::spawn(read_frames(reader, incoming_tx));

        Ok(PushConnection {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use serde_json::Value;
    use tokio::net::TcpListener;

    fn identity() -> ChannelIdentity {
        ChannelIdentity {
            business_id: "b1".to_string(),
            user_id: "u1".to_string(),
            location_id: "l1".to_string(),
        }
    }

    #[tokio::test]
    async fn joins_then_exchanges_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpPushConnector::new(
            &format!("tcp://{}", addr),
            Arc::new(StaticTokenProvider::new("tok")),
        );

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let join: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            writer
                .write_all(b"not json\n{\"event\":\"session_update\",\"payload\":{\"sessionId\":\"s1\"}}\n")
                .await
                .unwrap();
            let sent: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            (join, sent)
        });

        let mut connection = connector.connect(&identity()).await.unwrap();
        let frame = connection.incoming.recv().await.unwrap();
        assert_eq!(frame.event, "session_update");
        assert_eq!(frame.payload["sessionId"], "s1");

        connection
            .outgoing
            .send(PushFrame::new("send_message", json!({ "content": "hi" })))
            .await
            .unwrap();

        let (join, sent) = server.await.unwrap();
        assert_eq!(join["event"], "join");
        assert_eq!(join["payload"]["businessId"], "b1");
        assert_eq!(join["payload"]["token"], "tok");
        assert_eq!(sent["event"], "send_message");
        assert_eq!(sent["payload"]["content"], "hi");
    }

    #[tokio::test]
    async fn server_close_ends_the_incoming_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector =
            TcpPushConnector::new(&addr.to_string(), Arc::new(StaticTokenProvider::none()));

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap();
        });

        let mut connection = connector.connect(&identity()).await.unwrap();
        server.await.unwrap();
        assert!(connection.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector =
            TcpPushConnector::new(&addr.to_string(), Arc::new(StaticTokenProvider::none()));
        let err = connector.connect(&identity()).await.err().unwrap();
        assert!(matches!(err, Error::Transport(_)));
    }
}
