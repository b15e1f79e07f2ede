// Copyright 2024-2025, The Weir Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `blockchain_feed` connector subscribes to the blockchain.info
//! WebSocket API and streams unconfirmed Bitcoin transactions.
//!
//! On connect it sends `{"op": "unconfirmed_sub"}`; every `utx` event is
//! flattened into one record carrying the transaction hash, size, input and
//! output counts, BTC totals and the relaying node. Server `pong`
//! keep-alives are answered with a `ping`.

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rustls::ServerName;
use simd_json::json;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use value_trait::prelude::*;
use weir_common::{
    alias,
    url::{Url, WssDefaults},
};
use weir_config::Impl;

use crate::{
    config::{env_or, ConnectorConfig},
    errors::error_connector_def,
    record::RawValue,
    source::{Source, SourceAddr, SourceContext, SourceManagerBuilder, SourceReply, DEFAULT_STREAM},
    utils::{reconnect::Attempt, tls::TLSClientConfig},
    Connector, ConnectorBuilder, ConnectorType,
};

const DEFAULT_URL: &str = "wss://ws.blockchain.info/inv";
const SUBSCRIBE: &str = r#"{"op": "unconfirmed_sub"}"#;
const PING: &str = r#"{"op": "ping"}"#;
const SATOSHI_PER_BTC: f64 = 100_000_000.0;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// the websocket endpoint to subscribe at
    #[serde(default = "default_url")]
    url: Url<WssDefaults>,
}

fn default_url() -> Url<WssDefaults> {
    // ALLOW: the default URL is known to parse
    Url::parse(DEFAULT_URL).expect("default URL invalid")
}

impl Impl for Config {}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let raw: String = env_or("BLOCKCHAIN_WS_URL", DEFAULT_URL.to_string())?;
        Ok(Self {
            url: Url::parse(&raw)?,
        })
    }
}

/// builder for the `blockchain_feed` connector
#[derive(Debug, Default)]
pub struct Builder {}

#[async_trait::async_trait]
impl ConnectorBuilder for Builder {
    fn connector_type(&self) -> ConnectorType {
        "blockchain_feed".into()
    }

    async fn build(
        &self,
        alias: &alias::Connector,
        config: &ConnectorConfig,
    ) -> anyhow::Result<Box<dyn Connector>> {
        let config = match config.config.as_ref() {
            Some(raw) => Config::new(raw).map_err(|e| error_connector_def(alias, &e))?,
            None => Config::from_env()?,
        };
        Ok(Box::new(Blockchain { config }))
    }
}

struct Blockchain {
    config: Config,
}

#[async_trait::async_trait]
impl Connector for Blockchain {
    async fn create_source(
        &mut self,
        ctx: SourceContext,
        builder: SourceManagerBuilder,
    ) -> anyhow::Result<Option<SourceAddr>> {
        let source = BlockchainSource {
            url: self.config.url.clone(),
            conn: None,
        };
        Ok(Some(builder.spawn(source, ctx)))
    }
}

type TlsWs = WebSocketStream<TlsStream<TcpStream>>;
type PlainWs = WebSocketStream<TcpStream>;

/// an established websocket, plain or wrapped in TLS
enum WsConn {
    Tls(SplitSink<TlsWs, Message>, SplitStream<TlsWs>),
    Plain(SplitSink<PlainWs, Message>, SplitStream<PlainWs>),
}

impl WsConn {
    async fn send(&mut self, msg: Message) -> anyhow::Result<()> {
        match self {
            WsConn::Tls(writer, _) => writer.send(msg).await?,
            WsConn::Plain(writer, _) => writer.send(msg).await?,
        }
        Ok(())
    }

    async fn next(&mut self) -> Option<tokio_tungstenite::tungstenite::Result<Message>> {
        match self {
            WsConn::Tls(_, reader) => reader.next().await,
            WsConn::Plain(_, reader) => reader.next().await,
        }
    }
}

struct BlockchainSource {
    url: Url<WssDefaults>,
    conn: Option<WsConn>,
}

#[async_trait::async_trait]
impl Source for BlockchainSource {
    async fn connect(&mut self, ctx: &SourceContext, _attempt: &Attempt) -> anyhow::Result<bool> {
        self.conn = None;
        let host = self.url.host_or_local().to_string();
        let port = self.url.port_or_dflt();
        let tcp_stream = TcpStream::connect((host.as_str(), port)).await?;

        let mut conn = if self.url.scheme() == "wss" {
            let tls_connector = TLSClientConfig::default().to_client_connector()?;
            let server_name = ServerName::try_from(host.as_str())?;
            let tls_stream = tls_connector.connect(server_name, tcp_stream).await?;
            let (ws_stream, _http_response) = client_async(self.url.as_str(), tls_stream).await?;
            let (writer, reader) = ws_stream.split();
            WsConn::Tls(writer, reader)
        } else {
            let (ws_stream, _http_response) = client_async(self.url.as_str(), tcp_stream).await?;
            let (writer, reader) = ws_stream.split();
            WsConn::Plain(writer, reader)
        };

        conn.send(Message::Text(SUBSCRIBE.to_string())).await?;
        info!("{ctx} Subscribed to unconfirmed transactions at {}", self.url);
        self.conn = Some(conn);
        Ok(true)
    }

    async fn pull_data(
        &mut self,
        _pull_id: &mut u64,
        ctx: &SourceContext,
    ) -> anyhow::Result<SourceReply> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(crate::errors::GenericImplementationError::ClientNotAvailable(
                "blockchain_feed",
            ))?;
        loop {
            match conn.next().await {
                Some(Ok(Message::Text(text))) => {
                    let mut raw = text.into_bytes();
                    let data = match simd_json::to_owned_value(&mut raw) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("{ctx} Dropping unparseable message: {e}");
                            continue;
                        }
                    };
                    match data.get_str("op") {
                        Some("utx") => {
                            if let Some(record) = transaction_record(&data) {
                                return Ok(SourceReply::Data {
                                    payload: RawValue::Structured(record),
                                    key: None,
                                    stream: DEFAULT_STREAM,
                                });
                            }
                            warn!("{ctx} Dropping utx event without transaction body.");
                        }
                        Some("pong") => {
                            conn.send(Message::Text(PING.to_string())).await?;
                        }
                        op => {
                            debug!("{ctx} Ignoring '{}' message.", op.unwrap_or("unknown"));
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    conn.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.conn = None;
                    return Err(anyhow::anyhow!("server closed the connection"));
                }
                Some(Ok(_)) => {
                    // binary, pong and frame messages carry nothing for us
                }
                Some(Err(e)) => {
                    self.conn = None;
                    return Err(e.into());
                }
            }
        }
    }
}

/// Flatten a `utx` event into one record. Values come in satoshi and leave
/// in BTC.
fn transaction_record(event: &simd_json::OwnedValue) -> Option<simd_json::OwnedValue> {
    let tx = event.get("x")?;
    let total_input: u64 = tx
        .get_array("inputs")
        .map(|inputs| {
            inputs
                .iter()
                .filter_map(|input| input.get("prev_out").and_then(|p| p.get_u64("value")))
                .sum()
        })
        .unwrap_or_default();
    let total_output: u64 = tx
        .get_array("out")
        .map(|outputs| {
            outputs
                .iter()
                .filter_map(|output| output.get_u64("value"))
                .sum()
        })
        .unwrap_or_default();
    #[allow(clippy::cast_precision_loss)]
    let (input_btc, output_btc) = (
        total_input as f64 / SATOSHI_PER_BTC,
        total_output as f64 / SATOSHI_PER_BTC,
    );
    Some(json!({
        "hash": tx.get_str("hash").unwrap_or_default(),
        "time": tx.get_u64("time").unwrap_or_default(),
        "size": tx.get_u64("size").unwrap_or_default(),
        "input_count": tx.get_u64("vin_sz").unwrap_or_default(),
        "output_count": tx.get_u64("vout_sz").unwrap_or_default(),
        "total_input_btc": input_btc,
        "total_output_btc": output_btc,
        "fee_btc": (input_btc - output_btc).max(0.0),
        "relayed_by": tx.get_str("relay").unwrap_or_default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utx_event_is_flattened() {
        let event = json!({
            "op": "utx",
            "x": {
                "hash": "4f3c...",
                "time": 1_700_000_000_u64,
                "size": 226,
                "vin_sz": 1,
                "vout_sz": 2,
                "relay": "127.0.0.1",
                "inputs": [
                    {"prev_out": {"value": 150_000_000_u64}}
                ],
                "out": [
                    {"value": 100_000_000_u64},
                    {"value": 49_900_000_u64}
                ]
            }
        });
        let record = transaction_record(&event).expect("utx should flatten");
        assert_eq!(Some("4f3c..."), record.get_str("hash"));
        assert_eq!(Some(1), record.get_u64("input_count"));
        assert_eq!(Some(2), record.get_u64("output_count"));
        assert_eq!(Some(1.5), record.get_f64("total_input_btc"));
        assert_eq!(Some(1.499), record.get_f64("total_output_btc"));
        let fee = record.get_f64("fee_btc").unwrap_or_default();
        assert!((fee - 0.001).abs() < 1e-9);
        assert_eq!(Some("127.0.0.1"), record.get_str("relayed_by"));
    }

    #[test]
    fn utx_without_body_is_dropped() {
        let event = json!({"op": "utx"});
        assert!(transaction_record(&event).is_none());
    }

    #[test]
    fn default_url_parses() {
        let config = Config {
            url: default_url(),
        };
        assert_eq!("wss", config.url.scheme());
        assert_eq!("ws.blockchain.info", config.url.host_or_local());
        assert_eq!(443, config.url.port_or_dflt());
    }
}
