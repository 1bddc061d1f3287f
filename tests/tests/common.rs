//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crest_gateway::{config as gateway_config, Gateway};
use crest_types::{
    CoinOutput, ConfirmedTransaction, ConsensusChange, DiffDirection, Explorer, NetAddress,
    Network, OutputDiff, OutputId, OutputKind, QueryError, Transaction, TransactionPool,
    UnlockHash,
};

/// A gateway tuned for fast localhost tests, backed by a temp data dir.
pub struct TestGateway {
    pub gateway: Gateway,
    pub address: NetAddress,
    _data_dir: tempfile::TempDir,
}

pub async fn spawn_gateway(bootstrap: Vec<NetAddress>) -> TestGateway {
    spawn_gateway_with(bootstrap, |_| {}).await
}

pub async fn spawn_gateway_with(
    bootstrap: Vec<NetAddress>,
    tweak: impl FnOnce(&mut gateway_config::Config),
) -> TestGateway {
    let data_dir = tempfile::tempdir().expect("temp dir");

    let mut config = gateway_config::Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        bootstrap,
        data_dir: data_dir.path().to_path_buf(),
        well_connected_threshold: 2,
        fully_connected_threshold: 16,
        accept_interval: Duration::from_millis(20),
        no_nodes_delay: Duration::from_millis(100),
        well_connected_delay: Duration::from_millis(100),
        allow_local_addresses: true,
        ..gateway_config::Config::default()
    };
    tweak(&mut config);

    let gateway = Gateway::new(config, Network::Devnet).expect("gateway");
    let bound = gateway.run().await.expect("gateway run");

    TestGateway {
        gateway,
        address: bound.into(),
        _data_dir: data_dir,
    }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = timeout(deadline, async {
        loop {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;

    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Newline-delimited JSON-RPC client for the electrum transport.
pub struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write newline");
        self.writer.flush().await.expect("flush");
    }

    pub async fn send(&mut self, value: &Value) {
        self.send_raw(&value.to_string()).await;
    }

    /// Next line from the server, parsed. Panics after five seconds.
    pub async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("server reply within deadline")
            .expect("read");
        assert!(n > 0, "server closed the connection");
        serde_json::from_str(line.trim_end()).expect("server sent valid json")
    }

    /// True once the server closes the connection.
    pub async fn closed(&mut self) -> bool {
        let mut line = String::new();
        match timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) => true,
            _ => false,
        }
    }

    pub async fn negotiate(&mut self) {
        self.send(&serde_json::json!({
            "id": 0,
            "jsonrpc": "2.0",
            "method": "server.version",
            "params": ["tests", "1.0"],
        }))
        .await;
        let reply = self.recv().await;
        assert!(reply.get("error").is_none(), "negotiation failed: {reply}");
    }
}

/// Mutable in-memory chain state backing the electrum server in tests.
#[derive(Default)]
pub struct MemChain {
    confirmed: std::sync::RwLock<Vec<ConfirmedTransaction>>,
    pool: std::sync::RwLock<Vec<Transaction>>,
}

impl MemChain {
    pub fn push_confirmed(&self, tx: ConfirmedTransaction) {
        self.confirmed.write().unwrap().push(tx);
    }

    pub fn push_pool(&self, tx: Transaction) {
        self.pool.write().unwrap().push(tx);
    }
}

#[async_trait::async_trait]
impl Explorer for MemChain {
    async fn transactions_for_address(
        &self,
        address: &UnlockHash,
    ) -> Result<Vec<ConfirmedTransaction>, QueryError> {
        Ok(self
            .confirmed
            .read()
            .unwrap()
            .iter()
            .filter(|tx| tx.transaction.pays_to(address))
            .cloned()
            .collect())
    }

    async fn output(&self, id: &OutputId) -> Result<Option<CoinOutput>, QueryError> {
        for entry in self.confirmed.read().unwrap().iter() {
            let outputs = entry
                .transaction
                .coin_outputs
                .iter()
                .chain(entry.transaction.blockstake_outputs.iter());
            for (output_id, output) in entry.transaction.created_output_ids().zip(outputs) {
                if &output_id == id {
                    return Ok(Some(output.clone()));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl TransactionPool for MemChain {
    async fn unconfirmed_transactions(&self) -> Result<Vec<Transaction>, QueryError> {
        Ok(self.pool.read().unwrap().clone())
    }
}

/// An electrum server over in-memory chain state, plus its consensus
/// feed.
pub struct TestElectrum {
    pub server: crest_electrum::ElectrumServer,
    pub tcp_addr: SocketAddr,
    pub ws_addr: Option<SocketAddr>,
    pub consensus_tx: flume::Sender<ConsensusChange>,
    pub cancellation: tokio_util::sync::CancellationToken,
}

pub async fn spawn_electrum(chain: Arc<MemChain>, keepalive: Duration) -> TestElectrum {
    let (consensus_tx, consensus_rx) = flume::bounded(64);
    let config = crest_electrum::Config {
        listen_tcp: Some("127.0.0.1:0".parse().unwrap()),
        listen_ws: Some("127.0.0.1:0".parse().unwrap()),
        keepalive,
    };

    let server =
        crest_electrum::ElectrumServer::new(config, chain.clone(), chain, consensus_rx);
    let cancellation = tokio_util::sync::CancellationToken::new();
    let addrs = server.run(cancellation.clone()).await.expect("electrum run");

    TestElectrum {
        server,
        tcp_addr: addrs.tcp.expect("tcp transport enabled"),
        ws_addr: addrs.ws,
        consensus_tx,
        cancellation,
    }
}

/// A transaction paying `value` to `address`, and the output diff a
/// consensus change would carry for it.
pub fn payment(id_byte: u8, address: UnlockHash, value: u64) -> (Transaction, OutputDiff) {
    let tx = Transaction {
        id: ids::tx_id(id_byte),
        coin_inputs: vec![],
        coin_outputs: vec![CoinOutput {
            value,
            unlock_hash: address,
        }],
        blockstake_inputs: vec![],
        blockstake_outputs: vec![],
    };
    let diff = OutputDiff {
        direction: DiffDirection::Applied,
        id: OutputId::derive(OutputKind::Coin, &tx.id, 0),
        output: tx.coin_outputs[0].clone(),
    };
    (tx, diff)
}

/// Deterministic identifiers for tests.
pub mod ids {
    use crest_types::{BlockId, TransactionId};

    pub fn tx_id(b: u8) -> TransactionId {
        use std::str::FromStr;
        let hex: String = format!("{b:02x}").repeat(32);
        TransactionId::from_str(&hex).unwrap()
    }

    pub fn block_id(b: u8) -> BlockId {
        use std::str::FromStr;
        let hex: String = format!("{b:02x}").repeat(32);
        BlockId::from_str(&hex).unwrap()
    }
}
