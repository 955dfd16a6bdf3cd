use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use palisade_core::{decode_raw_transaction, GatewayTx, InternalTx};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Deterministic validator and discovery-service stand-in"
)]
struct Args {
    /// Port to listen on; the node list advertises this same port
    #[arg(short, long, default_value_t = 4000)]
    port: u16,

    /// Milliseconds between mined blocks
    #[arg(long, default_value_t = 2_000)]
    block_time_ms: u64,
}

const GAS_PER_TX: u64 = 21_000;
const FUNDED_ACCOUNT: &str = "0x000000000000000000000000000000000000031c";

#[derive(Default, Clone)]
struct AccountData {
    nonce: u64,
    balance: u128,
}

struct ChainState {
    latest: u64,
    blocks: BTreeMap<u64, Vec<String>>,
    accounts: HashMap<String, AccountData>,
    receipts: HashMap<String, Value>,
    pending: Vec<(String, String)>,
}

struct MockState {
    port: u16,
    chain: RwLock<ChainState>,
}

fn hex_u64(n: u64) -> String {
    format!("0x{:x}", n)
}

fn block_hash(number: u64) -> String {
    format!("0x{:064x}", 0xb10c_0000_u64 + number)
}

fn block_json(number: u64, txs: &[String]) -> Value {
    json!({
        "number": hex_u64(number),
        "hash": block_hash(number),
        "parentHash": block_hash(number.saturating_sub(1)),
        "timestamp": hex_u64(1_700_000_000 + number * 2),
        "gasLimit": hex_u64(30_000_000),
        "gasUsed": hex_u64(GAS_PER_TX * txs.len() as u64),
        "transactions": txs,
    })
}

fn seed_chain() -> ChainState {
    let mut blocks = BTreeMap::new();
    blocks.insert(0, Vec::new());
    blocks.insert(1, Vec::new());
    let mut accounts = HashMap::new();
    accounts.insert(
        FUNDED_ACCOUNT.to_string(),
        AccountData {
            nonce: 0,
            balance: 1_000_000_000_000_000_000_000,
        },
    );
    ChainState {
        latest: 1,
        blocks,
        accounts,
        receipts: HashMap::new(),
        pending: Vec::new(),
    }
}

fn mine(chain: &mut ChainState) {
    let number = chain.latest + 1;
    let included: Vec<(String, String)> = std::mem::take(&mut chain.pending);
    for (index, (hash, from)) in included.iter().enumerate() {
        chain.receipts.insert(
            hash.clone(),
            json!({
                "transactionHash": hash,
                "transactionIndex": hex_u64(index as u64),
                "blockHash": block_hash(number),
                "blockNumber": hex_u64(number),
                "from": from,
                "gasUsed": hex_u64(GAS_PER_TX),
                "status": "0x1",
            }),
        );
    }
    chain
        .blocks
        .insert(number, included.into_iter().map(|(hash, _)| hash).collect());
    chain.latest = number;
}

fn parse_number(raw: &str, latest: u64) -> Option<u64> {
    match raw {
        "latest" | "pending" | "safe" | "finalized" => Some(latest),
        "earliest" => Some(0),
        other => u64::from_str_radix(other.strip_prefix("0x").unwrap_or(other), 16).ok(),
    }
}

type Shared = Arc<MockState>;

async fn cycle_info(State(state): State<Shared>) -> Json<Value> {
    let counter = state.chain.read().await.latest;
    Json(json!({ "cycleInfo": [{ "counter": counter }] }))
}

async fn node_list(State(state): State<Shared>) -> Json<Value> {
    Json(json!({ "nodeList": [{ "ip": "127.0.0.1", "port": state.port }] }))
}

async fn node_info() -> Json<Value> {
    Json(json!({ "nodeInfo": { "status": "active" } }))
}

async fn block_number(State(state): State<Shared>) -> Json<Value> {
    let latest = state.chain.read().await.latest;
    Json(json!({ "blockNumber": hex_u64(latest) }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockQuery {
    block_number: Option<String>,
    block_hash: Option<String>,
}

async fn block_by_number(State(state): State<Shared>, Query(q): Query<BlockQuery>) -> Json<Value> {
    let chain = state.chain.read().await;
    let block = q
        .block_number
        .as_deref()
        .and_then(|raw| parse_number(raw, chain.latest))
        .and_then(|n| chain.blocks.get(&n).map(|txs| block_json(n, txs)));
    Json(json!({ "block": block }))
}

async fn block_by_hash(State(state): State<Shared>, Query(q): Query<BlockQuery>) -> Json<Value> {
    let chain = state.chain.read().await;
    let wanted = q.block_hash.unwrap_or_default().to_lowercase();
    let block = chain
        .blocks
        .iter()
        .find(|(n, _)| block_hash(**n) == wanted)
        .map(|(n, txs)| block_json(*n, txs));
    Json(json!({ "block": block }))
}

async fn account(State(state): State<Shared>, Path(address): Path<String>) -> Json<Value> {
    let chain = state.chain.read().await;
    let account = chain.accounts.get(&address.to_lowercase()).map(|a| {
        json!({
            "nonce": hex_u64(a.nonce),
            // Decimal on purpose; real validators mix encodings.
            "balance": a.balance.to_string(),
            "accountType": "EOA",
        })
    });
    Json(json!({ "account": account }))
}

async fn code() -> Json<Value> {
    Json(json!({ "contractCode": "0x" }))
}

async fn gas_price() -> Json<Value> {
    Json(json!({ "result": hex_u64(1_000_000_000) }))
}

async fn receipt(State(state): State<Shared>, Path(hash): Path<String>) -> Json<Value> {
    let chain = state.chain.read().await;
    Json(json!({ "receipt": chain.receipts.get(&hash.to_lowercase()) }))
}

async fn contract_call() -> Json<Value> {
    Json(json!({ "result": "0x" }))
}

async fn estimate_gas() -> Json<Value> {
    Json(json!({ "result": hex_u64(GAS_PER_TX) }))
}

async fn access_list() -> Json<Value> {
    Json(json!({ "result": { "accessList": [], "gasUsed": hex_u64(GAS_PER_TX) } }))
}

fn inject_result(success: bool, reason: &str, status: u64) -> Json<Value> {
    Json(json!({ "success": success, "reason": reason, "status": status }))
}

async fn inject(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let raw = body.get("raw").and_then(Value::as_str).map(ToOwned::to_owned);
    let Some(raw) = raw else {
        return match InternalTx::from_payload(body) {
            Ok(tx) => {
                debug!(hash = %tx.hash, "Accepted internal transaction");
                inject_result(true, "", 200)
            }
            Err(e) => inject_result(false, &e.to_string(), 400),
        };
    };

    let tx = match decode_raw_transaction(&raw).map(GatewayTx::into_signed) {
        Ok(Some(tx)) => tx,
        Ok(None) => return inject_result(false, "not a signed transaction", 400),
        Err(e) => return inject_result(false, &e.to_string(), 400),
    };

    let from = tx.from.to_string().to_lowercase();
    let hash = tx.hash.to_string();
    let mut chain = state.chain.write().await;
    let account = chain.accounts.entry(from.clone()).or_default();
    if tx.nonce < account.nonce {
        return inject_result(false, "nonce too low", 400);
    }
    account.nonce = tx.nonce + 1;
    chain.pending.push((hash.clone(), from));
    info!(hash = %hash, nonce = tx.nonce, "Accepted transaction");
    inject_result(true, "", 200)
}

fn router(state: Shared) -> Router {
    Router::new()
        .route("/cycleinfo/1", get(cycle_info))
        .route("/full-nodelist", get(node_list))
        .route("/nodeinfo", get(node_info))
        .route("/eth_blockNumber", get(block_number))
        .route("/eth_getBlockByNumber", get(block_by_number))
        .route("/eth_getBlockByHash", get(block_by_hash))
        .route("/account/:address", get(account))
        .route("/eth_getCode", get(code))
        .route("/eth_gasPrice", get(gas_price))
        .route("/tx/:hash", get(receipt))
        .route("/inject", post(inject))
        .route("/contract/call", post(contract_call))
        .route("/contract/estimateGas", post(estimate_gas))
        .route("/contract/accesslist", post(access_list))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let state = Arc::new(MockState {
        port: args.port,
        chain: RwLock::new(seed_chain()),
    });

    let miner = state.clone();
    let block_time = Duration::from_millis(args.block_time_ms.max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(block_time).await;
            let mut chain = miner.chain.write().await;
            mine(&mut chain);
            debug!(latest = chain.latest, "Mined block");
        }
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Mock validator listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
