use http::Extensions;
use jsonrpsee::server::RpcModule;
use jsonrpsee::types::{ErrorObjectOwned, Params};
use palisade_core::{
    canonical_number, decode_raw_transaction, function_selector, AbuseGuard, Admission,
    AdmissionError, BlockCache, BlockLookup, GasEstimateCache, GatewayTx, InternalTx, PerfRecorder,
    SubmitOutcome, TxAdmission, UpstreamClient,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, Instrument};

use crate::blocks::{block_hash, cached_block};
use crate::filters::{FilterChanges, FilterKind, FilterRegistry};
use crate::request_context::client_ip;
use crate::telemetry::rpc_server_span;

pub const INVALID_PARAMS: i32 = -32602;
pub const UPSTREAM_BUSY: i32 = -32000;
pub const METHOD_NOT_SUPPORTED: i32 = -32004;
pub const ADMISSION_REJECTED: i32 = -32005;

type RpcResult = Result<Value, ErrorObjectOwned>;

/// Everything the RPC handlers reach into.
pub struct GatewayState {
    pub chain_id: u64,
    pub upstream: Arc<UpstreamClient>,
    pub guard: Arc<AbuseGuard>,
    pub admission: Arc<TxAdmission>,
    pub block_cache: Arc<BlockCache>,
    pub gas_cache: Arc<GasEstimateCache>,
    pub filters: FilterRegistry,
    pub latest_block: Arc<AtomicU64>,
    pub perf: Arc<PerfRecorder>,
}

fn rpc_error(code: i32, message: impl Into<String>) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, message.into(), None::<()>)
}

fn busy() -> ErrorObjectOwned {
    rpc_error(UPSTREAM_BUSY, AdmissionError::UpstreamUnavailable.to_string())
}

fn parse_fixed_hex<const N: usize>(raw: &str, what: &str) -> Result<String, ErrorObjectOwned> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    let mut bytes = [0u8; N];
    hex::decode_to_slice(digits, &mut bytes)
        .map_err(|e| rpc_error(INVALID_PARAMS, format!("Invalid {}: {}", what, e)))?;
    Ok(format!("0x{}", hex::encode(bytes)))
}

fn parse_address(raw: &str) -> Result<String, ErrorObjectOwned> {
    parse_fixed_hex::<20>(raw, "address")
}

fn parse_hash(raw: &str) -> Result<String, ErrorObjectOwned> {
    parse_fixed_hex::<32>(raw, "hash")
}

/// Validators report quantities as hex strings, decimal strings or numbers.
fn to_quantity(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => match s.strip_prefix("0x") {
            Some(digits) => u128::from_str_radix(digits, 16).ok(),
            None => s.parse::<u128>().ok(),
        }
        .map(|n| format!("0x{:x}", n)),
        Value::Number(n) => n.as_u64().map(|n| format!("0x{:x}", n)),
        _ => None,
    }
}

/// `(to, selector)` for calls whose estimate can be cached.
fn gas_key(call: &Value) -> Option<(String, String)> {
    let to = parse_address(call.get("to")?.as_str()?).ok()?;
    let data = call
        .get("data")
        .or_else(|| call.get("input"))
        .and_then(Value::as_str)?;
    let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data)).ok()?;
    Some((to, function_selector(&bytes)?))
}

async fn chain_id(_: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    Ok(Value::String(format!("0x{:x}", state.chain_id)))
}

async fn net_version(_: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    Ok(Value::String(state.chain_id.to_string()))
}

async fn block_number(_: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    let number = state.upstream.block_number().await.ok_or_else(busy)?;
    state.latest_block.fetch_max(number, Ordering::AcqRel);
    Ok(Value::String(format!("0x{:x}", number)))
}

async fn gas_price(_: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    let price = state.upstream.gas_price().await.ok_or_else(busy)?;
    Ok(to_quantity(&price).map(Value::String).unwrap_or(price))
}

async fn account_quantity(
    params: Params<'static>,
    state: &GatewayState,
    field: &str,
) -> RpcResult {
    let mut seq = params.sequence();
    let address: String = seq.next()?;
    let address = parse_address(&address)?;
    let account = state.upstream.account(&address).await.ok_or_else(busy)?;
    let quantity = account
        .get(field)
        .and_then(to_quantity)
        .unwrap_or_else(|| "0x0".to_string());
    Ok(Value::String(quantity))
}

async fn get_balance(params: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    account_quantity(params, &state, "balance").await
}

async fn get_transaction_count(
    params: Params<'static>,
    state: Arc<GatewayState>,
    _: Extensions,
) -> RpcResult {
    account_quantity(params, &state, "nonce").await
}

async fn get_code(params: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    let mut seq = params.sequence();
    let address: String = seq.next()?;
    let address = parse_address(&address)?;
    let code = state.upstream.code(&address).await.ok_or_else(busy)?;
    Ok(match code {
        Value::String(s) if !s.is_empty() => Value::String(s),
        _ => Value::String("0x".to_string()),
    })
}

async fn call(params: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    let mut seq = params.sequence();
    let call: Value = seq.next()?;
    state.upstream.contract_call(&call).await.ok_or_else(busy)
}

async fn estimate_gas(params: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    let mut seq = params.sequence();
    let call: Value = seq.next()?;
    let key = gas_key(&call);
    if let Some((to, selector)) = &key {
        if let Some(gas) = state.gas_cache.get(to, selector) {
            debug!(to = %to, selector = %selector, "Gas estimate served from cache");
            return Ok(Value::String(gas));
        }
    }
    let estimate = state.upstream.estimate_gas(&call).await.ok_or_else(busy)?;
    if let (Some((to, selector)), Some(gas)) = (&key, to_quantity(&estimate)) {
        state.gas_cache.insert(to, selector, gas);
    }
    Ok(estimate)
}

async fn create_access_list(
    params: Params<'static>,
    state: Arc<GatewayState>,
    _: Extensions,
) -> RpcResult {
    let mut seq = params.sequence();
    let call: Value = seq.next()?;
    state.upstream.access_list(&call).await.ok_or_else(busy)
}

async fn transaction_receipt(
    params: Params<'static>,
    state: Arc<GatewayState>,
    _: Extensions,
) -> RpcResult {
    let mut seq = params.sequence();
    let hash: String = seq.next()?;
    let hash = parse_hash(&hash)?;
    state.upstream.tx_receipt(&hash).await.ok_or_else(busy)
}

async fn block_by_hash(params: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    let mut seq = params.sequence();
    let hash: String = seq.next()?;
    let hash = parse_hash(&hash)?;
    let block = cached_block(&state.block_cache, &state.upstream, BlockLookup::Hash(hash)).await;
    Ok(block.unwrap_or(Value::Null))
}

async fn block_by_number(
    params: Params<'static>,
    state: Arc<GatewayState>,
    _: Extensions,
) -> RpcResult {
    let mut seq = params.sequence();
    let tag: String = seq.next()?;
    let lookup = BlockLookup::from_tag(&tag);
    if let BlockLookup::Number(n) = &lookup {
        if canonical_number(n).is_none() {
            return Err(rpc_error(INVALID_PARAMS, format!("Invalid block tag: {}", tag)));
        }
    }
    let block = cached_block(&state.block_cache, &state.upstream, lookup).await;
    Ok(block.unwrap_or(Value::Null))
}

async fn submit(state: &Arc<GatewayState>, tx: GatewayTx, ip: &str) -> RpcResult {
    match state.admission.submit(tx, Some(ip)).await {
        Ok(SubmitOutcome::Forwarded { hash }) => Ok(Value::String(hash)),
        Ok(SubmitOutcome::Buffered { hash }) => {
            debug!(hash = %hash, "Transaction buffered behind a nonce gap");
            Ok(Value::String(hash))
        }
        Err(AdmissionError::Rejected { reason, status }) => Err(ErrorObjectOwned::owned(
            UPSTREAM_BUSY,
            reason,
            Some(json!({ "status": status })),
        )),
        Err(e @ AdmissionError::UpstreamUnavailable) => Err(rpc_error(UPSTREAM_BUSY, e.to_string())),
        Err(e @ AdmissionError::BacklogFull { .. }) => {
            Err(rpc_error(ADMISSION_REJECTED, e.to_string()))
        }
    }
}

async fn admit(
    state: &GatewayState,
    ip: &str,
    method: &str,
    params: &Value,
) -> Result<(), ErrorObjectOwned> {
    match state.guard.admit(ip, method, params).await {
        Admission::Admitted => Ok(()),
        Admission::Rejected(reason) => {
            debug!(ip, method, reason = %reason, "Request rejected by abuse guard");
            Err(rpc_error(ADMISSION_REJECTED, reason))
        }
    }
}

async fn send_raw_transaction(
    params: Params<'static>,
    state: Arc<GatewayState>,
    extensions: Extensions,
) -> RpcResult {
    let ip = client_ip(&extensions).to_string();
    let args: Value = params.parse()?;
    admit(&state, &ip, "eth_sendRawTransaction", &args).await?;

    let raw = args
        .get(0)
        .and_then(Value::as_str)
        .ok_or_else(|| rpc_error(INVALID_PARAMS, "expected a hex-encoded signed transaction"))?;
    let tx = decode_raw_transaction(raw).map_err(|e| rpc_error(INVALID_PARAMS, e.to_string()))?;
    submit(&state, tx, &ip).await
}

async fn send_transaction(
    params: Params<'static>,
    state: Arc<GatewayState>,
    extensions: Extensions,
) -> RpcResult {
    let ip = client_ip(&extensions).to_string();
    let args: Value = params.parse()?;
    admit(&state, &ip, "eth_sendTransaction", &args).await?;

    let payload = args
        .get(0)
        .cloned()
        .ok_or_else(|| rpc_error(INVALID_PARAMS, "expected a transaction object"))?;
    let tx = InternalTx::from_payload(payload).map_err(|e| rpc_error(INVALID_PARAMS, e.to_string()))?;
    submit(&state, GatewayTx::Internal(tx), &ip).await
}

fn install_filter(state: &GatewayState, kind: FilterKind) -> RpcResult {
    let latest = state.latest_block.load(Ordering::Acquire);
    let id = state
        .filters
        .install_at(kind, latest, palisade_core::now_millis());
    debug!(id = %id, ?kind, latest, installed = state.filters.len(), "Installed filter");
    Ok(Value::String(id))
}

async fn new_block_filter(_: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    install_filter(&state, FilterKind::Block)
}

async fn new_pending_transaction_filter(
    _: Params<'static>,
    state: Arc<GatewayState>,
    _: Extensions,
) -> RpcResult {
    install_filter(&state, FilterKind::PendingTransaction)
}

async fn filter_changes(params: Params<'static>, state: Arc<GatewayState>, _: Extensions) -> RpcResult {
    let mut seq = params.sequence();
    let id: String = seq.next()?;
    let latest = state.latest_block.load(Ordering::Acquire);
    let changes = state
        .filters
        .changes_at(&id, latest, palisade_core::now_millis())
        .ok_or_else(|| rpc_error(UPSTREAM_BUSY, "filter not found"))?;

    let hashes = match changes {
        FilterChanges::Pending | FilterChanges::Blocks(None) => Vec::new(),
        FilterChanges::Blocks(Some(range)) => {
            let mut hashes = Vec::new();
            for number in range {
                match block_hash(&state.block_cache, &state.upstream, number).await {
                    Some(hash) => hashes.push(Value::String(hash)),
                    None => debug!(number, "Block hash unavailable for filter"),
                }
            }
            hashes
        }
    };
    Ok(Value::Array(hashes))
}

async fn uninstall_filter(
    params: Params<'static>,
    state: Arc<GatewayState>,
    _: Extensions,
) -> RpcResult {
    let mut seq = params.sequence();
    let id: String = seq.next()?;
    if let Some(created_block) = state.filters.created_block(&id) {
        debug!(id = %id, created_block, "Uninstalling filter");
    }
    Ok(Value::Bool(state.filters.uninstall(&id)))
}

async fn unsupported(_: Params<'static>, _: Arc<GatewayState>, _: Extensions) -> RpcResult {
    Err(rpc_error(METHOD_NOT_SUPPORTED, "method not supported"))
}

/// Wrap `handler` in a server span and latency recording.
fn register<F, Fut>(
    module: &mut RpcModule<GatewayState>,
    method: &'static str,
    handler: F,
) -> anyhow::Result<()>
where
    F: Fn(Params<'static>, Arc<GatewayState>, Extensions) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = RpcResult> + Send + 'static,
{
    module.register_async_method(method, move |params, state, extensions| {
        let span = rpc_server_span(method, &extensions);
        let handler = handler.clone();
        async move {
            let started = Instant::now();
            let result = handler(params, Arc::clone(&state), extensions).await;
            state.perf.record(method, started.elapsed());
            if let Err(e) = &result {
                debug!(code = e.code(), "{}", e.message());
            }
            result
        }
        .instrument(span)
    })?;
    Ok(())
}

pub fn rpc_module(state: Arc<GatewayState>) -> anyhow::Result<RpcModule<GatewayState>> {
    let mut module = RpcModule::from_arc(state);

    register(&mut module, "eth_chainId", chain_id)?;
    register(&mut module, "net_version", net_version)?;
    register(&mut module, "eth_blockNumber", block_number)?;
    register(&mut module, "eth_gasPrice", gas_price)?;
    register(&mut module, "eth_getBalance", get_balance)?;
    register(&mut module, "eth_getTransactionCount", get_transaction_count)?;
    register(&mut module, "eth_getCode", get_code)?;
    register(&mut module, "eth_call", call)?;
    register(&mut module, "eth_estimateGas", estimate_gas)?;
    register(&mut module, "eth_createAccessList", create_access_list)?;
    register(&mut module, "eth_getTransactionReceipt", transaction_receipt)?;
    register(&mut module, "eth_getBlockByHash", block_by_hash)?;
    register(&mut module, "eth_getBlockByNumber", block_by_number)?;
    register(&mut module, "eth_sendRawTransaction", send_raw_transaction)?;
    register(&mut module, "eth_sendTransaction", send_transaction)?;
    register(&mut module, "eth_newBlockFilter", new_block_filter)?;
    register(
        &mut module,
        "eth_newPendingTransactionFilter",
        new_pending_transaction_filter,
    )?;
    register(&mut module, "eth_getFilterChanges", filter_changes)?;
    register(&mut module, "eth_uninstallFilter", uninstall_filter)?;
    register(&mut module, "eth_newFilter", unsupported)?;

    info!(methods = module.method_names().count(), "Registered RPC methods");
    Ok(module)
}
