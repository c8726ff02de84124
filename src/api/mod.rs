//! HTTP API exposing balance, fee and transfer operations per configured chain

use crate::chain::{self, ChainClient, ChainRegistry};
use crate::config::ApiConfig;
use crate::error::TransferError;
use crate::tx::TransferSubmitter;
use crate::types::{
    parse_address, parse_amount, parse_tx_hash, serialize_decimal, Amount, FeeSuggestion,
    SubmitOutcome, TransferRequest,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::signers::Signer;
use ethers::types::{Address, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ChainRegistry>,
    pub submitter: Arc<TransferSubmitter>,
    /// Parent of every request's cancellation token; cancelled on shutdown
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/chains", get(get_chains))
        .route("/chains/:chain_id/block-number", get(get_block_number))
        .route("/chains/:chain_id/balance/:address", get(get_balance))
        .route(
            "/chains/:chain_id/erc20/:contract/balance/:address",
            get(get_erc20_balance),
        )
        .route(
            "/chains/:chain_id/erc721/:contract/balance/:address",
            get(get_erc721_balance),
        )
        .route("/chains/:chain_id/gas-price", get(get_gas_price))
        .route("/chains/:chain_id/fee", get(suggest_fee))
        .route("/chains/:chain_id/estimate", post(estimate_gas))
        .route(
            "/chains/:chain_id/max-transferable/:address",
            get(max_transferable),
        )
        .route("/chains/:chain_id/transactions/:hash", get(get_transaction))
        .route("/chains/:chain_id/transfers", post(submit_transfer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server until `shutdown` fires
pub async fn run_server(config: ApiConfig, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// TransferError rendered as a JSON body with a status by kind
pub struct ApiError(TransferError);

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            TransferError::Validation { .. } | TransferError::Wallet { .. } => {
                StatusCode::BAD_REQUEST
            }
            TransferError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            TransferError::InsufficientFunds { .. } | TransferError::Estimation { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            TransferError::NonceConflict { .. } => StatusCode::CONFLICT,
            TransferError::Transport { .. } => StatusCode::BAD_GATEWAY,
            TransferError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            TransferError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TransferError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.kind(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn client(state: &AppState, chain_id: u64) -> Result<Arc<ChainClient>, ApiError> {
    Ok(state.registry.get(chain_id)?)
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Configured chains and the account each one signs with
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let chains = state
        .registry
        .chain_ids()
        .into_iter()
        .filter_map(|chain_id| {
            let client = state.registry.get(chain_id).ok()?;
            Some(ChainInfo {
                chain_id,
                name: state.registry.name(chain_id).unwrap_or_default(),
                account: client.address(),
                read_only: client.is_read_only(),
            })
        })
        .collect();
    Json(ChainsResponse { chains })
}

async fn get_block_number(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> ApiResult<BlockNumberResponse> {
    let client = client(&state, chain_id)?;
    let block_number = chain::last_block_number(&client).await?;
    Ok(Json(BlockNumberResponse { block_number }))
}

async fn get_balance(
    State(state): State<AppState>,
    Path((chain_id, address)): Path<(u64, String)>,
) -> ApiResult<AmountResponse> {
    let client = client(&state, chain_id)?;
    let address = parse_address("address", &address)?;
    let amount = chain::get_balance(&client, address).await?;
    Ok(Json(AmountResponse { amount }))
}

async fn get_erc20_balance(
    State(state): State<AppState>,
    Path((chain_id, contract, address)): Path<(u64, String, String)>,
) -> ApiResult<AmountResponse> {
    let client = client(&state, chain_id)?;
    let contract = parse_address("contract", &contract)?;
    let address = parse_address("address", &address)?;
    let amount = chain::get_erc20_balance(&client, contract, address).await?;
    Ok(Json(AmountResponse { amount }))
}

async fn get_erc721_balance(
    State(state): State<AppState>,
    Path((chain_id, contract, address)): Path<(u64, String, String)>,
) -> ApiResult<AmountResponse> {
    let client = client(&state, chain_id)?;
    let contract = parse_address("contract", &contract)?;
    let address = parse_address("address", &address)?;
    let amount = chain::get_erc721_balance(&client, contract, address).await?;
    Ok(Json(AmountResponse { amount }))
}

async fn get_gas_price(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> ApiResult<AmountResponse> {
    let client = client(&state, chain_id)?;
    let amount = state
        .submitter
        .fees()
        .current_gas_price(client.endpoint())
        .await?;
    Ok(Json(AmountResponse { amount }))
}

async fn suggest_fee(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> ApiResult<FeeSuggestion> {
    let client = client(&state, chain_id)?;
    Ok(Json(state.submitter.fees().suggest_fee(&client).await?))
}

async fn estimate_gas(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
    Json(body): Json<EstimateBody>,
) -> ApiResult<AmountResponse> {
    let client = client(&state, chain_id)?;
    let transfer = body.transfer.into_request()?;
    let from = match body.from {
        Some(from) => parse_address("from", &from)?,
        None => client.require_signer("estimate gas")?.address(),
    };
    let amount = state
        .submitter
        .fees()
        .estimate_gas_from(&client, from, &transfer)
        .await?;
    Ok(Json(AmountResponse { amount }))
}

async fn max_transferable(
    State(state): State<AppState>,
    Path((chain_id, address)): Path<(u64, String)>,
) -> ApiResult<AmountResponse> {
    let client = client(&state, chain_id)?;
    let address = parse_address("address", &address)?;
    let amount = state
        .submitter
        .fees()
        .max_transferable_amount(&client, address)
        .await?;
    Ok(Json(AmountResponse { amount }))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path((chain_id, hash)): Path<(u64, String)>,
) -> ApiResult<Option<Transaction>> {
    let client = client(&state, chain_id)?;
    let hash = parse_tx_hash(&hash)?;
    Ok(Json(chain::transaction_by_hash(&client, hash).await?))
}

async fn submit_transfer(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<SubmitOutcome> {
    let client = client(&state, chain_id)?;
    let transfer = body.transfer.into_request()?;
    let fee = body.fee.map(FeeBody::into_fee).transpose()?;
    let cancel = state.shutdown.child_token();
    // A dropped request (client went away) cancels the in-flight submission
    let _guard = cancel.clone().drop_guard();

    let outcome = state
        .submitter
        .submit_with_fee(&client, &transfer, fee, body.wait_for_receipt, &cancel)
        .await?;
    Ok(Json(outcome))
}

// Request types

/// Transfer as sent over HTTP: addresses in hex, amounts as decimal strings
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransferBody {
    Native {
        to: String,
        amount: String,
    },
    Erc20 {
        contract: String,
        to: String,
        amount: String,
    },
    Erc721 {
        contract: String,
        to: String,
        token_id: String,
    },
}

impl TransferBody {
    pub fn into_request(self) -> Result<TransferRequest, TransferError> {
        let request = match self {
            TransferBody::Native { to, amount } => TransferRequest::Native {
                to: parse_address("to", &to)?,
                amount: parse_amount("amount", &amount)?,
            },
            TransferBody::Erc20 {
                contract,
                to,
                amount,
            } => TransferRequest::Erc20 {
                contract: parse_address("contract", &contract)?,
                to: parse_address("to", &to)?,
                amount: parse_amount("amount", &amount)?,
            },
            TransferBody::Erc721 {
                contract,
                to,
                token_id,
            } => TransferRequest::Erc721 {
                contract: parse_address("contract", &contract)?,
                to: parse_address("to", &to)?,
                token_id: parse_amount("token_id", &token_id)?,
            },
        };
        Ok(request)
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(flatten)]
    transfer: TransferBody,
    #[serde(default)]
    wait_for_receipt: bool,
    /// Fee to sign with as-is, e.g. the one a whole-balance amount was sized against
    #[serde(default)]
    fee: Option<FeeBody>,
}

#[derive(Debug, Deserialize)]
pub struct FeeBody {
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    pub gas_limit: String,
}

impl FeeBody {
    pub fn into_fee(self) -> Result<FeeSuggestion, TransferError> {
        FeeSuggestion::new(
            parse_amount("max_fee_per_gas", &self.max_fee_per_gas)?,
            parse_amount("max_priority_fee_per_gas", &self.max_priority_fee_per_gas)?,
            parse_amount("gas_limit", &self.gas_limit)?,
        )
    }
}

#[derive(Debug, Deserialize)]
struct EstimateBody {
    #[serde(flatten)]
    transfer: TransferBody,
    from: Option<String>,
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ChainInfo {
    chain_id: u64,
    name: String,
    account: Option<Address>,
    read_only: bool,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainInfo>,
}

#[derive(Serialize)]
struct BlockNumberResponse {
    block_number: u64,
}

#[derive(Serialize)]
struct AmountResponse {
    #[serde(serialize_with = "serialize_decimal")]
    amount: Amount,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}
