use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::api::server::AppState;
use crate::db::jobs::LedgerBalance;

use super::handler_utils::{internal_error, into_json, map_store_error, ApiObject};

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    ok: bool,
    balance: LedgerBalance,
}

pub async fn get_balance_handler(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> ApiObject<Value> {
    let service = state.service.clone();
    let result =
        tokio::task::spawn_blocking(move || service.get_balance(owner_id.as_str())).await;

    match result {
        Ok(Ok(balance)) => (
            StatusCode::OK,
            into_json(BalanceResponse { ok: true, balance }),
        ),
        Ok(Err(error)) => map_store_error(error, "Owner not found"),
        Err(join_error) => internal_error(format!("balance lookup task failed: {join_error}")),
    }
}
