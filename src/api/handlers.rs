use actix_web::{web, HttpResponse, Responder};
use log::warn;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

use crate::consensus::evpool::EvidencePool;
use crate::consensus::state::RoundStateSummary;
use crate::ledger::DevChain;
use crate::types::primitives::H256;
use crate::types::transaction::{CreateTransactionRequest, Transaction};
use crate::types::transaction_pool::TransactionPool;

/// Shared handles served over HTTP.
#[derive(Clone)]
pub struct ApiState {
    pub status: watch::Receiver<RoundStateSummary>,
    pub evidence: Arc<tokio::sync::Mutex<EvidencePool>>,
    pub pool: Arc<Mutex<TransactionPool>>,
    pub chain: Arc<DevChain>,
}

pub async fn get_consensus_state(state: web::Data<ApiState>) -> impl Responder {
    let summary = state.status.borrow().clone();
    HttpResponse::Ok().json(summary)
}

pub async fn get_pending_evidence(state: web::Data<ApiState>) -> impl Responder {
    let pending = state.evidence.lock().await.pending_evidence().await;
    match pending {
        Ok(evidence) => HttpResponse::Ok().json(evidence),
        Err(e) => {
            warn!("Failed to load pending evidence: {}", e);
            HttpResponse::InternalServerError().json(json!({
                "status": "error",
                "error": e.to_string()
            }))
        }
    }
}

pub async fn create_transaction(
    state: web::Data<ApiState>,
    request: web::Json<CreateTransactionRequest>,
) -> impl Responder {
    let transaction = match Transaction::try_from(request.into_inner()) {
        Ok(tx) => tx,
        Err(e) => {
            return HttpResponse::BadRequest().json(json!({
                "status": "error",
                "error": e.to_string()
            }))
        }
    };

    let hash = transaction.hash();
    if state.pool.lock().add_transaction(transaction) {
        HttpResponse::Ok().json(json!({
            "status": "success",
            "hash": hash.to_hex()
        }))
    } else {
        HttpResponse::Conflict().json(json!({
            "status": "error",
            "error": "Transaction already pooled"
        }))
    }
}

pub async fn get_transaction(state: web::Data<ApiState>, hash: web::Path<String>) -> impl Responder {
    let found = H256::from_hex(&hash).and_then(|hash| state.pool.lock().get_transaction(&hash).cloned());
    match found {
        Some(tx) => HttpResponse::Ok().json(tx),
        None => HttpResponse::NotFound().json(json!({
            "status": "error",
            "error": "Transaction not found"
        })),
    }
}

pub async fn get_all_transactions(state: web::Data<ApiState>) -> impl Responder {
    let transactions: Vec<Transaction> = state
        .pool
        .lock()
        .get_all_transactions()
        .into_iter()
        .cloned()
        .collect();
    HttpResponse::Ok().json(transactions)
}

pub async fn get_block(state: web::Data<ApiState>, height: web::Path<u64>) -> impl Responder {
    match state.chain.block(height.into_inner()) {
        Some(block) => HttpResponse::Ok().json(block),
        None => HttpResponse::NotFound().json(json!({
            "status": "error",
            "error": "Block not found"
        })),
    }
}

pub async fn get_metrics() -> impl Responder {
    let metrics = crate::metrics::get_metrics();
    HttpResponse::Ok().json(metrics)
}
