use actix_web::web;
use super::handlers;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/consensus/state", web::get().to(handlers::get_consensus_state))
            .route("/evidence/pending", web::get().to(handlers::get_pending_evidence))
            .route("/transaction", web::post().to(handlers::create_transaction))
            .route("/transaction/{hash}", web::get().to(handlers::get_transaction))
            .route("/transactions", web::get().to(handlers::get_all_transactions))
            .route("/blocks/{height}", web::get().to(handlers::get_block))
            .route("/metrics", web::get().to(handlers::get_metrics))
    );
}
