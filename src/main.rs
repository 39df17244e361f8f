use actix_web::{web, App, HttpServer};
use anyhow::Context;
use log::{debug, info};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

use reimint_node::api::{self, ApiState};
use reimint_node::config::NodeConfig;
use reimint_node::consensus::evpool::{EvidencePool, MemoryEvidenceStore};
use reimint_node::consensus::validator_set::{ActiveValidatorSet, Validator};
use reimint_node::consensus::ConsensusEngine;
use reimint_node::ledger::{genesis_validators, BlockDriver, DevChain};
use reimint_node::metrics;
use reimint_node::security::Signer;
use reimint_node::types::block::BlockHeader;
use reimint_node::types::transaction_pool::TransactionPool;

fn load_config() -> anyhow::Result<NodeConfig> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => NodeConfig::load(&path).with_context(|| format!("loading {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    metrics::init_metrics();
    info!("Starting Reimint node...");

    let config = load_config()?;
    let signer = match &config.validator.key_seed {
        Some(seed) => Signer::from_seed_hex(seed, config.validator.alternate_key_seed.as_deref())?,
        None => Signer::generate(),
    };
    let signer = Arc::new(signer);
    info!("Validator address {}", signer.address());

    // without a genesis set the node runs a single-validator network
    let validators = if config.genesis.validators.is_empty() {
        ActiveValidatorSet::new(vec![Validator::new(
            signer.public_key(),
            signer.alternate_public_key(),
            10,
        )])?
    } else {
        genesis_validators(&config.genesis)?
    };
    let genesis = BlockHeader::genesis(config.genesis.timestamp);

    if let Some(addr) = &config.metrics.listen_addr {
        metrics::install_exporter(addr.parse()?)?;
        info!("Prometheus exporter listening on {}", addr);
    }

    let evidence = EvidencePool::init(Arc::new(MemoryEvidenceStore::new()), &config.evidence, 0).await?;
    let evidence = Arc::new(tokio::sync::Mutex::new(evidence));
    let (chain, mut outbound, committed) = DevChain::new(
        config.chain_id,
        genesis.clone(),
        validators.clone(),
        evidence.clone(),
        config.consensus.batched_votes_height,
    );
    let chain = Arc::new(chain);
    let pool = Arc::new(Mutex::new(TransactionPool::new()));

    let driver = BlockDriver::new(
        chain.clone(),
        pool.clone(),
        signer.address(),
        config.consensus.max_transactions_per_block,
    );
    let engine = ConsensusEngine::start(
        Arc::new(config.consensus.clone()),
        config.chain_id,
        chain.clone(),
        signer.clone(),
        genesis.clone(),
        validators,
        driver.pending_block(&genesis),
    );
    tokio::spawn(driver.run(engine.handle(), committed));

    // no transport is wired in; outbound gossip is only logged
    tokio::spawn(async move {
        while let Some((message, target)) = outbound.recv().await {
            debug!("Outbound {} to {:?}", message.kind(), target);
        }
    });

    let state = ApiState {
        status: engine.subscribe(),
        evidence,
        pool,
        chain,
    };
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(api::routes::config)
    })
    .bind(&config.api.listen_addr)?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);
    info!("API listening on {}", config.api.listen_addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    server_handle.stop(true).await;
    engine.abort().await;
    server_task.await??;

    Ok(())
}
