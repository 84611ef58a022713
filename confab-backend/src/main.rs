use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod agents;
mod config;
mod controllers;
mod db;
mod domain_types;
mod error;
mod identity;
mod middleware;
mod models;
mod payments;
mod points;
mod tasks;

use agents::AgentLedger;
use config::Config;
use db::Database;
use identity::IdentityResolver;
use payments::{ChainRpc, JsonRpcChain, PaymentVerifier};
use points::PointsLedger;
use tasks::{TaskQueue, TaskWorker};

/// Pending sponsorships re-queued at startup
const STARTUP_REQUEUE_LIMIT: i64 = 500;

pub struct AppState {
    pub db: Arc<Database>,
    pub config: Config,
    pub identities: Arc<IdentityResolver>,
    pub points: Arc<PointsLedger>,
    pub verifier: Arc<PaymentVerifier>,
    pub agents: Arc<AgentLedger>,
    pub tasks: TaskQueue,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env();
    let port = config.port;

    log::info!("Initializing database at {}", config.database_url);
    let db = Database::new(&config.database_url).expect("Failed to initialize database");
    let db = Arc::new(db);

    match db.seed_agent_slots(config.agent_slot_count) {
        Ok(created) => log::info!(
            "Agent pool ready: {} slots ({} created)",
            config.agent_slot_count,
            created
        ),
        Err(e) => log::error!("Failed to seed agent slots: {}", e),
    }

    log::info!("Using chain RPC at {}", config.chain_rpc_url);
    let chain: Arc<dyn ChainRpc> = Arc::new(
        JsonRpcChain::new(
            &config.chain_rpc_url,
            Duration::from_secs(config.chain_rpc_timeout_secs),
        )
        .expect("Failed to build chain RPC client"),
    );

    let (tasks, receiver) = TaskQueue::new();
    let identities = Arc::new(IdentityResolver::new(db.clone()));
    let points = Arc::new(PointsLedger::new(db.clone(), identities.clone()));
    let verifier = Arc::new(PaymentVerifier::new(
        db.clone(),
        chain.clone(),
        config.payment_settings(),
        config.min_sponsorship,
        tasks.clone(),
    ));
    let agents = Arc::new(AgentLedger::new(
        db.clone(),
        chain,
        config.payment_settings(),
        config.agent_seed,
    ));

    log::info!("Starting background task worker");
    let cancel = CancellationToken::new();
    let worker = TaskWorker::new(tasks.clone(), receiver, points.clone(), verifier.clone());
    let worker_handle = tokio::spawn(worker.run(cancel.clone()));

    match verifier.requeue_pending(STARTUP_REQUEUE_LIMIT) {
        Ok(0) => {}
        Ok(n) => log::info!("Re-queued {} pending sponsorships", n),
        Err(e) => log::error!("Failed to re-queue pending sponsorships: {}", e),
    }

    log::info!("Starting Confab server on port {}", port);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(AppState {
                db: Arc::clone(&db),
                config: config.clone(),
                identities: Arc::clone(&identities),
                points: Arc::clone(&points),
                verifier: Arc::clone(&verifier),
                agents: Arc::clone(&agents),
                tasks: tasks.clone(),
            }))
            .wrap(Logger::default())
            .wrap(cors)
            .configure(controllers::health::config)
            .configure(controllers::auth::config)
            .configure(controllers::identity::config)
            .configure(controllers::points::config)
            .configure(controllers::activity::config)
            .configure(controllers::sponsorships::config)
            .configure(controllers::agents::config)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    cancel.cancel();
    if let Err(e) = worker_handle.await {
        log::warn!("Task worker ended abnormally: {}", e);
    }

    server
}
