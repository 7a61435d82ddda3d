/**
 * FLEETWATCH KERNEL - Point d'entrée du moteur de supervision de flotte
 *
 * RÔLE : Orchestration de tous les modules : config, store, moteur de
 * consolidation, MQTT, HTTP, health.
 *
 * ARCHITECTURE : store canonique + canal push => boucle de consolidation unique
 * => snapshots immuables lus par l'API REST.
 */

mod commands;
mod config;
mod detail;
mod engine;
mod health;
mod heartbeat;
mod http;
mod models;
mod mqtt;
mod reconcile;
mod registry;
mod relay;
mod store;
mod sweeper;
mod timeline;

use crate::commands::CommandDispatcher;
use crate::config::{load_config, FleetConfig};
use crate::engine::FleetEngine;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::store::{CanonicalStore, JsonStore};
use crate::sweeper::Sweeper;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg: FleetConfig = load_config().await;

    // store canonique
    let store: Arc<dyn CanonicalStore> = Arc::new(
        JsonStore::open(&cfg.store.path).with_context(|| format!("failed to open store at {}", cfg.store.path))?,
    );

    // health tracker
    let health_tracker = HealthTracker::new();

    // moteur : abonnement push puis fetch initial, sweeper périodique
    let (engine, _engine_task) = FleetEngine::spawn(store.clone(), &cfg.liveness, cfg.timeline.limit);

    // MQTT : heartbeats et événements agents => store, triggers de capture => agents
    let _mqtt_task = mqtt::spawn_mqtt_listener(&cfg.mqtt, store.clone(), health_tracker.clone());

    // démarre la publication auto du health
    health_tracker.spawn_health_publisher(cfg.mqtt.clone(), engine.clone());

    let api_key = std::env::var("FLEETWATCH_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        warn!("FLEETWATCH_API_KEY not set, every route but /health will answer 401");
    }

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        engine,
        commands: Arc::new(CommandDispatcher::new(store.clone())),
        store,
        health_tracker,
        sweeper: Sweeper::new(time::Duration::seconds(cfg.liveness.stale_threshold_secs as i64)),
        api_key: Arc::from(api_key),
    };

    // HTTP
    let app = http::build_router(app_state);

    let addr: SocketAddr = cfg.http.bind.parse().with_context(|| format!("invalid http bind '{}'", cfg.http.bind))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "fleetwatch kernel listening");
    axum::serve(listener, app).await?;
    Ok(())
}
