//! Publie une flotte simulée sur MQTT.
//!
//! Variables d'environnement :
//! - FLEETWATCH_MQTT_HOST / FLEETWATCH_MQTT_PORT (localhost:1883)
//! - FLEETWATCH_SIM_TERMINALS : nombre de postes, ids 1..=N (4)
//! - FLEETWATCH_SIM_UNATTENDED : ids sans client, ex "3,4"
//! - FLEETWATCH_SIM_SILENT : ids qui cessent de publier, ex "2"
//! - FLEETWATCH_SIM_SILENT_AFTER : heartbeats avant le silence (3)
//!
//! Les commandes "snapshot" relayées par le kernel sont servies au heartbeat suivant.

use anyhow::{Context, Result};
use chrono::Utc;
use fleetwatch_devkit::simulator::{COMMAND_TOPIC, SYNC_INTERVAL_SECS};
use fleetwatch_devkit::{AgentCommandIn, SimProfile, SimulatedFleet, TerminalSimulator};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_ids(key: &str) -> Vec<u32> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let host: String = env_or("FLEETWATCH_MQTT_HOST", "localhost".to_string());
    let port: u16 = env_or("FLEETWATCH_MQTT_PORT", 1883);
    let count: u32 = env_or("FLEETWATCH_SIM_TERMINALS", 4);
    let silent_after: u32 = env_or("FLEETWATCH_SIM_SILENT_AFTER", 3);
    let unattended = env_ids("FLEETWATCH_SIM_UNATTENDED");
    let silent = env_ids("FLEETWATCH_SIM_SILENT");

    let started_at = Utc::now();
    let terminals = (1..=count)
        .map(|id| {
            let profile = if silent.contains(&id) {
                SimProfile::Silent { after: silent_after }
            } else if unattended.contains(&id) {
                SimProfile::Unattended
            } else {
                SimProfile::Active
            };
            TerminalSimulator::new(id, profile, started_at)
        })
        .collect();
    let mut fleet = SimulatedFleet::new(terminals);

    let mut opts = MqttOptions::new(format!("fleetwatch-sim-{}", std::process::id()), &host, port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    // l'eventloop doit tourner pour que les publications partent ; elle remonte aussi les commandes
    let (command_tx, mut command_rx) = mpsc::channel::<AgentCommandIn>(32);
    let subscriber = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // abonnement renouvelé à chaque (re)connexion
                    if let Err(e) = subscriber.try_subscribe(COMMAND_TOPIC, QoS::AtLeastOnce) {
                        log::warn!("subscribe to {} failed: {}", COMMAND_TOPIC, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == COMMAND_TOPIC => {
                    match serde_json::from_slice::<AgentCommandIn>(&p.payload) {
                        Ok(command) => {
                            if command_tx.send(command).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("invalid command payload: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("MQTT error: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    log::info!("simulating {} terminals against {}:{}", count, host, port);
    fleet.start(&client).await.context("failed to publish start events")?;

    let mut interval = tokio::time::interval(Duration::from_secs(SYNC_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match fleet.tick(&client, Utc::now()).await {
                    Ok(published) => log::debug!("{} heartbeats published", published),
                    Err(e) => log::warn!("heartbeat tick failed: {}", e),
                }
            }
            Some(command) = command_rx.recv() => {
                if fleet.apply_command(&command) {
                    log::info!("terminal {} captures for trigger {}", command.terminal_id, command.refresh_trigger);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("stopping simulated fleet");
                fleet.stop(&client).await?;
                // laisse l'eventloop vider la file avant de quitter
                tokio::time::sleep(Duration::from_millis(500)).await;
                return Ok(());
            }
        }
    }
}
