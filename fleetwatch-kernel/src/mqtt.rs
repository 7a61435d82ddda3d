use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::heartbeat::{self, EVENT_TOPIC, HEARTBEAT_TOPIC};
use crate::relay;
use crate::store::CanonicalStore;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, warn};

/// Écoute les agents terminaux ; chaque publication est écrite dans le store.
/// Le même client relaie les commandes de capture vers les agents.
pub fn spawn_mqtt_listener(
    cfg: &MqttConf,
    store: Arc<dyn CanonicalStore>,
    health: HealthTracker,
) -> JoinHandle<()> {
    let mut opts = MqttOptions::new("fleetwatch-kernel", &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    info!(host = %cfg.host, port = cfg.port, "mqtt listener starting");
    let _relay_task = relay::spawn_command_relay(client.clone(), store.clone());

    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    // souscription à chaque (re)connexion, session non persistante
                    for topic in [HEARTBEAT_TOPIC, EVENT_TOPIC] {
                        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                            error!(topic, error = ?e, "mqtt subscribe failed");
                        }
                    }
                    info!("mqtt connected, agent topics subscribed");
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    heartbeat::handle_publish(store.as_ref(), &p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => health.mark_mqtt_disconnected(),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = ?e, "mqtt connection error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
