/*!
Sink MQTT pour le simulateur

Le simulateur publie à travers `MessageSink` : le vrai `rumqttc::AsyncClient`
en usage normal, `MockMqttClient` dans les tests (aucun broker requis).
*/

use anyhow::Result;
use rumqttc::{AsyncClient, QoS};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

pub trait MessageSink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

impl MessageSink for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Enregistre tout ce qui est publié, pour les assertions de tests.
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.get_published_messages()
            .into_iter()
            .filter(|msg| msg.topic == topic)
            .collect()
    }

    /// Parse tous les messages d'un topic, dans l'ordre de publication
    pub fn json_messages<T: DeserializeOwned>(&self, topic: &str) -> Result<Vec<T>> {
        self.find_messages_by_topic(topic)
            .iter()
            .map(|msg| Ok(serde_json::from_slice(&msg.payload)?))
            .collect()
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl MessageSink for MockMqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        log::debug!("[MOCK] published to {}: {} bytes", topic, payload.len());
        self.published_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockMessage { topic: topic.to_string(), payload });
        Ok(())
    }
}
