//! MQTT client wrapper for the broker connection.

use crate::config::MqttConfig;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

/// Message received from the MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// MQTT client for the cover's broker connection.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl MqttClient {
    /// Create a new MQTT client from configuration. The broker publishes
    /// `offline_payload` on the availability topic as our last will when
    /// the connection dies without a clean disconnect.
    pub fn new(config: &MqttConfig, availability_topic: &str, offline_payload: &str) -> Self {
        // A random suffix keeps a restarted instance from fighting a
        // half-dead predecessor over the client id.
        let client_id = format!("{}-{:04x}", config.client_id, rand::random::<u16>());
        let mut options =
            MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        // Keep subscriptions across broker reconnects.
        options.set_clean_session(false);
        options.set_last_will(LastWill::new(
            availability_topic,
            offline_payload,
            QoS::AtLeastOnce,
            true,
        ));

        // Set credentials if provided
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        Self { client, event_loop }
    }

    /// Run the MQTT event loop and forward messages to the provided channel.
    ///
    /// This method runs indefinitely, processing MQTT events and sending
    /// received messages through the channel. Every (re)established
    /// connection is signalled on `connected` so the integration can
    /// republish its retained topics after an outage.
    pub async fn run(mut self, tx: mpsc::Sender<MqttMessage>, connected: mpsc::Sender<()>) {
        info!("Starting MQTT event loop");

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    if connected.try_send(()).is_err() {
                        debug!("connection signal not delivered");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let payload = match String::from_utf8(publish.payload.to_vec()) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("Invalid UTF-8 in MQTT payload: {}", e);
                            continue;
                        }
                    };

                    debug!("Received MQTT message on {}: {}", topic, payload);

                    let msg = MqttMessage { topic, payload };
                    if tx.send(msg).await.is_err() {
                        error!("MQTT message channel closed");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {:?}", e);
                    // Wait before reconnecting
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Get a clone of the async client for publishing from other tasks.
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }
}
