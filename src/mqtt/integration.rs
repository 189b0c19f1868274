//! MQTT cover integration.
//!
//! Presents the window as an MQTT cover the way Home Assistant expects it:
//! a state topic, a retained position topic, a retained availability topic
//! backed by the client's last will, a JSON attributes topic and two
//! command topics. On startup the retained position is read back once and
//! handed to the controller as the persisted position before any command
//! subscription exists.

use super::client::{MqttClient, MqttMessage};
use crate::config::MqttConfig;
use crate::cover::{CoverCommand, CoverEvent, CoverState};
use log::{debug, info, warn};
use rumqttc::{AsyncClient, QoS};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

/// How long to wait for a retained position before giving up on restore.
const RESTORE_WAIT: Duration = Duration::from_secs(2);

fn state_payload(state: &CoverState) -> &'static str {
    if state.opening {
        "opening"
    } else if state.closing {
        "closing"
    } else if state.closed {
        "closed"
    } else {
        "open"
    }
}

/// Flatten an endpoint like "/dev/ttyUSB0" or "10.0.0.30:23" into a topic
/// segment the discovery schema accepts.
fn slug(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// MQTT cover integration orchestrator.
///
/// Owns the broker connection, routes inbound commands to the controller
/// and publishes controller events, keeping MQTT internals out of main.rs.
pub struct MqttIntegration {
    config: MqttConfig,
    unique_id: String,
    cmd_tx: mpsc::Sender<CoverCommand>,
    event_rx: mpsc::Receiver<CoverEvent>,
    last_state: Option<CoverState>,
    info: Option<crate::device::DriveInfo>,
}

impl MqttIntegration {
    pub fn new(
        config: MqttConfig,
        unique_id: String,
        cmd_tx: mpsc::Sender<CoverCommand>,
        event_rx: mpsc::Receiver<CoverEvent>,
    ) -> Self {
        Self {
            config,
            unique_id,
            cmd_tx,
            event_rx,
            last_state: None,
            info: None,
        }
    }

    fn state_topic(&self) -> String {
        format!("{}/state", self.config.base_topic)
    }

    fn position_topic(&self) -> String {
        format!("{}/position", self.config.base_topic)
    }

    fn availability_topic(&self) -> String {
        format!("{}/availability", self.config.base_topic)
    }

    fn attributes_topic(&self) -> String {
        format!("{}/attributes", self.config.base_topic)
    }

    fn command_topic(&self) -> String {
        format!("{}/set", self.config.base_topic)
    }

    fn set_position_topic(&self) -> String {
        format!("{}/position/set", self.config.base_topic)
    }

    fn discovery_topic(&self) -> String {
        format!(
            "{}/cover/{}/config",
            self.config.discovery_prefix,
            slug(&self.unique_id)
        )
    }

    fn discovery_payload(&self) -> serde_json::Value {
        let mut device = json!({
            "identifiers": [self.unique_id],
            "name": self.config.cover_name,
            "manufacturer": "AXA",
        });
        if let Some(info) = &self.info {
            device["model"] = json!(info.device);
            device["sw_version"] = json!(info.version);
        }
        json!({
            "name": self.config.cover_name,
            "unique_id": self.unique_id,
            "device_class": "window",
            "command_topic": self.command_topic(),
            "set_position_topic": self.set_position_topic(),
            "state_topic": self.state_topic(),
            "position_topic": self.position_topic(),
            "availability_topic": self.availability_topic(),
            "json_attributes_topic": self.attributes_topic(),
            "position_open": 100,
            "position_closed": 0,
            "optimistic": false,
            "device": device,
        })
    }

    fn attributes_payload(&self) -> serde_json::Value {
        let mut attrs = json!({
            "assumed_state": self.last_state.as_ref().map(|s| s.assumed).unwrap_or(true),
            "last_seen": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(info) = &self.info {
            attrs["device"] = json!(info.device);
            attrs["version"] = json!(info.version);
        }
        attrs
    }

    /// Start the MQTT integration.
    ///
    /// Spawns a background task that connects to the broker, restores the
    /// persisted position, subscribes to the command topics and routes
    /// traffic in both directions. Returns a JoinHandle that can be used
    /// to abort the task on shutdown.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        info!(
            "[MQTT] Connecting to {}:{}",
            self.config.broker_host, self.config.broker_port
        );

        let availability_topic = self.availability_topic();
        let mqtt_client = MqttClient::new(&self.config, &availability_topic, PAYLOAD_OFFLINE);

        // Client handle for subscribing/publishing (AsyncClient is Send+Sync)
        let client = mqtt_client.client();

        // Channels for MQTT messages and connection notifications
        let (msg_tx, mut msg_rx) = mpsc::channel::<MqttMessage>(64);
        let (conn_tx, mut conn_rx) = mpsc::channel::<()>(4);

        // Start MQTT event loop FIRST (so it can establish connection)
        let mqtt_loop = tokio::spawn(async move {
            mqtt_client.run(msg_tx, conn_tx).await;
        });

        // Wait for connection (with timeout)
        match tokio::time::timeout(Duration::from_secs(10), conn_rx.recv()).await {
            Ok(Some(())) => {
                info!("[MQTT] Connection established");
            }
            Ok(None) => {
                warn!("[MQTT] Connection signal channel dropped");
                return;
            }
            Err(_) => {
                warn!("[MQTT] Connection timeout after 10 seconds");
                mqtt_loop.abort();
                return;
            }
        }

        // Read back the retained position once, then hand it to the
        // controller before any command can arrive.
        let persisted = self.read_persisted_position(&client, &mut msg_rx).await;
        if self
            .cmd_tx
            .send(CoverCommand::Restore(persisted))
            .await
            .is_err()
        {
            warn!("[MQTT] Controller is gone, stopping integration");
            mqtt_loop.abort();
            return;
        }

        for topic in [self.command_topic(), self.set_position_topic()] {
            info!("[MQTT] Subscribing to {}", topic);
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                warn!("[MQTT] Failed to subscribe to {}: {:?}", topic, e);
            }
        }

        if self.config.announce {
            self.publish_discovery(&client).await;
        }

        info!("[MQTT] Cover integration started for {}", self.unique_id);

        loop {
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => self.publish_event(&client, event).await,
                    None => break, // Controller shut down
                },
                msg = msg_rx.recv() => match msg {
                    Some(msg) => self.handle_message(&msg.topic, &msg.payload).await,
                    None => break, // Event loop ended
                },
                Some(()) = conn_rx.recv() => {
                    // Back after a broker outage: the last will has wiped
                    // the retained availability, so put everything back.
                    info!("[MQTT] Reconnected, republishing retained state");
                    if self.config.announce {
                        self.publish_discovery(&client).await;
                    }
                    self.publish_state(&client).await;
                },
            }
        }

        // Leave a clean offline marker on a graceful shutdown.
        if let Err(e) = client
            .publish(
                &availability_topic,
                QoS::AtLeastOnce,
                true,
                PAYLOAD_OFFLINE.as_bytes(),
            )
            .await
        {
            debug!("[MQTT] Could not publish offline marker: {:?}", e);
        }
        // Small delay so the event loop flushes the marker before we kill it
        tokio::time::sleep(Duration::from_millis(100)).await;
        mqtt_loop.abort();
        info!("[MQTT] Cover integration stopped");
    }

    /// Wait briefly for the retained message on the position topic.
    async fn read_persisted_position(
        &self,
        client: &AsyncClient,
        msg_rx: &mut mpsc::Receiver<MqttMessage>,
    ) -> Option<u8> {
        let position_topic = self.position_topic();
        if let Err(e) = client.subscribe(&position_topic, QoS::AtLeastOnce).await {
            warn!("[MQTT] Failed to subscribe to {}: {:?}", position_topic, e);
            return None;
        }

        let persisted = match tokio::time::timeout(RESTORE_WAIT, msg_rx.recv()).await {
            Ok(Some(msg)) if msg.topic == position_topic => {
                match msg.payload.trim().parse::<u8>() {
                    Ok(position) => {
                        info!("[MQTT] Restored position {}% from retained state", position);
                        Some(position)
                    }
                    Err(_) => {
                        warn!(
                            "[MQTT] Ignoring unparseable retained position: {}",
                            msg.payload
                        );
                        None
                    }
                }
            }
            Ok(Some(msg)) => {
                debug!("[MQTT] Unexpected message during restore on {}", msg.topic);
                None
            }
            Ok(None) | Err(_) => {
                info!("[MQTT] No retained position to restore");
                None
            }
        };

        if let Err(e) = client.unsubscribe(&position_topic).await {
            warn!("[MQTT] Failed to unsubscribe from {}: {:?}", position_topic, e);
        }
        persisted
    }

    async fn handle_message(&self, topic: &str, payload: &str) {
        if topic == self.command_topic() {
            let command = match payload.trim().to_ascii_uppercase().as_str() {
                "OPEN" => CoverCommand::Open,
                "CLOSE" => CoverCommand::Close,
                "STOP" => CoverCommand::Stop,
                other => {
                    warn!("[MQTT] Unknown cover command: {}", other);
                    return;
                }
            };
            if self.cmd_tx.send(command).await.is_err() {
                warn!("[MQTT] Controller channel closed");
            }
        } else if topic == self.set_position_topic() {
            match payload.trim().parse::<u8>() {
                Ok(position) if position <= 100 => {
                    if self
                        .cmd_tx
                        .send(CoverCommand::SetPosition(position))
                        .await
                        .is_err()
                    {
                        warn!("[MQTT] Controller channel closed");
                    }
                }
                _ => warn!("[MQTT] Invalid position payload: {}", payload),
            }
        } else {
            debug!("[MQTT] Unhandled topic {}", topic);
        }
    }

    async fn publish_event(&mut self, client: &AsyncClient, event: CoverEvent) {
        match event {
            CoverEvent::StateChanged(state) => {
                self.last_state = Some(state);
                self.publish_state(client).await;
            }
            CoverEvent::DeviceInfo(info) => {
                info!("[MQTT] Drive identified as {} ({})", info.device, info.version);
                self.info = Some(info);
                if self.config.announce {
                    self.publish_discovery(client).await;
                }
                self.publish_attributes(client).await;
            }
            CoverEvent::RefreshFailed(e) => {
                debug!("[MQTT] Refresh failure reported: {}", e);
            }
        }
    }

    async fn publish_state(&mut self, client: &AsyncClient) {
        let Some(state) = self.last_state.clone() else {
            return;
        };
        let availability = if state.available {
            PAYLOAD_ONLINE
        } else {
            PAYLOAD_OFFLINE
        };
        if let Err(e) = client
            .publish(
                &self.availability_topic(),
                QoS::AtLeastOnce,
                true,
                availability.as_bytes(),
            )
            .await
        {
            warn!("[MQTT] Failed to publish availability: {:?}", e);
        }
        if let Err(e) = client
            .publish(
                &self.state_topic(),
                QoS::AtMostOnce,
                true,
                state_payload(&state).as_bytes(),
            )
            .await
        {
            warn!("[MQTT] Failed to publish state: {:?}", e);
        }
        if let Some(position) = state.position {
            if let Err(e) = client
                .publish(
                    &self.position_topic(),
                    QoS::AtMostOnce,
                    true,
                    position.to_string().as_bytes(),
                )
                .await
            {
                warn!("[MQTT] Failed to publish position: {:?}", e);
            }
        }
        self.publish_attributes(client).await;
    }

    async fn publish_attributes(&self, client: &AsyncClient) {
        let payload = self.attributes_payload().to_string();
        if let Err(e) = client
            .publish(
                &self.attributes_topic(),
                QoS::AtMostOnce,
                true,
                payload.as_bytes(),
            )
            .await
        {
            warn!("[MQTT] Failed to publish attributes: {:?}", e);
        }
    }

    async fn publish_discovery(&self, client: &AsyncClient) {
        let payload = self.discovery_payload().to_string();
        info!("[MQTT] Announcing cover on {}", self.discovery_topic());
        if let Err(e) = client
            .publish(
                &self.discovery_topic(),
                QoS::AtLeastOnce,
                true,
                payload.as_bytes(),
            )
            .await
        {
            warn!("[MQTT] Failed to publish discovery announcement: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn integration() -> (MqttIntegration, mpsc::Receiver<CoverCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (_event_tx, event_rx) = mpsc::channel::<CoverEvent>(16);
        let config = Config::default().mqtt;
        (
            MqttIntegration::new(config, "/dev/ttyUSB0".to_string(), cmd_tx, event_rx),
            cmd_rx,
        )
    }

    #[test]
    fn test_topics_derive_from_base_topic() {
        let (integration, _) = integration();
        assert_eq!(integration.state_topic(), "window-cover/window/state");
        assert_eq!(integration.position_topic(), "window-cover/window/position");
        assert_eq!(
            integration.availability_topic(),
            "window-cover/window/availability"
        );
        assert_eq!(integration.command_topic(), "window-cover/window/set");
        assert_eq!(
            integration.set_position_topic(),
            "window-cover/window/position/set"
        );
        assert_eq!(
            integration.discovery_topic(),
            "homeassistant/cover/_dev_ttyUSB0/config"
        );
    }

    #[test]
    fn test_state_payload_mapping() {
        let mut state = CoverState::unknown();
        state.available = true;

        state.opening = true;
        assert_eq!(state_payload(&state), "opening");

        state.opening = false;
        state.closing = true;
        assert_eq!(state_payload(&state), "closing");

        state.closing = false;
        state.closed = true;
        assert_eq!(state_payload(&state), "closed");

        state.closed = false;
        assert_eq!(state_payload(&state), "open");
    }

    #[test]
    fn test_discovery_payload_lists_all_topics() {
        let (integration, _) = integration();
        let payload = integration.discovery_payload();
        assert_eq!(payload["device_class"], "window");
        assert_eq!(payload["command_topic"], "window-cover/window/set");
        assert_eq!(
            payload["set_position_topic"],
            "window-cover/window/position/set"
        );
        assert_eq!(payload["position_topic"], "window-cover/window/position");
        assert_eq!(payload["position_open"], 100);
        assert_eq!(payload["position_closed"], 0);
        assert_eq!(payload["unique_id"], "/dev/ttyUSB0");
        assert_eq!(payload["device"]["manufacturer"], "AXA");
    }

    #[test]
    fn test_slug_flattens_endpoints() {
        assert_eq!(slug("/dev/ttyUSB0"), "_dev_ttyUSB0");
        assert_eq!(slug("10.0.0.30:23"), "10_0_0_30_23");
    }

    #[tokio::test]
    async fn test_commands_are_routed_to_controller() {
        let (integration, mut cmd_rx) = integration();
        let set = integration.command_topic();

        integration.handle_message(&set, "OPEN").await;
        assert_eq!(cmd_rx.recv().await.unwrap(), CoverCommand::Open);

        integration.handle_message(&set, "close").await;
        assert_eq!(cmd_rx.recv().await.unwrap(), CoverCommand::Close);

        integration.handle_message(&set, "STOP").await;
        assert_eq!(cmd_rx.recv().await.unwrap(), CoverCommand::Stop);

        integration.handle_message(&set, "JUMP").await;
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_position_commands_are_validated() {
        let (integration, mut cmd_rx) = integration();
        let topic = integration.set_position_topic();

        integration.handle_message(&topic, "42").await;
        assert_eq!(
            cmd_rx.recv().await.unwrap(),
            CoverCommand::SetPosition(42)
        );

        integration.handle_message(&topic, "142").await;
        integration.handle_message(&topic, "nope").await;
        assert!(cmd_rx.try_recv().is_err());
    }
}
