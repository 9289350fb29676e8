use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use serde_json::{Value, json};

use crate::config::MqttConfig;

/// Receives remote commands decoded from the command topic. Invoked on the
/// bridge's event thread, concurrently with the polling loop.
pub(crate) trait CommandSink: Send + Sync {
    fn on_command(&self, command: &str, data: Value);
}

/// Outbound telemetry channel. Disabled configurations get the null variant,
/// so the controller never branches on whether messaging is available.
pub(crate) trait MessagingBridge: Send {
    fn start(&self);
    fn stop(&self);
    fn publish_state(&self, payload: &Value);
}

pub(crate) struct NullBridge;

impl MessagingBridge for NullBridge {
    fn start(&self) {}
    fn stop(&self) {}
    fn publish_state(&self, _payload: &Value) {}
}

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct BridgeInner {
    client: Client,
    worker: thread::JoinHandle<()>,
}

/// MQTT bridge for remote control and telemetry, e.g. from Home Assistant.
/// Publishes snapshots to `<base_topic>/state` and dispatches messages on
/// `<base_topic>/command/#` to the command sink.
pub(crate) struct MqttBridge {
    config: MqttConfig,
    sink: Arc<dyn CommandSink>,
    stopping: Arc<AtomicBool>,
    inner: Mutex<Option<BridgeInner>>,
}

impl MqttBridge {
    pub(crate) fn new(config: MqttConfig, sink: Arc<dyn CommandSink>) -> Self {
        MqttBridge {
            config,
            sink,
            stopping: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(None),
        }
    }

    fn state_topic(&self) -> String {
        format!("{}/state", self.config.base_topic)
    }
}

impl MessagingBridge for MqttBridge {
    fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_some() {
            return;
        }
        self.stopping.store(false, Ordering::Relaxed);

        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keepalive));
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }

        let (client, connection) = Client::new(options, 16);
        let sink = self.sink.clone();
        let stopping = self.stopping.clone();
        let base_topic = self.config.base_topic.clone();
        let worker_client = client.clone();
        let worker = thread::spawn(move || {
            run_event_loop(connection, worker_client, sink, base_topic, stopping)
        });

        info!(
            "MQTT connecting to {}:{} (base topic {})",
            self.config.host, self.config.port, self.config.base_topic
        );
        *inner = Some(BridgeInner { client, worker });
    }

    fn stop(&self) {
        let Some(BridgeInner { client, worker }) = self.inner.lock().unwrap().take() else {
            return;
        };
        self.stopping.store(true, Ordering::Relaxed);
        if let Err(err) = client.disconnect() {
            debug!("MQTT disconnect: {err}");
        }
        let _ = worker.join();
    }

    fn publish_state(&self, payload: &Value) {
        let inner = self.inner.lock().unwrap();
        let Some(inner) = inner.as_ref() else {
            return;
        };
        let result = inner.client.try_publish(
            self.state_topic(),
            QoS::AtMostOnce,
            false,
            payload.to_string(),
        );
        if let Err(err) = result {
            debug!("MQTT state publish dropped: {err}");
        }
    }
}

fn run_event_loop(
    mut connection: Connection,
    client: Client,
    sink: Arc<dyn CommandSink>,
    base_topic: String,
    stopping: Arc<AtomicBool>,
) {
    let command_prefix = format!("{base_topic}/command/");
    let mut reported_error = false;

    for event in connection.iter() {
        if stopping.load(Ordering::Relaxed) {
            break;
        }
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                reported_error = false;
                // Subscriptions do not survive a reconnect, so renew on
                // every ConnAck.
                let topic = format!("{command_prefix}#");
                match client.subscribe(topic.as_str(), QoS::AtMostOnce) {
                    Ok(()) => info!("MQTT connected, listening on {topic}"),
                    Err(err) => warn!("MQTT subscribe to {topic} failed: {err}"),
                }
            }
            Ok(Event::Incoming(Packet::Publish(message))) => {
                let Some(command) = command_name(&message.topic, &command_prefix) else {
                    continue;
                };
                let data = decode_payload(&message.payload);
                sink.on_command(command, data);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(err) => {
                // One warning per outage; retries stay quiet.
                if reported_error {
                    debug!("MQTT connection error: {err}");
                } else {
                    warn!("MQTT connection error: {err}");
                    reported_error = true;
                }
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

fn command_name<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    topic.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

/// Command payloads are JSON documents; a bare value (e.g. `75` published
/// from a dashboard slider as plain text) is wrapped as `{"value": ...}`.
fn decode_payload(payload: &[u8]) -> Value {
    let raw = String::from_utf8_lossy(payload);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "value": trimmed }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_name_strips_prefix() {
        assert_eq!(
            command_name("nextup/series/command/pause/toggle", "nextup/series/command/"),
            Some("pause/toggle")
        );
        assert_eq!(
            command_name("nextup/series/command/seek", "nextup/series/command/"),
            Some("seek")
        );
    }

    #[test]
    fn command_name_rejects_foreign_and_bare_topics() {
        assert_eq!(command_name("other/state", "nextup/series/command/"), None);
        assert_eq!(
            command_name("nextup/series/command/", "nextup/series/command/"),
            None
        );
    }

    #[test]
    fn decode_payload_parses_json_documents() {
        assert_eq!(
            decode_payload(br#"{"seconds": -30}"#),
            json!({"seconds": -30})
        );
    }

    #[test]
    fn decode_payload_wraps_bare_values() {
        assert_eq!(decode_payload(b"75"), json!(75));
        assert_eq!(decode_payload(b"on"), json!({"value": "on"}));
        assert_eq!(decode_payload(b"  "), json!({}));
    }

    #[test]
    fn null_bridge_is_inert() {
        let bridge = NullBridge;
        bridge.start();
        bridge.publish_state(&json!({"episode": "ep01.mkv"}));
        bridge.stop();
    }
}
