//! Telemetry publishing over MQTT.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::state::SharedState;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 10;

/// Outbound side of the rig's link to the platform.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn publish_message(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    fn device_id(&self) -> &str;
}

/// Topic the platform reads rig events from.
pub fn events_topic(device_id: &str) -> String {
    format!("/devices/{device_id}/events")
}

// ---------------------------------------------------------------------------
// rumqttc-backed publisher
// ---------------------------------------------------------------------------

pub struct MqttBroker {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    /// Broker link state, kept current by the event-loop driver.
    link: Arc<watch::Sender<bool>>,
    device_id: String,
    status: SharedState,
}

impl MqttPublisher {
    pub fn new(broker: &MqttBroker, device_id: &str, status: SharedState) -> Self {
        let mut options = MqttOptions::new(format!("hydro-rig-{device_id}"), &broker.host, broker.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some((user, pass)) = &broker.credentials {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            link: Arc::new(watch::Sender::new(false)),
            device_id: device_id.to_string(),
            status,
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    /// Wait for the broker's ConnAck, then leave the event loop running in
    /// the background. The loop is handed off even when the first attempt
    /// fails, so it keeps reconnecting; a later `connect` waits for the
    /// driver to report the link up.
    async fn connect(&self) -> Result<()> {
        let Some(mut eventloop) = self.eventloop.lock().await.take() else {
            return self.await_link().await;
        };

        let outcome = await_connack(&mut eventloop).await;
        {
            let mut st = self.status.write().await;
            match &outcome {
                Ok(()) => {
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                Err(e) => st.record_error(format!("mqtt connect failed: {e:#}")),
            }
        }
        self.link.send_replace(outcome.is_ok());
        tokio::spawn(drive(eventloop, self.link.clone(), self.status.clone()));
        outcome
    }

    /// Never waits: with the broker unreachable the request queue fills,
    /// and a full queue is reported as a failed publish.
    async fn publish_message(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish to {topic} failed"))
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl MqttPublisher {
    async fn await_link(&self) -> Result<()> {
        let mut link = self.link.subscribe();
        let up = async move { link.wait_for(|up| *up).await.is_ok() };
        match tokio::time::timeout(CONNECT_TIMEOUT, up).await {
            Ok(true) => Ok(()),
            Ok(false) => bail!("mqtt driver stopped"),
            Err(_) => bail!("mqtt still not connected after {CONNECT_TIMEOUT:?}"),
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, eventloop.poll())
            .await
            .map_err(|_| anyhow!("no answer from mqtt broker within {CONNECT_TIMEOUT:?}"))?
            .context("mqtt connect failed")?;
        if let Event::Incoming(Packet::ConnAck(ack)) = event {
            if ack.code != ConnectReturnCode::Success {
                bail!("mqtt broker refused connection: {:?}", ack.code);
            }
            info!("mqtt connected");
            return Ok(());
        }
    }
}

/// Keep the connection alive; rumqttc reconnects on the next poll after an
/// error.
async fn drive(mut eventloop: EventLoop, link: Arc<watch::Sender<bool>>, status: SharedState) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                {
                    let mut st = status.write().await;
                    if !st.mqtt_connected {
                        st.mqtt_connected = true;
                        st.record_system("mqtt connected".to_string());
                    }
                }
                link.send_replace(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                link.send_replace(false);
                let mut st = status.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                link.send_replace(false);
                {
                    let mut st = status.write().await;
                    if st.mqtt_connected {
                        st.mqtt_connected = false;
                        st.record_error(format!("mqtt error: {e}"));
                    }
                }
                sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory publisher for tests
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn broker(port: u16) -> MqttBroker {
        MqttBroker {
            host: "127.0.0.1".into(),
            port,
            credentials: None,
        }
    }

    #[test]
    fn events_topic_format() {
        assert_eq!(events_topic("rig-7"), "/devices/rig-7/events");
    }

    #[test]
    fn events_topic_keeps_id_verbatim() {
        assert_eq!(events_topic("selfhydro-abc_1"), "/devices/selfhydro-abc_1/events");
    }

    #[tokio::test]
    async fn device_id_is_reported() {
        let p = MqttPublisher::new(&broker(1883), "rig-7", SystemState::shared("rig-7"));
        assert_eq!(p.device_id(), "rig-7");
    }

    #[tokio::test]
    async fn publish_queues_without_a_running_event_loop() {
        // Requests sit in the client's channel until the event loop drains
        // them, so an unpolled client still accepts a publish.
        let p = MqttPublisher::new(&broker(1883), "rig-7", SystemState::shared("rig-7"));
        p.publish_message(&events_topic("rig-7"), b"{}".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_and_is_recorded() {
        let status = SystemState::shared("rig-7");
        let p = MqttPublisher::new(&broker(1), "rig-7", status.clone());
        let err = p.connect().await.unwrap_err();
        assert!(format!("{err:#}").contains("mqtt"), "{err:#}");

        let st = status.read().await;
        assert!(!st.mqtt_connected);
        assert!(st
            .events
            .iter()
            .any(|e| e.detail.starts_with("mqtt connect failed")));
    }

    #[tokio::test]
    async fn full_request_queue_fails_instead_of_waiting() {
        let p = MqttPublisher::new(&broker(1), "rig-7", SystemState::shared("rig-7"));
        let topic = events_topic("rig-7");
        for _ in 0..REQUEST_CAPACITY {
            p.publish_message(&topic, b"{}".to_vec()).await.unwrap();
        }
        let err = tokio::time::timeout(Duration::from_secs(1), p.publish_message(&topic, b"{}".to_vec()))
            .await
            .expect("publish waited for queue space")
            .unwrap_err();
        assert!(format!("{err:#}").contains("publish to /devices/rig-7/events failed"), "{err:#}");
    }

    #[tokio::test]
    async fn connect_after_failure_waits_for_the_driver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker_task = tokio::spawn(async move {
            // First session: hang up without answering.
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            // Second session: accept with a ConnAck and stay open.
            let (mut second, _) = listener.accept().await.unwrap();
            second.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            second
        });

        let status = SystemState::shared("rig-7");
        let p = MqttPublisher::new(&broker(port), "rig-7", status.clone());
        assert!(p.connect().await.is_err());
        p.connect().await.unwrap();
        assert!(status.read().await.mqtt_connected);
        let _session = broker_task.await.unwrap();
    }

    #[tokio::test]
    async fn fake_publisher_records_and_fails_on_demand() {
        let p = fake::FakePublisher::new("rig-7");
        p.publish_message("/t", vec![1]).await.unwrap();
        p.fail_publishes(true);
        assert!(p.publish_message("/t", vec![2]).await.is_err());
        assert_eq!(p.published(), vec![("/t".to_string(), vec![1])]);
    }
}
