// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/glowbarn-rs

//! MQTT notifier
//!
//! A send succeeds only once the broker has acknowledged the publish.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Notifier;
use crate::config::NotifierConfig;
use crate::delivery::QueuedMessage;
use crate::error::{PipelineError, Result};

const KEEP_ALIVE_SECS: u64 = 30;
const RECONNECT_DELAY_SECS: u64 = 5;
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Matches QoS 1 publishes to their PUBACKs.
///
/// The event loop writes publishes in request order, so a waiter registered
/// before `publish` is bound to the next outgoing packet id.
#[derive(Default)]
struct AckTracker {
    unassigned: VecDeque<oneshot::Sender<()>>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn register(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.unassigned.push_back(tx);
        rx
    }

    /// The most recent registration never reached the request channel
    fn abandon_last(&mut self) {
        self.unassigned.pop_back();
    }

    fn on_outgoing(&mut self, pkid: u16) {
        if let Some(waiter) = self.unassigned.pop_front() {
            self.in_flight.insert(pkid, waiter);
        }
    }

    fn on_ack(&mut self, pkid: u16) -> bool {
        match self.in_flight.remove(&pkid) {
            Some(waiter) => waiter.send(()).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding publish
    fn on_disconnect(&mut self) -> usize {
        let dropped = self.unassigned.len() + self.in_flight.len();
        self.unassigned.clear();
        self.in_flight.clear();
        dropped
    }
}

/// Publishes each message as JSON to one topic
pub struct MqttNotifier {
    client: AsyncClient,
    topic: String,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<AckTracker>>,
    publish_turn: tokio::sync::Mutex<()>,
    event_loop: JoinHandle<()>,
}

impl MqttNotifier {
    /// Must be called from inside a tokio runtime
    pub fn new(config: &NotifierConfig) -> anyhow::Result<Self> {
        if config.mqtt_topic.is_empty() {
            anyhow::bail!("mqtt notifier needs mqtt_topic");
        }

        let mut options = MqttOptions::new(&config.mqtt_client_id, &config.mqtt_broker, config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let tracker = acks.clone();

        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        flag.store(true, Ordering::Release);
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        tracker.lock().on_outgoing(pkid);
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        if !tracker.lock().on_ack(ack.pkid) {
                            debug!("MQTT puback {} with no waiter", ack.pkid);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let dropped = tracker.lock().on_disconnect();
                        if dropped > 0 {
                            warn!("{} MQTT publishes unacknowledged at disconnect", dropped);
                        }
                        if flag.swap(false, Ordering::AcqRel) {
                            warn!("MQTT connection lost: {}", e);
                        } else {
                            debug!("MQTT connect failed: {}", e);
                        }
                        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                    }
                }
            }
        });

        info!("MQTT notifier for {}:{} topic {}", config.mqtt_broker, config.mqtt_port, config.mqtt_topic);
        Ok(Self {
            client,
            topic: config.mqtt_topic.clone(),
            connected,
            acks,
            publish_turn: tokio::sync::Mutex::new(()),
            event_loop,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl Notifier for MqttNotifier {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn send(&self, message: &QueuedMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(PipelineError::DeliveryFailure("MQTT broker not connected".into()));
        }
        let payload = serde_json::to_vec(message)?;

        let acked = {
            let _turn = self.publish_turn.lock().await;
            let acked = self.acks.lock().register();
            if let Err(e) = self
                .client
                .publish(&self.topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                self.acks.lock().abandon_last();
                return Err(PipelineError::DeliveryFailure(format!("MQTT publish failed: {}", e)));
            }
            acked
        };

        match tokio::time::timeout(ACK_TIMEOUT, acked).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PipelineError::DeliveryFailure(
                "MQTT connection lost before PUBACK".into(),
            )),
            Err(_) => Err(PipelineError::DeliveryFailure(format!(
                "no PUBACK within {:?}",
                ACK_TIMEOUT
            ))),
        }
    }
}
