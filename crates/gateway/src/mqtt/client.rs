//! MQTT bus backed by rumqttc
//!
//! A background task drives the rumqttc event loop, turns CONNACKs and
//! connection errors into the [`ConnectionState`] signal, and backs off
//! between reconnect attempts (doubling up to the configured ceiling, with
//! jitter so a fleet of gateways does not reconnect in lockstep).

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::error::BusError;

use super::bus::{Bus, ConnectionState};

pub struct MqttBus {
    client: AsyncClient,
    qos: QoS,
    state: watch::Receiver<ConnectionState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and start driving its connection. Must be called
    /// within a tokio runtime.
    pub fn connect(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(5)));
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let backoff = Backoff::new(
            Duration::from_secs(config.reconnect_delay_secs.max(1)),
            Duration::from_secs(config.max_reconnect_delay_secs.max(config.reconnect_delay_secs)),
        );

        info!(broker = %config.broker, port = config.port, "Connecting to MQTT broker");
        let driver = tokio::spawn(drive(eventloop, state_tx, backoff));

        Self {
            client,
            qos: qos_from_level(config.qos),
            state: state_rx,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Disconnect cleanly and stop the event loop
    pub async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }
        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            // Give the event loop a moment to send DISCONNECT
            if tokio::time::timeout(Duration::from_secs(2), &mut driver).await.is_err() {
                debug!("MQTT event loop did not stop in time");
                driver.abort();
            }
        }
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        if !self.state.borrow().is_connected() {
            return Err(BusError::Disconnected);
        }
        self.client
            .publish(topic, self.qos, retain, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

async fn drive(mut eventloop: EventLoop, state: watch::Sender<ConnectionState>, mut backoff: Backoff) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected to MQTT broker");
                    backoff.reset();
                    state.send_replace(ConnectionState::Connected);
                } else {
                    warn!(code = ?ack.code, "MQTT broker refused connection");
                    state.send_replace(ConnectionState::Disconnected);
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                info!("Disconnected from MQTT broker");
                state.send_replace(ConnectionState::Disconnected);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = state.borrow().is_connected();
                state.send_replace(ConnectionState::Disconnected);
                let delay = backoff.next_delay();
                if was_connected {
                    warn!(error = %e, retry_in_secs = delay.as_secs(), "Lost MQTT connection");
                } else {
                    debug!(error = %e, retry_in_secs = delay.as_secs(), "MQTT connection attempt failed");
                }
                tokio::time::sleep(delay).await;
                state.send_replace(ConnectionState::Connecting);
            }
        }
    }
}

/// Exponential reconnect delay with +/-25% jitter
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        base.mul_f64(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        let delays: Vec<Duration> = (0..10).map(|_| backoff.next_delay()).collect();

        assert!(delays[0] >= Duration::from_millis(3750) && delays[0] <= Duration::from_millis(6250));
        assert!(delays[1] >= Duration::from_millis(7500) && delays[1] <= Duration::from_millis(12500));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(300)));
        assert!(delays[9] >= Duration::from_secs(225));

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(6250));
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_publish_refused_until_connected() {
        let config = MqttConfig {
            broker: "127.0.0.1".into(),
            port: 1,
            reconnect_delay_secs: 60,
            ..MqttConfig::default()
        };
        let bus = MqttBus::connect(&config);
        let result = bus.publish("bacnet/1/status", b"{}".to_vec(), true).await;
        assert_eq!(result, Err(BusError::Disconnected));
        bus.close().await;
    }
}
