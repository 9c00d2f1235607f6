//! Message-bus collaborator
//!
//! The publisher sees the broker only through [`Bus`]: a publish call and a
//! connection-state signal raised by whoever owns the connection.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::BusError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether moving from `previous` to this state ends a live connection
    ///
    /// Reconnect attempts cycle between `Connecting` and `Disconnected`;
    /// those transitions are not losses.
    pub fn is_loss_from(&self, previous: ConnectionState) -> bool {
        previous.is_connected() && !self.is_connected()
    }
}

#[async_trait]
pub trait Bus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;

    /// Connection-state signal; the current value is the live state
    fn connection(&self) -> watch::Receiver<ConnectionState>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Published {
        pub topic: String,
        pub payload: serde_json::Value,
        pub retain: bool,
    }

    /// In-memory bus whose connection is flipped by the test
    pub struct RecordingBus {
        state: watch::Sender<ConnectionState>,
        published: Mutex<Vec<Published>>,
    }

    impl RecordingBus {
        pub fn new(state: ConnectionState) -> Self {
            Self {
                state: watch::Sender::new(state),
                published: Mutex::new(Vec::new()),
            }
        }

        pub fn set_connected(&self, connected: bool) {
            self.state.send_replace(if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            });
        }

        pub fn published(&self) -> Vec<Published> {
            self.published.lock().clone()
        }

        pub fn take(&self) -> Vec<Published> {
            std::mem::take(&mut *self.published.lock())
        }
    }

    #[async_trait]
    impl Bus for RecordingBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
            if !self.state.borrow().is_connected() {
                return Err(BusError::Disconnected);
            }
            let payload = serde_json::from_slice(&payload)
                .map_err(|e| BusError::Publish(e.to_string()))?;
            self.published.lock().push(Published {
                topic: topic.to_string(),
                payload,
                retain,
            });
            Ok(())
        }

        fn connection(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }
    }
}
