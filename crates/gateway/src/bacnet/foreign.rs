//! Foreign-device registration
//!
//! Keeps the gateway registered with a broadcast-relay node so discovery
//! reaches devices on other subnets. Registration happens on the first tick
//! and is renewed at half the TTL; stopping the service unregisters.

use std::sync::Arc;

use async_trait::async_trait;
use gateway_runtime::{Service, ServiceContext, ServiceResult, ServiceSpec};
use tracing::{debug, info, warn};

use crate::config::ForeignDeviceConfig;

use super::client::FieldClient;

pub struct ForeignDeviceService {
    client: Arc<dyn FieldClient>,
    config: ForeignDeviceConfig,
    registered: bool,
}

impl ForeignDeviceService {
    pub fn new(client: Arc<dyn FieldClient>, config: ForeignDeviceConfig) -> Self {
        Self {
            client,
            config,
            registered: false,
        }
    }
}

#[async_trait]
impl Service for ForeignDeviceService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("bacnet/foreign-device", "Foreign Device Registration")
            .with_tick_interval(self.config.renewal_interval())
            .with_description("Registration with a broadcast-relay node")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        info!(
            relay = %self.config.relay_address(),
            ttl = self.config.ttl,
            "Foreign device registration enabled"
        );
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if !self.registered {
            return Ok(());
        }
        let relay = self.config.relay_address();
        match self.client.register_foreign_device(&relay, 0).await {
            Ok(()) => info!(%relay, "Unregistered from relay"),
            Err(e) => warn!(%relay, error = %e, "Failed to unregister from relay"),
        }
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let relay = self.config.relay_address();
        match self
            .client
            .register_foreign_device(&relay, self.config.ttl)
            .await
        {
            Ok(()) => {
                if !self.registered {
                    info!(%relay, ttl = self.config.ttl, "Registered as foreign device");
                } else {
                    debug!(%relay, "Foreign device registration renewed");
                }
                self.registered = true;
            }
            // Retried at the next renewal
            Err(e) => warn!(%relay, error = %e, "Foreign device registration failed"),
        }
        Ok(())
    }
}
