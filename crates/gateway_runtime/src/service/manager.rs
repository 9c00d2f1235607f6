//! Service Manager
//!
//! Spawns services onto their own tasks, routes bus events to subscribers,
//! and coordinates graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{
    Event, EventPublisher, Service, ServiceCommand, ServiceContext, ServiceError, ServiceHandle,
    ServiceResult, ServiceSpec, ServiceState,
};

struct RunningService {
    handle: ServiceHandle,
    join_handle: JoinHandle<ServiceResult<()>>,
    spec: ServiceSpec,
}

/// Central manager for all gateway services
pub struct ServiceManager {
    services: DashMap<String, RunningService>,
    shutdown_tx: broadcast::Sender<()>,
    event_tx: broadcast::Sender<Event>,
    default_shutdown_timeout: Duration,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (event_tx, _) = broadcast::channel(1024);

        Self {
            services: DashMap::new(),
            shutdown_tx,
            event_tx,
            default_shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Get an event publisher bound to this manager's bus
    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher::new(self.event_tx.clone())
    }

    /// Spawn a service and return a handle to it
    ///
    /// Service ids are unique; spawning a second service with a live id fails.
    /// A zero tick interval is refused before the service task starts.
    pub async fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        let service_id = spec.id.clone();

        if self.services.contains_key(&service_id) {
            return Err(ServiceError::AlreadyRunning(service_id));
        }
        if spec.tick_interval.is_some_and(|period| period.is_zero()) {
            return Err(ServiceError::InitializationFailed(format!(
                "{service_id}: tick interval must be non-zero"
            )));
        }

        let (command_tx, command_rx) = mpsc::channel(256);
        let state = Arc::new(AtomicU8::new(ServiceState::Starting as u8));
        let handle = ServiceHandle::new(service_id.clone(), command_tx, Arc::clone(&state));
        let ctx = ServiceContext::new(service_id.clone());

        let channels = ServiceChannels {
            commands: command_rx,
            shutdown: self.shutdown_tx.subscribe(),
            events: self.event_tx.subscribe(),
        };
        let loop_spec = spec.clone();
        let join_handle = tokio::spawn(async move {
            run_service_loop(service, ctx, channels, state, loop_spec).await
        });

        self.services.insert(
            service_id,
            RunningService {
                handle: handle.clone(),
                join_handle,
                spec,
            },
        );

        Ok(handle)
    }

    /// Stop a specific service and wait for it to finish
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let running = self
            .services
            .remove(service_id)
            .map(|(_, v)| v)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        let _ = running.handle.shutdown().await;

        // on_stop already has its own bound; allow a little slack on top for the task to unwind
        let timeout = running.spec.shutdown_timeout + Duration::from_secs(1);
        match tokio::time::timeout(timeout, running.join_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(service_id, error = ?e, "Service task panicked");
                Err(ServiceError::ChannelClosed)
            }
            Err(_) => {
                tracing::warn!(service_id, "Service shutdown timed out");
                Err(ServiceError::ShutdownTimeout)
            }
        }
    }

    /// Signal every service to stop and wait until all have reached a terminal state
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(services = self.services.len(), "Initiating shutdown of all services");

        let _ = self.shutdown_tx.send(());

        let timeout = self
            .services
            .iter()
            .map(|entry| entry.value().spec.shutdown_timeout)
            .max()
            .unwrap_or(self.default_shutdown_timeout);

        let result = tokio::time::timeout(timeout + Duration::from_secs(1), async {
            while !self.services.is_empty() {
                self.services.retain(|_, v| !v.handle.is_terminal());
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        if result.is_err() {
            tracing::warn!("Some services did not stop within timeout");
            return Err(ServiceError::ShutdownTimeout);
        }

        Ok(())
    }

    /// List all services with their current state
    pub fn list(&self) -> Vec<(String, ServiceState)> {
        let mut services: Vec<_> = self
            .services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().handle.state()))
            .collect();
        services.sort_by(|a, b| a.0.cmp(&b.0));
        services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Task Loop
// ─────────────────────────────────────────────────────────────────────────────

struct ServiceChannels {
    commands: mpsc::Receiver<ServiceCommand>,
    shutdown: broadcast::Receiver<()>,
    events: broadcast::Receiver<Event>,
}

async fn run_service_loop<S: Service>(
    mut service: S,
    ctx: ServiceContext,
    mut channels: ServiceChannels,
    state: Arc<AtomicU8>,
    spec: ServiceSpec,
) -> ServiceResult<()> {
    if let Err(e) = service.on_start(&ctx).await {
        tracing::error!(service_id = %ctx.service_id, error = %e, "Service failed to start");
        state.store(ServiceState::Failed as u8, Ordering::SeqCst);
        return Err(e);
    }

    state.store(ServiceState::Running as u8, Ordering::SeqCst);
    tracing::info!(
        service_id = %ctx.service_id,
        description = spec.description.as_deref().unwrap_or(""),
        "Service started"
    );

    // A tick that comes due while a hook is still running is dropped, not replayed
    let mut tick_timer = spec.tick_interval.map(|period| {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    });

    loop {
        tokio::select! {
            _ = channels.shutdown.recv() => {
                tracing::debug!(service_id = %ctx.service_id, "Received global shutdown signal");
                break;
            }

            Some(cmd) = channels.commands.recv() => {
                match cmd {
                    ServiceCommand::Shutdown => {
                        tracing::debug!(service_id = %ctx.service_id, "Received shutdown command");
                        break;
                    }
                }
            }

            received = channels.events.recv() => {
                match received {
                    Ok(event) => {
                        if spec.subscriptions.iter().any(|p| event.matches(p)) {
                            if let Err(e) = service.on_event(&ctx, event).await {
                                tracing::warn!(service_id = %ctx.service_id, error = %e, "Error handling broadcast event");
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(service_id = %ctx.service_id, missed, "Event subscriber lagged");
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!(service_id = %ctx.service_id, "Event bus closed");
                        break;
                    }
                }
            }

            _ = async {
                match tick_timer.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending::<tokio::time::Instant>().await,
                }
            } => {
                if let Err(e) = service.on_tick(&ctx).await {
                    tracing::warn!(service_id = %ctx.service_id, error = %e, "Error during tick");
                }
            }
        }
    }

    state.store(ServiceState::Stopping as u8, Ordering::SeqCst);
    tracing::debug!(service_id = %ctx.service_id, "Service stopping");

    match tokio::time::timeout(spec.shutdown_timeout, service.on_stop(&ctx)).await {
        Ok(Ok(())) => {
            state.store(ServiceState::Stopped as u8, Ordering::SeqCst);
            tracing::info!(service_id = %ctx.service_id, "Service stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            state.store(ServiceState::Failed as u8, Ordering::SeqCst);
            tracing::error!(service_id = %ctx.service_id, error = %e, "Service stop failed");
            Err(e)
        }
        Err(_) => {
            state.store(ServiceState::Failed as u8, Ordering::SeqCst);
            tracing::error!(service_id = %ctx.service_id, "Service stop timed out");
            Err(ServiceError::ShutdownTimeout)
        }
    }
}
