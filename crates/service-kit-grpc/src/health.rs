//! Health checking.
//!
//! [`HealthRegistry`] is an in-memory map from service name to
//! [`HealthStatus`], owned by the server and handed out as a cloneable
//! handle. [`HealthService`] exposes it over the standard
//! `grpc.health.v1.Health` protocol. The empty name stands for the whole
//! process.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

/// Name of the whole-process entry.
pub const PROCESS: &str = "";

/// Serving status of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Serving,
    NotServing,
}

impl HealthStatus {
    fn to_proto(self) -> ServingStatus {
        match self {
            Self::Unknown => ServingStatus::Unknown,
            Self::Serving => ServingStatus::Serving,
            Self::NotServing => ServingStatus::NotServing,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_proto().as_str_name())
    }
}

/// Shared, lock-protected health status map.
///
/// Every entry is a watch channel, so updates are visible to `Check` calls
/// immediately and pushed to open `Watch` streams. Watching a service that was
/// never registered parks a channel in `pending` until either the owning
/// process registers the name or the last watcher goes away.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Statuses>>,
}

#[derive(Debug, Default)]
struct Statuses {
    registered: HashMap<String, watch::Sender<HealthStatus>>,
    pending: HashMap<String, watch::Sender<HealthStatus>>,
}

impl Statuses {
    fn prune_pending(&mut self) {
        self.pending.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the status of `service`.
    pub fn set_serving_status(&self, service: impl Into<String>, status: HealthStatus) {
        let service = service.into();
        tracing::debug!(service = %service, %status, "health status changed");

        let mut statuses = self.inner.write();
        if let Some(sender) = statuses.registered.get(&service) {
            sender.send_replace(status);
            return;
        }

        let sender = match statuses.pending.remove(&service) {
            Some(sender) => {
                sender.send_replace(status);
                sender
            }
            None => watch::Sender::new(status),
        };
        statuses.registered.insert(service, sender);
        statuses.prune_pending();
    }

    /// Current status of `service`, `Unknown` if it was never registered.
    pub fn status(&self, service: &str) -> HealthStatus {
        self.inner
            .read()
            .registered
            .get(service)
            .map(|sender| *sender.borrow())
            .unwrap_or_default()
    }

    /// Receiver for `service`. Unregistered services start out `Unknown`
    /// and stay unregistered until [`set_serving_status`] names them.
    ///
    /// [`set_serving_status`]: Self::set_serving_status
    pub fn subscribe(&self, service: &str) -> watch::Receiver<HealthStatus> {
        if let Some(sender) = self.inner.read().registered.get(service) {
            return sender.subscribe();
        }

        let mut statuses = self.inner.write();
        if let Some(sender) = statuses.registered.get(service) {
            return sender.subscribe();
        }
        statuses.prune_pending();
        statuses
            .pending
            .entry(service.to_string())
            .or_insert_with(|| watch::Sender::new(HealthStatus::Unknown))
            .subscribe()
    }

    /// Drop the parked channel of `service` once nobody watches it.
    fn release(&self, service: &str) {
        let mut statuses = self.inner.write();
        if statuses
            .pending
            .get(service)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            statuses.pending.remove(service);
        }
    }

    /// `grpc.health.v1.Health` server backed by this registry.
    pub fn service(&self) -> HealthServer<HealthService> {
        HealthServer::new(HealthService::new(self.clone()))
    }

    #[cfg(test)]
    fn channels(&self) -> usize {
        let statuses = self.inner.read();
        statuses.registered.len() + statuses.pending.len()
    }
}

/// Updates for one `Watch` call.
///
/// `updates` is declared first so its receiver is gone by the time
/// `_release` runs.
struct WatchUpdates {
    updates: Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send>>,
    _release: Release,
}

impl Stream for WatchUpdates {
    type Item = Result<HealthCheckResponse, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.as_mut().poll_next(cx)
    }
}

struct Release {
    registry: HealthRegistry,
    service: String,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.registry.release(&self.service);
    }
}

/// `grpc.health.v1.Health` implementation reading a [`HealthRegistry`].
#[derive(Debug, Clone)]
pub struct HealthService {
    registry: HealthRegistry,
}

impl HealthService {
    pub fn new(registry: HealthRegistry) -> Self {
        Self { registry }
    }
}

fn response(status: HealthStatus) -> HealthCheckResponse {
    HealthCheckResponse {
        status: status.to_proto() as i32,
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        Ok(Response::new(response(self.registry.status(&service))))
    }

    type WatchStream = Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send>>;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let service = request.into_inner().service;
        let updates = WatchStream::new(self.registry.subscribe(&service))
            .map(|status| Ok(response(status)));
        Ok(Response::new(Box::pin(WatchUpdates {
            updates: Box::pin(updates),
            _release: Release {
                registry: self.registry.clone(),
                service,
            },
        })))
    }
}
