//! Simulated client → backend channel with fault injection.

use crate::context::SimContext;
use async_trait::async_trait;
use serde::Serialize;
use statelink_core::Backend;
use statelink_env::{
    BackendTransport, Channel, EnvError, FaultInjector, FieldBag, PlayerId, RequestEnvelope,
    ResponseEnvelope, SessionGrant, StatelinkContext,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Traffic counters for the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped_requests: u64,
    pub dropped_acks: u64,
    pub unreachable: u64,
}

/// Network controller for fault injection.
#[derive(Default)]
pub struct SimNetworkController {
    /// Requests still to be dropped before delivery, per player
    request_drops: Mutex<HashMap<PlayerId, u32>>,

    /// Replies still to be dropped after delivery, per player
    ack_drops: Mutex<HashMap<PlayerId, u32>>,

    /// Players cut off from the backend
    partitioned: Mutex<HashSet<PlayerId>>,

    /// Per-player one-way latency in milliseconds
    latency_ms: Mutex<HashMap<PlayerId, u64>>,

    sent: AtomicU64,
    delivered: AtomicU64,
    dropped_requests: AtomicU64,
    dropped_acks: AtomicU64,
    unreachable: AtomicU64,
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Sets latency for a player's link.
    pub fn set_latency(&self, player: PlayerId, latency_ms: u64) {
        relock(&self.latency_ms).insert(player, latency_ms);
    }

    /// Gets the latency for a link (default 0).
    pub fn latency(&self, player: PlayerId) -> Duration {
        Duration::from_millis(relock(&self.latency_ms).get(&player).copied().unwrap_or(0))
    }

    /// Checks whether a player can reach the backend.
    pub fn can_communicate(&self, player: PlayerId) -> bool {
        !relock(&self.partitioned).contains(&player)
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_requests: self.dropped_requests.load(Ordering::Relaxed),
            dropped_acks: self.dropped_acks.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
        }
    }

    fn take(budget: &Mutex<HashMap<PlayerId, u32>>, player: PlayerId) -> bool {
        let mut budget = relock(budget);
        match budget.get_mut(&player) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl FaultInjector for SimNetworkController {
    fn drop_requests(&self, player: PlayerId, count: u32) {
        *relock(&self.request_drops).entry(player).or_insert(0) += count;
    }

    fn drop_acks(&self, player: PlayerId, count: u32) {
        *relock(&self.ack_drops).entry(player).or_insert(0) += count;
    }

    fn partition(&self, player: PlayerId) {
        relock(&self.partitioned).insert(player);
    }

    fn heal_all(&self) {
        relock(&self.partitioned).clear();
    }
}

/// One player's channel into the simulated backend.
pub struct SimTransport {
    ctx: Arc<SimContext>,
    backend: Arc<Backend<SimContext>>,
    controller: Arc<SimNetworkController>,
    player: PlayerId,
}

impl SimTransport {
    pub fn new(
        ctx: Arc<SimContext>,
        backend: Arc<Backend<SimContext>>,
        controller: Arc<SimNetworkController>,
        player: PlayerId,
    ) -> Self {
        Self {
            ctx,
            backend,
            controller,
            player,
        }
    }

    fn reachable(&self) -> Result<(), EnvError> {
        if self.controller.can_communicate(self.player) {
            Ok(())
        } else {
            self.controller.unreachable.fetch_add(1, Ordering::Relaxed);
            Err(EnvError::unreachable(self.player))
        }
    }
}

#[async_trait]
impl BackendTransport for SimTransport {
    async fn open_session(&self, player: PlayerId, public_key: [u8; 32]) -> Result<SessionGrant, EnvError> {
        self.reachable()?;
        self.backend
            .open_session(player, Some(public_key))
            .await
            .map_err(|e| EnvError::transport(format!("open_session: {}", e)))
    }

    async fn submit(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, EnvError> {
        let c = &self.controller;
        c.sent.fetch_add(1, Ordering::Relaxed);
        self.reachable()?;

        let latency = c.latency(self.player);
        if !latency.is_zero() {
            self.ctx.sleep(latency).await;
        }

        if SimNetworkController::take(&c.request_drops, self.player) {
            c.dropped_requests.fetch_add(1, Ordering::Relaxed);
            debug!(player = %self.player, command = %request.command, "request dropped");
            return Err(EnvError::transport("request dropped"));
        }

        let response = self.backend.respond(Channel::Player, request).await;
        c.delivered.fetch_add(1, Ordering::Relaxed);

        if SimNetworkController::take(&c.ack_drops, self.player) {
            c.dropped_acks.fetch_add(1, Ordering::Relaxed);
            debug!(player = %self.player, command = %response.command, "ack dropped");
            return Err(EnvError::AckLost(response.command));
        }
        Ok(response)
    }

    async fn fetch_state(&self, player: PlayerId) -> Result<FieldBag, EnvError> {
        self.reachable()?;
        self.backend
            .fetch_state(player)
            .map_err(|e| EnvError::transport(format!("fetch_state: {}", e)))
    }

    fn local_player(&self) -> PlayerId {
        self.player
    }
}
