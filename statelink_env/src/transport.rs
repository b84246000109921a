//! Client → backend submission channel abstraction.

use crate::error::EnvError;
use crate::types::{FieldBag, PlayerId, RequestEnvelope, ResponseEnvelope, SessionGrant};
use async_trait::async_trait;

/// Abstraction for the request/response channel between a client and the
/// authoritative backend.
///
/// # Implementations
///
/// - **In-process**: `LocalTransport` in `statelink_core`, calls the backend directly
/// - **Simulation**: `SimTransport` with injectable request/ack loss
///
/// # Round trip
///
/// ```text
/// Client                     Channel                    Backend
///   |-- submit(request) -------->|                          |
///   |                            |-- [may drop] ----------->| per-record queue
///   |                            |<------------ response ---|
///   |<------- [may drop ack] ----|                          |
/// ```
///
/// A `TransportFailure` never tells the client whether the backend applied
/// the command; retrying relies on command idempotency.
#[async_trait]
pub trait BackendTransport: Send + Sync + 'static {
    /// Opens a new backend session, retiring any earlier one.
    ///
    /// # Arguments
    /// * `player` - The connecting player
    /// * `public_key` - Verifying key that will sign this session's proofs
    async fn open_session(
        &self,
        player: PlayerId,
        public_key: [u8; 32],
    ) -> Result<SessionGrant, EnvError>;

    /// Submits one command and waits for its authoritative outcome.
    async fn submit(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, EnvError>;

    /// Fetches the authoritative record, one JSON section per key.
    async fn fetch_state(&self, player: PlayerId) -> Result<FieldBag, EnvError>;

    /// Returns the player this channel belongs to.
    fn local_player(&self) -> PlayerId;
}

/// Fault injection for simulated channels.
pub trait FaultInjector: Send + Sync {
    /// Drops the next `count` requests from `player` before delivery.
    fn drop_requests(&self, player: PlayerId, count: u32);

    /// Delivers the next `count` requests from `player` but drops the reply.
    fn drop_acks(&self, player: PlayerId, count: u32);

    /// Cuts `player` off from the backend.
    fn partition(&self, player: PlayerId);

    /// Heals all partitions.
    fn heal_all(&self);
}
