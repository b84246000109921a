//! Statelink Environment Abstraction Layer
//!
//! This crate provides the seams that let the Statelink backend and client
//! run both in **Production** (tokio, real clock, OS entropy) and inside the
//! deterministic **Simulation** harness (virtual clock, seeded keys).
//!
//! # What is intercepted
//!
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Key material (`derive_signing_key()`)
//! - The client → backend submission channel (`BackendTransport`)
//!
//! # Example
//!
//! ```ignore
//! use statelink_env::{BackendTransport, RequestEnvelope, StatelinkContext};
//!
//! async fn submit_with_retry<Ctx: StatelinkContext, Tx: BackendTransport>(
//!     ctx: &Ctx,
//!     tx: &Tx,
//!     request: RequestEnvelope,
//! ) {
//!     while tx.submit(request.clone()).await.is_err() {
//!         ctx.sleep(Duration::from_millis(250)).await;
//!     }
//! }
//! ```

mod context;
mod error;
mod tokio_impl;
mod transport;
mod types;

pub use context::StatelinkContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use transport::{BackendTransport, FaultInjector};
pub use types::{
    ActionId, Channel, FieldBag, MatchId, PlayerId, RequestEnvelope, ResponseEnvelope,
    ResponseStatus, SessionGrant, SessionId,
};
