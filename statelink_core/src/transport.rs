//! In-process transport: a client calling a backend in the same process.

use crate::backend::Backend;
use async_trait::async_trait;
use statelink_env::{
    BackendTransport, Channel, EnvError, FieldBag, PlayerId, RequestEnvelope, ResponseEnvelope,
    SessionGrant, StatelinkContext,
};
use std::sync::Arc;

/// Player-channel transport straight into a `Backend`.
pub struct LocalTransport<Ctx: StatelinkContext> {
    backend: Arc<Backend<Ctx>>,
    player: PlayerId,
}

impl<Ctx: StatelinkContext> LocalTransport<Ctx> {
    pub fn new(backend: Arc<Backend<Ctx>>, player: PlayerId) -> Self {
        Self { backend, player }
    }

    pub fn backend(&self) -> &Arc<Backend<Ctx>> {
        &self.backend
    }
}

#[async_trait]
impl<Ctx: StatelinkContext> BackendTransport for LocalTransport<Ctx> {
    async fn open_session(&self, player: PlayerId, public_key: [u8; 32]) -> Result<SessionGrant, EnvError> {
        self.backend
            .open_session(player, Some(public_key))
            .await
            .map_err(|e| EnvError::transport(format!("open_session: {}", e)))
    }

    async fn submit(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, EnvError> {
        Ok(self.backend.respond(Channel::Player, request).await)
    }

    async fn fetch_state(&self, player: PlayerId) -> Result<FieldBag, EnvError> {
        self.backend
            .fetch_state(player)
            .map_err(|e| EnvError::transport(format!("fetch_state: {}", e)))
    }

    fn local_player(&self) -> PlayerId {
        self.player
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::standard_registry;
    use crate::trust::TokenFactory;
    use biscuit_auth::KeyPair;
    use statelink_env::{SessionId, TokioContext};

    #[tokio::test]
    async fn test_unknown_player_state_is_transport_failure() {
        let tokens = TokenFactory::new(KeyPair::new());
        let backend = Arc::new(Backend::new(TokioContext::shared(), standard_registry(), tokens.authority()));
        let transport = LocalTransport::new(backend, PlayerId::from_seed(4));

        let err = transport.fetch_state(PlayerId::from_seed(4)).await.unwrap_err();
        assert!(err.is_retryable());

        let grant = transport.open_session(PlayerId::from_seed(4), [7u8; 32]).await;
        // Not every 32-byte string is a valid curve point; both outcomes map cleanly
        if let Ok(grant) = grant {
            assert_ne!(grant.session, SessionId::from_seed(0));
            assert!(transport.fetch_state(PlayerId::from_seed(4)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_rejections_travel_as_responses() {
        let tokens = TokenFactory::new(KeyPair::new());
        let backend = Arc::new(Backend::new(TokioContext::shared(), standard_registry(), tokens.authority()));
        let transport = LocalTransport::new(backend, PlayerId::from_seed(4));

        let request = RequestEnvelope::new(PlayerId::from_seed(4), SessionId::from_seed(1), "no_such_command", FieldBag::new(), 1);
        let response = transport.submit(request).await.unwrap();
        assert_eq!(response.error_code.as_deref(), Some("unknown_command"));
    }
}
