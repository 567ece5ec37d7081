use crate::domain::error::TetherResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Transport carrying one session's traffic.
///
/// Framing and decoding live behind this trait; the session only needs to
/// tear it down and to know whether it is one-shot.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Stateless transports create a fresh session per request
    fn is_stateless(&self) -> bool {
        false
    }

    /// Close the transport, letting in-flight reads complete
    async fn dispose(&self) -> TetherResult<()>;
}

/// Compute/server handle driven by a session
#[async_trait]
pub trait SessionServer: Send + Sync {
    /// Run until `cancel` fires or the peer goes away
    async fn run(&self, cancel: CancellationToken) -> TetherResult<()>;

    /// Release server resources; called exactly once during disposal
    async fn dispose(&self) -> TetherResult<()>;
}

/// Handles backing one live session
#[derive(Clone)]
pub struct SessionResources {
    pub transport: Arc<dyn SessionTransport>,
    pub server: Arc<dyn SessionServer>,
}

impl SessionResources {
    pub fn new(transport: Arc<dyn SessionTransport>, server: Arc<dyn SessionServer>) -> Self {
        Self { transport, server }
    }
}

/// Creates transport and server handles when the registry materialises a session
pub trait ResourceFactory: Send + Sync {
    fn create(&self, session_id: &str) -> TetherResult<SessionResources>;
}

/// Transport with nothing to tear down
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport {
    stateless: bool,
}

impl NullTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stateless() -> Self {
        Self { stateless: true }
    }
}

#[async_trait]
impl SessionTransport for NullTransport {
    fn is_stateless(&self) -> bool {
        self.stateless
    }

    async fn dispose(&self) -> TetherResult<()> {
        Ok(())
    }
}

/// Server that parks until cancelled
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleServer;

#[async_trait]
impl SessionServer for IdleServer {
    async fn run(&self, cancel: CancellationToken) -> TetherResult<()> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn dispose(&self) -> TetherResult<()> {
        Ok(())
    }
}

/// Factory producing `NullTransport` + `IdleServer` pairs
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResourceFactory {
    stateless: bool,
}

impl NullResourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stateless() -> Self {
        Self { stateless: true }
    }
}

impl ResourceFactory for NullResourceFactory {
    fn create(&self, _session_id: &str) -> TetherResult<SessionResources> {
        let transport = if self.stateless {
            NullTransport::stateless()
        } else {
            NullTransport::new()
        };
        Ok(SessionResources::new(Arc::new(transport), Arc::new(IdleServer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_server_stops_on_cancel() {
        let token = CancellationToken::new();
        let server = IdleServer;
        let child = token.clone();
        let handle = tokio::spawn(async move { server.run(child).await });

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[test]
    fn test_null_factory_stateless_flag() {
        let resources = NullResourceFactory::stateless().create("s1").unwrap();
        assert!(resources.transport.is_stateless());

        let resources = NullResourceFactory::new().create("s1").unwrap();
        assert!(!resources.transport.is_stateless());
    }
}
