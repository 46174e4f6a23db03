use std::future::Future;

use chatsdk_core::{Connection, SessionError};
use tokio::sync::watch;
use tracing::debug;

/// HTTP submission layer. Only its success/failure shape matters here.
pub trait RequestSubmitter: Send + Sync {
    type Request: Send;
    type Response: Send;

    fn submit(
        &self,
        request: Self::Request,
    ) -> impl Future<Output = Result<Self::Response, SessionError>> + Send;
}

/// Refuses to submit anything unless the session is `Connected`.
pub struct GuardedSubmitter<S> {
    inner: S,
    connection: watch::Receiver<Connection>,
}

impl<S: RequestSubmitter> GuardedSubmitter<S> {
    pub fn new(inner: S, connection: watch::Receiver<Connection>) -> Self {
        Self { inner, connection }
    }

    /// Submit `request`, failing with `not_connected` while offline.
    ///
    /// Only this call waits on the request; the session keeps running.
    pub async fn submit(
        &self,
        action: &str,
        request: S::Request,
    ) -> Result<S::Response, SessionError> {
        let connected = self.connection.borrow().is_connected();
        if !connected {
            debug!(action, "refusing request while not connected");
            return Err(SessionError::not_connected(action));
        }
        self.inner.submit(request).await
    }
}
