//! Hooks observing a single transfer

use crate::error::Result;
use crate::http::ResponseHeader;
use async_trait::async_trait;
use tokio::io::AsyncWrite;

/// Observer for one resource transfer
///
/// Callbacks arrive strictly in order: `on_response_header`, then
/// `on_transfer_begin`, then any number of `on_transferring`, then exactly one
/// `on_transfer_end`. A transfer that fails before its body is sent still
/// ends with `on_transfer_end(false)`.
#[async_trait]
pub trait TransferListener: Send + Sync {
    /// The response head is about to be sent and may still be rewritten
    async fn on_response_header(&mut self, _response: &mut ResponseHeader) {}

    /// The body is about to be relayed; bytes written here precede it
    ///
    /// An error aborts the transfer, since the client may already have
    /// received part of the body.
    async fn on_transfer_begin(
        &mut self,
        _client: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        Ok(())
    }

    /// A chunk was read from the source and is about to reach the client
    async fn on_transferring(&mut self, _chunk: &[u8]) {}

    /// `completed` is true when the whole declared body was relayed
    async fn on_transfer_end(&mut self, _completed: bool) {}
}
