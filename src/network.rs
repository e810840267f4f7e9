//! The transport seam.
//!
//! The engine treats the network as an opaque message sink: the
//! group-commit loop pushes outbound messages through [`Transporter::send`]
//! and the embedding delivers inbound ones via
//! [`Raft::handle_message`](crate::Raft::handle_message). Send failures
//! mark the peer disconnected and feed the group-state machinery; they
//! never propagate upward.

use anyerror::AnyError;
use async_trait::async_trait;

use crate::message::Message;

#[async_trait]
pub trait Transporter: Send + Sync + 'static {
    /// Deliver one message to `message.to`.
    async fn send(&self, message: Message) -> Result<(), AnyError>;

    /// Release connections on shutdown.
    fn close(&self) {}
}
