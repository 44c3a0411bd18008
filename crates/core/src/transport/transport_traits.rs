use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport_model::{PushEvent, PushFrame};
use crate::config::ChannelIdentity;
use crate::errors::Result;

/// Buffered frames per direction on a push connection.
pub const PUSH_CHANNEL_CAPACITY: usize = 256;

/// Both ends the transport keeps of an established channel. The connection
/// task owns the other ends; dropping them closes the channel.
pub struct PushConnection {
    pub outgoing: mpsc::Sender<PushFrame>,
    pub incoming: mpsc::Receiver<PushFrame>,
}

/// Opens the push channel for one identity tuple.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, identity: &ChannelIdentity) -> Result<PushConnection>;
}

/// Consumer of parsed push events. Called sequentially, in arrival order.
#[async_trait]
pub trait PushEventHandler: Send + Sync {
    async fn handle_event(&self, event: &PushEvent);
}
