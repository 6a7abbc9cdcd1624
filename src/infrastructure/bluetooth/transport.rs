//! Transport Collaborator Contract
//!
//! The platform BLE stack lives behind these traits. The bridge only
//! needs a notification stream, identity hints and a byte-write
//! primitive per endpoint.

use crate::domain::models::{EndpointId, IdentityHint};
use std::future::Future;
use tokio::sync::mpsc;

/// Events delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        endpoint: EndpointId,
        hint: Option<IdentityHint>,
    },
    /// Identity information arrived or changed after connect
    Identity {
        endpoint: EndpointId,
        hint: IdentityHint,
    },
    Notification {
        endpoint: EndpointId,
        payload: Vec<u8>,
    },
    /// May never fire for a vanished endpoint
    Disconnected { endpoint: EndpointId },
}

/// Fire-and-forget write of one frame to one endpoint
pub trait FrameWriter: Send + Sync {
    /// Returns false if the transport could not hand the frame off
    fn write(&self, endpoint: &EndpointId, bytes: &[u8]) -> bool;
}

/// Full capability set of a platform transport
pub trait Transport: FrameWriter + 'static {
    /// Look for controller halves
    fn scan(&self) -> impl Future<Output = anyhow::Result<Vec<EndpointId>>> + Send;

    /// Connect and subscribe to notifications for one endpoint
    fn connect(&self, endpoint: &EndpointId) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Take the event stream; called once per connection cycle
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    fn identity_hint(&self, endpoint: &EndpointId) -> Option<IdentityHint>;
}
