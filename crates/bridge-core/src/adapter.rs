//! Adapter contracts (§4.6). The Dispatcher and ingress paths only ever see these traits;
//! the concrete MQTT/OPC-UA/SAP clients live in `bridge-adapters`.

use crate::error::DeliveryOutcome;
use crate::message::Message;
use async_trait::async_trait;

/// An egress adapter delivers a leased message to its destination protocol.
#[async_trait]
pub trait EgressAdapter: Send + Sync {
    async fn deliver(&self, message: &Message) -> DeliveryOutcome;
}

/// One external event an ingress adapter has observed (an MQTT publish, an OPC-UA data
/// change notification) before Mapping Table lookup has happened.
#[derive(Debug, Clone)]
pub struct IngressEvent {
    pub key: String,
    pub raw_value: String,
}

/// An ingress adapter turns external events into buffer enqueues via Mapping Table lookup.
/// Duplicate suppression is the Buffer's job (coalescing), not the adapter's (§4.6).
#[async_trait]
pub trait IngressAdapter: Send + Sync {
    async fn push(&self, event: IngressEvent) -> anyhow::Result<()>;
}
