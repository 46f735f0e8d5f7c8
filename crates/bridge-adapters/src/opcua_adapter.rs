//! OPC-UA ingress/egress (§4.6). The `opcua` client crate's `Session` is synchronous and
//! drives its own background thread for subscription callbacks, so both sides of this adapter
//! bridge into async code the same way: blocking calls go through `spawn_blocking`, and the
//! subscription callback forwards onto an unbounded channel a task drains.

use async_trait::async_trait;
use bridge_buffer::Buffer;
use bridge_core::{
    BridgeError, DeliveryOutcome, IngressAdapter, IngressEvent, MappingTable, Message, NewMessage,
    TransformRegistry,
};
use opcua::client::prelude::*;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct OpcuaEgress {
    session: Arc<RwLock<Session>>,
}

impl OpcuaEgress {
    pub fn new(session: Arc<RwLock<Session>>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl bridge_core::EgressAdapter for OpcuaEgress {
    async fn deliver(&self, message: &Message) -> DeliveryOutcome {
        let session = Arc::clone(&self.session);
        let node_id = message.topic_or_node.clone();
        let value = message.value.clone();

        let result = tokio::task::spawn_blocking(move || {
            let node = NodeId::from_str(&node_id).map_err(|_| format!("invalid node id: {node_id}"))?;
            let write_value = WriteValue {
                node_id: node,
                attribute_id: AttributeId::Value as u32,
                index_range: UAString::null(),
                value: DataValue::new_now(Variant::from(value)),
            };
            let session = session.read().map_err(|_| "session lock poisoned".to_string())?;
            session
                .write(&[write_value])
                .map_err(|status| format!("opc-ua write failed: {status}"))
        })
        .await;

        match result {
            Ok(Ok(statuses)) if statuses.iter().all(|s| s.is_good()) => DeliveryOutcome::Ok,
            Ok(Ok(statuses)) => DeliveryOutcome::Retryable(format!("opc-ua write status: {statuses:?}")),
            Ok(Err(msg)) => DeliveryOutcome::Retryable(msg),
            Err(join_err) => DeliveryOutcome::Retryable(format!("opc-ua write task panicked: {join_err}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpcuaIngressConfig {
    pub default_ttl: chrono::Duration,
}

pub struct OpcuaIngress {
    mapping: Arc<MappingTable>,
    buffer: Arc<Buffer>,
    transforms: Arc<TransformRegistry>,
    cfg: OpcuaIngressConfig,
}

impl OpcuaIngress {
    pub fn new(
        mapping: Arc<MappingTable>,
        buffer: Arc<Buffer>,
        transforms: Arc<TransformRegistry>,
        cfg: OpcuaIngressConfig,
    ) -> Self {
        Self { mapping, buffer, transforms, cfg }
    }
}

#[async_trait]
impl IngressAdapter for OpcuaIngress {
    async fn push(&self, event: IngressEvent) -> anyhow::Result<()> {
        let routes = self.mapping.lookup_opcua(&event.key);
        for route in routes {
            let value = match &route.transform {
                Some(name) => self.transforms.resolve(name)?.apply(&event.raw_value)?,
                None => event.raw_value.clone(),
            };
            let new_message = NewMessage {
                source: bridge_core::Source::Opcua,
                destination: route.destination,
                topic_or_node: route.target_key,
                value,
                data_type: route.data_type,
                priority: route.priority,
                max_retries: route.max_retries,
                ttl: self.cfg.default_ttl,
                coalesce: route.coalesce,
            };

            match self.buffer.enqueue(new_message).await {
                Ok(_) => {}
                Err(BridgeError::BufferFull) => {
                    // §5 Backpressure: OPC-UA change notifications favor the newest reading,
                    // so a full buffer drops this notification rather than retrying it.
                    tracing::warn!(event = "opcua_ingress.buffer_full", node_id = %event.key, "dropping change notification, buffer full");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Subscribes to `node_ids` for data-change notifications and forwards every change onto
/// `ingress.push`. The `opcua` client invokes the data-change callback from its own
/// subscription thread, so the callback only does a non-blocking channel send; the actual
/// Mapping Table lookup and enqueue happen on the task spawned here.
pub fn run_opcua_ingress(
    session: Arc<RwLock<Session>>,
    node_ids: Vec<String>,
    ingress: Arc<OpcuaIngress>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<IngressEvent>();

    {
        let mut session = session.write().map_err(|_| anyhow::anyhow!("session lock poisoned"))?;
        let subscription_id = session
            .create_subscription(
                500.0,
                10,
                30,
                0,
                0,
                true,
                DataChangeCallback::new(move |items| {
                    for item in items {
                        let Some(value) = item.last_value().value.as_ref() else { continue };
                        let event = IngressEvent {
                            key: item.item_to_monitor().node_id.to_string(),
                            raw_value: value.to_string(),
                        };
                        let _ = tx.send(event);
                    }
                }),
            )
            .map_err(|status| anyhow::anyhow!("create_subscription failed: {status}"))?;

        let items_to_create: Vec<MonitoredItemCreateRequest> = node_ids
            .iter()
            .filter_map(|id| NodeId::from_str(id).ok())
            .map(|node_id| MonitoredItemCreateRequest::new(node_id.into(), MonitoringMode::Reporting, MonitoringParameters::default()))
            .collect();

        session
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, &items_to_create)
            .map_err(|status| anyhow::anyhow!("create_monitored_items failed: {status}"))?;
    }

    Ok(tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(err) = ingress.push(event).await {
                tracing::warn!(event = "opcua_ingress.push.error", error = %err, "ingress push failed");
            }
        }
    }))
}
