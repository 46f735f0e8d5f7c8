//! MQTT ingress/egress (§4.6). The subscriber side drives `rumqttc`'s event loop on its own
//! task and turns `Publish` packets into `IngressEvent`s; the publish side is a thin wrapper
//! that classifies `rumqttc::ClientError` into `DeliveryOutcome`.

use async_trait::async_trait;
use bridge_buffer::Buffer;
use bridge_core::{
    BridgeError, DeliveryOutcome, IngressAdapter, IngressEvent, MappingTable, Message, NewMessage,
    TransformRegistry,
};
use rumqttc::{AsyncClient, Event, Packet, QoS};
use std::sync::Arc;

#[derive(Clone)]
pub struct MqttEgress {
    client: AsyncClient,
}

impl MqttEgress {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl bridge_core::EgressAdapter for MqttEgress {
    async fn deliver(&self, message: &Message) -> DeliveryOutcome {
        match self
            .client
            .publish(&message.topic_or_node, QoS::AtLeastOnce, false, message.value.as_bytes())
            .await
        {
            Ok(()) => DeliveryOutcome::Ok,
            Err(err) => DeliveryOutcome::Retryable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttIngressConfig {
    pub default_ttl: chrono::Duration,
}

/// Looks up the Mapping Table for every observed publish and enqueues one message per
/// matching route. Duplicate suppression is the Buffer's job (coalescing), not ours (§4.6).
pub struct MqttIngress {
    mapping: Arc<MappingTable>,
    buffer: Arc<Buffer>,
    transforms: Arc<TransformRegistry>,
    cfg: MqttIngressConfig,
}

impl MqttIngress {
    pub fn new(
        mapping: Arc<MappingTable>,
        buffer: Arc<Buffer>,
        transforms: Arc<TransformRegistry>,
        cfg: MqttIngressConfig,
    ) -> Self {
        Self { mapping, buffer, transforms, cfg }
    }
}

#[async_trait]
impl IngressAdapter for MqttIngress {
    async fn push(&self, event: IngressEvent) -> anyhow::Result<()> {
        let routes = self.mapping.lookup_mqtt(&event.key);
        for route in routes {
            let value = match &route.transform {
                Some(name) => self.transforms.resolve(name)?.apply(&event.raw_value)?,
                None => event.raw_value.clone(),
            };
            let new_message = NewMessage {
                source: bridge_core::Source::Mqtt,
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
                    // §5 Backpressure: MQTT drops the new event with a warning rather than
                    // blocking the subscriber loop.
                    tracing::warn!(event = "mqtt_ingress.buffer_full", topic = %event.key, "dropping event, buffer full");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Drives `rumqttc`'s event loop, subscribing to `topics` and forwarding every `Publish`
/// packet to `ingress.push`. Runs until the event loop itself errors out.
pub async fn run_mqtt_ingress(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    topics: &[String],
    ingress: Arc<MqttIngress>,
) -> anyhow::Result<()> {
    for topic in topics {
        client.subscribe(topic, QoS::AtLeastOnce).await?;
    }

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let raw_value = String::from_utf8_lossy(&publish.payload).to_string();
                let event = IngressEvent { key: publish.topic, raw_value };
                if let Err(err) = ingress.push(event).await {
                    tracing::warn!(event = "mqtt_ingress.push.error", error = %err, "ingress push failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(event = "mqtt_ingress.eventloop.error", error = %err, "mqtt event loop failed");
                return Err(err.into());
            }
        }
    }
}
