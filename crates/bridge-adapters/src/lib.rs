//! Concrete MQTT and OPC-UA clients (§4.6) behind the `IngressAdapter`/`EgressAdapter` traits
//! defined in `bridge-core`. Thin wrappers around `rumqttc` and `opcua`, in the spirit of the
//! teacher's `ObjectStore` wrapper around `reqwest`: adapt the external client's errors into
//! the bridge's error taxonomy and nothing more.

pub mod mqtt;
pub mod opcua_adapter;

pub use mqtt::{MqttEgress, MqttIngress, MqttIngressConfig};
pub use opcua_adapter::{OpcuaEgress, OpcuaIngress, OpcuaIngressConfig};

// An SAP adapter (§2.1) would live here as `SapEgress`/`SapIngress`, implementing the same
// `bridge_core::EgressAdapter`/`IngressAdapter` traits as `MqttEgress`/`OpcuaIngress` above and
// routed through `Destination::Sap`/`Source::Sap`, which the wire types already reserve. No
// such adapter ships in this crate; connecting to SAP is out of scope (§1 Non-goals).

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_buffer::{Buffer, BufferLimits};
    use bridge_core::{
        DataType, Direction, IngressAdapter, IngressEvent, MappingEntry, MappingTable, Priority,
        Status, TransformRegistry,
    };
    use std::sync::Arc;

    async fn test_buffer(limits: BufferLimits) -> Arc<Buffer> {
        let pools = bridge_store::open_in_memory().await.expect("open in-memory store");
        Arc::new(Buffer::new(bridge_store::Store::new(pools), limits))
    }

    fn entry(transform: Option<&str>) -> MappingEntry {
        MappingEntry {
            mqtt_topic: "sensors/room1/temp".to_string(),
            opcua_node_id: "ns=2;s=Temp".to_string(),
            data_type: DataType::String,
            direction: Direction::Bidirectional,
            priority: Priority::Normal,
            max_retries: None,
            coalesce: false,
            transform: transform.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn mqtt_ingress_applies_named_transform_before_enqueue() {
        let buffer = test_buffer(BufferLimits::default()).await;
        let mapping = Arc::new(MappingTable::build(&[entry(Some("uppercase"))]));
        let transforms = Arc::new(TransformRegistry::default());
        let ingress = MqttIngress::new(
            mapping,
            Arc::clone(&buffer),
            transforms,
            MqttIngressConfig { default_ttl: chrono::Duration::hours(1) },
        );

        ingress
            .push(IngressEvent { key: "sensors/room1/temp".to_string(), raw_value: "hot".to_string() })
            .await
            .unwrap();

        let pending = buffer.query_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value, "HOT");
    }

    #[tokio::test]
    async fn mqtt_ingress_drops_event_when_buffer_full() {
        let buffer = test_buffer(BufferLimits { max_pending: 0 }).await;
        let mapping = Arc::new(MappingTable::build(&[entry(None)]));
        let transforms = Arc::new(TransformRegistry::default());
        let ingress = MqttIngress::new(
            mapping,
            Arc::clone(&buffer),
            transforms,
            MqttIngressConfig { default_ttl: chrono::Duration::hours(1) },
        );

        ingress
            .push(IngressEvent { key: "sensors/room1/temp".to_string(), raw_value: "22.5".to_string() })
            .await
            .unwrap();

        assert_eq!(buffer.count_status(Status::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn opcua_ingress_looks_up_exact_node_id_and_enqueues() {
        let buffer = test_buffer(BufferLimits::default()).await;
        let mapping = Arc::new(MappingTable::build(&[entry(None)]));
        let transforms = Arc::new(TransformRegistry::default());
        let ingress = OpcuaIngress::new(
            mapping,
            Arc::clone(&buffer),
            transforms,
            OpcuaIngressConfig { default_ttl: chrono::Duration::hours(1) },
        );

        ingress
            .push(IngressEvent { key: "ns=2;s=Temp".to_string(), raw_value: "22.5".to_string() })
            .await
            .unwrap();

        let pending = buffer.query_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic_or_node, "sensors/room1/temp");
    }
}
