//! Shared contracts for the MQTT/OPC-UA bridge: wire types, the error taxonomy, the static
//! Mapping Table, adapter traits, payload coercion, and named transform strategies.
//!
//! This crate has no I/O of its own (`publish = false`); it exists so `bridge-store`,
//! `bridge-buffer`, `bridge-dispatcher`, `bridge-adapters`, and `bridge-cli` share one
//! definition of a message and one error taxonomy.

pub mod adapter;
pub mod coerce;
pub mod error;
pub mod mapping;
pub mod message;
pub mod transform;

pub use adapter::{EgressAdapter, IngressAdapter, IngressEvent};
pub use error::{BridgeError, DeliveryOutcome};
pub use mapping::{validate_transforms, Direction, MappingEntry, MappingTable, Route};
pub use message::{
    ArchivedMessage, DataType, Destination, Message, MetricPoint, NewMessage, Priority, Source,
    Status, METRIC_NAMES,
};
pub use transform::{TransformRegistry, TransformStrategy};
