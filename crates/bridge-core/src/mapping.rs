//! Static, configuration-derived routing table (§4.5).
//!
//! Built once at startup from the YAML `mappings[]` list and never mutated afterwards —
//! concurrent ingress adapters only ever read it.

use crate::error::BridgeError;
use crate::message::{DataType, Destination, Priority};
use crate::transform::TransformRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    MqttToOpcua,
    OpcuaToMqtt,
    Bidirectional,
}

/// One routing record produced by a mapping entry (§4.5).
#[derive(Debug, Clone)]
pub struct Route {
    pub destination: Destination,
    pub target_key: String,
    pub data_type: DataType,
    pub priority: Priority,
    pub max_retries: i32,
    pub coalesce: bool,
    /// Named transform strategy (§9 "Dynamic transform references") applied to the raw
    /// ingress value before it reaches the Buffer. `None` means pass the value through as-is.
    pub transform: Option<String>,
}

/// A single YAML mapping entry, pre-expansion (§6.1 `mappings[]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingEntry {
    pub mqtt_topic: String,
    pub opcua_node_id: String,
    pub data_type: DataType,
    pub direction: Direction,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub coalesce: bool,
    #[serde(default)]
    pub transform: Option<String>,
}

fn default_priority() -> Priority {
    Priority::Normal
}

/// Is this topic filter an MQTT wildcard filter (`+` or trailing `#`)?
fn is_wildcard(topic: &str) -> bool {
    topic.split('/').any(|seg| seg == "+" || seg == "#")
}

/// How specific a wildcard pattern is: more literal leading segments, and `+` over `#`,
/// wins when more than one wildcard pattern matches the same topic (§9 "Wildcard routing").
fn specificity(pattern: &str) -> (usize, usize) {
    let segs: Vec<&str> = pattern.split('/').collect();
    let literal_prefix = segs.iter().take_while(|s| **s != "+" && **s != "#").count();
    let has_multi = segs.last().map(|s| *s == "#").unwrap_or(false);
    (literal_prefix, if has_multi { 0 } else { 1 })
}

/// Match an MQTT topic against a filter containing `+` (single level) and/or a trailing `#`
/// (multi level, only legal as the last segment).
pub fn mqtt_topic_matches(filter: &str, topic: &str) -> bool {
    let fsegs: Vec<&str> = filter.split('/').collect();
    let tsegs: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;
    while fi < fsegs.len() {
        if fsegs[fi] == "#" {
            return fi == fsegs.len() - 1;
        }
        if ti >= tsegs.len() {
            return false;
        }
        if fsegs[fi] != "+" && fsegs[fi] != tsegs[ti] {
            return false;
        }
        fi += 1;
        ti += 1;
    }
    ti == tsegs.len()
}

#[derive(Debug, Default)]
pub struct MappingTable {
    /// ingress key (mqtt topic) -> routes, exact match only.
    exact_mqtt: HashMap<String, Vec<Route>>,
    /// ingress key (opcua node id) -> routes, exact match only.
    exact_opcua: HashMap<String, Vec<Route>>,
    /// (filter, routes), any filter containing `+`/`#`, checked O(k) in specificity order.
    wildcard_mqtt: Vec<(String, Vec<Route>)>,
}

/// Checks every mapping entry's `transform` name against the registry before the bridge
/// starts moving messages, so an unknown name is a startup-time `Configuration` error rather
/// than a silent pass-through discovered later in production.
pub fn validate_transforms(entries: &[MappingEntry], registry: &TransformRegistry) -> Result<(), BridgeError> {
    for entry in entries {
        if let Some(name) = &entry.transform {
            registry.resolve(name)?;
        }
    }
    Ok(())
}

impl MappingTable {
    pub fn build(entries: &[MappingEntry]) -> Self {
        let mut table = Self::default();

        for entry in entries {
            let max_retries = entry.max_retries.unwrap_or(5);

            if matches!(entry.direction, Direction::MqttToOpcua | Direction::Bidirectional) {
                let route = Route {
                    destination: Destination::Opcua,
                    target_key: entry.opcua_node_id.clone(),
                    data_type: entry.data_type,
                    priority: entry.priority,
                    max_retries,
                    coalesce: entry.coalesce,
                    transform: entry.transform.clone(),
                };
                table.insert_mqtt_ingress(&entry.mqtt_topic, route);
            }

            if matches!(entry.direction, Direction::OpcuaToMqtt | Direction::Bidirectional) {
                let route = Route {
                    destination: Destination::Mqtt,
                    target_key: entry.mqtt_topic.clone(),
                    data_type: entry.data_type,
                    priority: entry.priority,
                    max_retries,
                    coalesce: entry.coalesce,
                    transform: entry.transform.clone(),
                };
                table
                    .exact_opcua
                    .entry(entry.opcua_node_id.clone())
                    .or_default()
                    .push(route);
            }
        }

        table
            .wildcard_mqtt
            .sort_by(|a, b| specificity(&b.0).cmp(&specificity(&a.0)));

        table
    }

    fn insert_mqtt_ingress(&mut self, topic: &str, route: Route) {
        if is_wildcard(topic) {
            if let Some(entry) = self.wildcard_mqtt.iter_mut().find(|(f, _)| f == topic) {
                entry.1.push(route);
            } else {
                self.wildcard_mqtt.push((topic.to_string(), vec![route]));
            }
        } else {
            self.exact_mqtt.entry(topic.to_string()).or_default().push(route);
        }
    }

    /// Look up routes for an MQTT ingress topic. Exact match wins outright (§9 precedence
    /// rule: exact > single-level > multi-level); otherwise the most specific matching
    /// wildcard filter's routes are returned.
    pub fn lookup_mqtt(&self, topic: &str) -> Vec<Route> {
        if let Some(routes) = self.exact_mqtt.get(topic) {
            return routes.clone();
        }

        for (filter, routes) in &self.wildcard_mqtt {
            if mqtt_topic_matches(filter, topic) {
                return routes.clone();
            }
        }

        Vec::new()
    }

    /// Look up routes for an OPC-UA ingress node id (exact match only; §4.5).
    pub fn lookup_opcua(&self, node_id: &str) -> Vec<Route> {
        self.exact_opcua.get(node_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_beats_wildcard() {
        let entries = vec![
            MappingEntry {
                mqtt_topic: "sensors/+/temp".to_string(),
                opcua_node_id: "ns=2;s=Wild".to_string(),
                data_type: DataType::Float,
                direction: Direction::MqttToOpcua,
                priority: Priority::Normal,
                max_retries: None,
                coalesce: false,
                transform: None,
            },
            MappingEntry {
                mqtt_topic: "sensors/room1/temp".to_string(),
                opcua_node_id: "ns=2;s=Exact".to_string(),
                data_type: DataType::Float,
                direction: Direction::MqttToOpcua,
                priority: Priority::Normal,
                max_retries: None,
                coalesce: false,
                transform: None,
            },
        ];
        let table = MappingTable::build(&entries);
        let routes = table.lookup_mqtt("sensors/room1/temp");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target_key, "ns=2;s=Exact");
    }

    #[test]
    fn single_level_beats_multi_level() {
        let entries = vec![
            MappingEntry {
                mqtt_topic: "sensors/#".to_string(),
                opcua_node_id: "ns=2;s=Multi".to_string(),
                data_type: DataType::Float,
                direction: Direction::MqttToOpcua,
                priority: Priority::Normal,
                max_retries: None,
                coalesce: false,
                transform: None,
            },
            MappingEntry {
                mqtt_topic: "sensors/+/temp".to_string(),
                opcua_node_id: "ns=2;s=Single".to_string(),
                data_type: DataType::Float,
                direction: Direction::MqttToOpcua,
                priority: Priority::Normal,
                max_retries: None,
                coalesce: false,
                transform: None,
            },
        ];
        let table = MappingTable::build(&entries);
        let routes = table.lookup_mqtt("sensors/room1/temp");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target_key, "ns=2;s=Single");
    }

    #[test]
    fn multi_level_wildcard_matches_tail() {
        let entries = vec![MappingEntry {
            mqtt_topic: "alerts/#".to_string(),
            opcua_node_id: "ns=2;s=Alerts".to_string(),
            data_type: DataType::String,
            direction: Direction::MqttToOpcua,
            priority: Priority::High,
            max_retries: None,
            coalesce: false,
            transform: None,
        }];
        let table = MappingTable::build(&entries);
        assert_eq!(table.lookup_mqtt("alerts/critical/pump1").len(), 1);
        assert!(table.lookup_mqtt("other/critical").is_empty());
    }

    #[test]
    fn bidirectional_registers_both_directions() {
        let entries = vec![MappingEntry {
            mqtt_topic: "plc/setpoint".to_string(),
            opcua_node_id: "ns=2;s=Setpoint".to_string(),
            data_type: DataType::Double,
            direction: Direction::Bidirectional,
            priority: Priority::Normal,
            max_retries: None,
            coalesce: false,
            transform: None,
        }];
        let table = MappingTable::build(&entries);
        assert_eq!(table.lookup_mqtt("plc/setpoint")[0].destination, Destination::Opcua);
        assert_eq!(
            table.lookup_opcua("ns=2;s=Setpoint")[0].destination,
            Destination::Mqtt
        );
    }

    #[test]
    fn validate_transforms_rejects_unknown_name() {
        let entries = vec![MappingEntry {
            mqtt_topic: "plc/setpoint".to_string(),
            opcua_node_id: "ns=2;s=Setpoint".to_string(),
            data_type: DataType::Double,
            direction: Direction::Bidirectional,
            priority: Priority::Normal,
            max_retries: None,
            coalesce: false,
            transform: Some("reverse_polarity".to_string()),
        }];
        let registry = crate::transform::TransformRegistry::default();
        assert!(validate_transforms(&entries, &registry).is_err());
    }

    #[test]
    fn validate_transforms_accepts_known_name() {
        let entries = vec![MappingEntry {
            mqtt_topic: "plc/setpoint".to_string(),
            opcua_node_id: "ns=2;s=Setpoint".to_string(),
            data_type: DataType::Double,
            direction: Direction::Bidirectional,
            priority: Priority::Normal,
            max_retries: None,
            coalesce: false,
            transform: Some("uppercase".to_string()),
        }];
        let registry = crate::transform::TransformRegistry::default();
        assert!(validate_transforms(&entries, &registry).is_ok());
    }
}
