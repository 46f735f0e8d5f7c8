//! Wire types for a message as it moves through the buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Mqtt,
    Opcua,
    Sap,
    Internal,
}

/// Where a message is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Mqtt,
    Opcua,
    Sap,
}

/// Declared wire type of a message's value (§6.2 canonical form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DataType {
    Boolean,
    Int32,
    Float,
    Double,
    String,
    DateTime,
    Json,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Boolean => "Boolean",
            Self::Int32 => "Int32",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::String => "String",
            Self::DateTime => "DateTime",
            Self::Json => "JSON",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Boolean" => Ok(Self::Boolean),
            "Int32" => Ok(Self::Int32),
            "Float" => Ok(Self::Float),
            "Double" => Ok(Self::Double),
            "String" => Ok(Self::String),
            "DateTime" => Ok(Self::DateTime),
            "JSON" | "Json" => Ok(Self::Json),
            other => Err(format!("unknown data_type: {other}")),
        }
    }
}

/// Lifecycle status of a message (§3.1, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl Status {
    /// `completed`, `failed`, and `expired` accept no further transitions (§3.4, §4.7).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Dispatch priority; lower is more urgent (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// A durable message as stored by the buffer (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub source: Source,
    pub destination: Destination,
    pub topic_or_node: String,
    pub value: String,
    pub data_type: DataType,
    pub status: Status,
    pub priority: Priority,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub expire_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A new message handed to the buffer before an id is assigned (§4.1 `insert`).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub source: Source,
    pub destination: Destination,
    pub topic_or_node: String,
    pub value: String,
    pub data_type: DataType,
    pub priority: Priority,
    pub max_retries: i32,
    pub ttl: chrono::Duration,
    pub coalesce: bool,
}

/// Append-only failed/expired archive row (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub id: i64,
    pub original_id: i64,
    pub source: Source,
    pub destination: Destination,
    pub topic_or_node: String,
    pub value: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: i32,
}

/// A single metric-snapshot row (§3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub metric_value: f64,
}

/// The closed set of metric names the Janitor may snapshot (§3.3).
pub const METRIC_NAMES: &[&str] = &[
    "enqueued",
    "completed",
    "failed",
    "expired",
    "retried",
    "pending_current",
    "processing_current",
    "throughput_per_minute",
];
