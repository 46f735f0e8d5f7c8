//! §6.2 data-type canonical form: validates and normalizes a raw payload string against its
//! declared `data_type`. Coercion failures are always `Permanent` (§6.2, §7).

use crate::error::BridgeError;
use crate::message::DataType;

/// Validate `raw` against `data_type` and return its canonical wire form.
pub fn canonicalize(data_type: DataType, raw: &str) -> Result<String, BridgeError> {
    match data_type {
        DataType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok("true".to_string()),
            "false" => Ok("false".to_string()),
            _ => Err(coerce_err(data_type, raw)),
        },
        DataType::Int32 => raw
            .trim()
            .parse::<i32>()
            .map(|v| v.to_string())
            .map_err(|_| coerce_err(data_type, raw)),
        DataType::Float => {
            let v: f32 = raw.trim().parse().map_err(|_| coerce_err(data_type, raw))?;
            if !v.is_finite() {
                return Err(coerce_err(data_type, raw));
            }
            Ok(format_float(v as f64))
        }
        DataType::Double => {
            let v: f64 = raw.trim().parse().map_err(|_| coerce_err(data_type, raw))?;
            if !v.is_finite() {
                return Err(coerce_err(data_type, raw));
            }
            Ok(format_float(v))
        }
        DataType::String => Ok(raw.to_string()),
        DataType::DateTime => chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.to_rfc3339())
            .map_err(|_| coerce_err(data_type, raw)),
        DataType::Json => serde_json::from_str::<serde_json::Value>(raw)
            .map(|v| v.to_string())
            .map_err(|_| coerce_err(data_type, raw)),
    }
}

fn format_float(v: f64) -> String {
    if v == v.trunc() {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

fn coerce_err(data_type: DataType, raw: &str) -> BridgeError {
    BridgeError::TypeCoercion(format!("could not coerce {raw:?} to {data_type}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_case_insensitive() {
        assert_eq!(canonicalize(DataType::Boolean, "TRUE").unwrap(), "true");
        assert_eq!(canonicalize(DataType::Boolean, "False").unwrap(), "false");
        assert!(canonicalize(DataType::Boolean, "maybe").is_err());
    }

    #[test]
    fn int32_range() {
        assert_eq!(canonicalize(DataType::Int32, "42").unwrap(), "42");
        assert!(canonicalize(DataType::Int32, "2147483648").is_err());
        assert!(canonicalize(DataType::Int32, "3.5").is_err());
    }

    #[test]
    fn float_rejects_nan_and_inf() {
        assert!(canonicalize(DataType::Float, "NaN").is_err());
        assert!(canonicalize(DataType::Float, "inf").is_err());
        assert!(canonicalize(DataType::Float, "22.5").is_ok());
    }

    #[test]
    fn float_rejects_non_numeric() {
        assert!(canonicalize(DataType::Float, "abc").is_err());
    }

    #[test]
    fn datetime_requires_timezone() {
        assert!(canonicalize(DataType::DateTime, "2024-01-01T00:00:00Z").is_ok());
        assert!(canonicalize(DataType::DateTime, "2024-01-01 00:00:00").is_err());
    }

    #[test]
    fn json_round_trips() {
        let canon = canonicalize(DataType::Json, r#"{"a": 1}"#).unwrap();
        assert_eq!(canon, r#"{"a":1}"#);
        assert!(canonicalize(DataType::Json, "{not json").is_err());
    }
}
