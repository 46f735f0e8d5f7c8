//! Named transform strategies (§9 "Dynamic transform references").
//!
//! The source permits string-named callables for payload transformation; here that becomes
//! a registry of statically-known strategies resolved once at configuration load. An unknown
//! name is a `ConfigurationError`, not a runtime failure.

use crate::error::BridgeError;
use std::collections::HashMap;
use std::fmt;

pub trait TransformStrategy: Send + Sync {
    fn apply(&self, value: &str) -> Result<String, BridgeError>;
}

struct Identity;
impl TransformStrategy for Identity {
    fn apply(&self, value: &str) -> Result<String, BridgeError> {
        Ok(value.to_string())
    }
}

struct Uppercase;
impl TransformStrategy for Uppercase {
    fn apply(&self, value: &str) -> Result<String, BridgeError> {
        Ok(value.to_ascii_uppercase())
    }
}

struct Lowercase;
impl TransformStrategy for Lowercase {
    fn apply(&self, value: &str) -> Result<String, BridgeError> {
        Ok(value.to_ascii_lowercase())
    }
}

struct TrimWhitespace;
impl TransformStrategy for TrimWhitespace {
    fn apply(&self, value: &str) -> Result<String, BridgeError> {
        Ok(value.trim().to_string())
    }
}

pub struct TransformRegistry {
    strategies: HashMap<&'static str, Box<dyn TransformStrategy>>,
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("names", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut strategies: HashMap<&'static str, Box<dyn TransformStrategy>> = HashMap::new();
        strategies.insert("identity", Box::new(Identity));
        strategies.insert("uppercase", Box::new(Uppercase));
        strategies.insert("lowercase", Box::new(Lowercase));
        strategies.insert("trim", Box::new(TrimWhitespace));
        Self { strategies }
    }
}

impl TransformRegistry {
    /// Resolve a transform name at configuration load time.
    pub fn resolve(&self, name: &str) -> Result<&dyn TransformStrategy, BridgeError> {
        self.strategies
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| BridgeError::Configuration(format!("unknown transform: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_names() {
        let registry = TransformRegistry::default();
        let t = registry.resolve("uppercase").unwrap();
        assert_eq!(t.apply("abc").unwrap(), "ABC");
    }

    #[test]
    fn rejects_unknown_name() {
        let registry = TransformRegistry::default();
        assert!(registry.resolve("reverse_polarity").is_err());
    }
}
