//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The transform pipeline applied to every event between publish and
// dispatch: ambient context injection, then serialization with a named
// serializer, then encryption. Unsealing runs the mirror sequence once per
// event; the decoded form is cached by the dispatcher and shared across all
// matched handlers. Transform failures are deterministic, so they dead-letter
// instead of retrying.
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::TransformError;
use crate::event::{Event, EventContext, SealedEvent};

/// Serializer plugin contract. Implementations are registered under a name;
/// publishers select one by name (default `"json"`).
pub trait Serializer: Send + Sync {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>, TransformError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Event, TransformError>;
}

/// Crypto plugin contract. A single module is registered per bus; the
/// default is the identity module.
pub trait Crypto: Send + Sync {
    fn encrypt(&self, bytes: Vec<u8>) -> Result<Vec<u8>, TransformError>;
    fn decrypt(&self, bytes: Vec<u8>) -> Result<Vec<u8>, TransformError>;
}

/// Built-in serializer backed by serde_json.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, event: &Event) -> Result<Vec<u8>, TransformError> {
        serde_json::to_vec(event).map_err(|e| TransformError::Serialize(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Event, TransformError> {
        serde_json::from_slice(bytes).map_err(|e| TransformError::Deserialize(e.to_string()))
    }
}

/// No-op crypto module used when none is registered.
pub struct IdentityCrypto;

impl Crypto for IdentityCrypto {
    fn encrypt(&self, bytes: Vec<u8>) -> Result<Vec<u8>, TransformError> {
        Ok(bytes)
    }

    fn decrypt(&self, bytes: Vec<u8>) -> Result<Vec<u8>, TransformError> {
        Ok(bytes)
    }
}

/// Name the built-in serde_json serializer registers under.
pub const JSON_SERIALIZER: &str = "json";

/// Ordered transform pipeline shared by one bus instance.
pub struct TransformChain {
    serializers: RwLock<HashMap<String, Arc<dyn Serializer>>>,
    crypto: RwLock<Arc<dyn Crypto>>,
    ambient: RwLock<EventContext>,
}

impl TransformChain {
    /// Creates a chain with the `"json"` serializer and identity crypto
    /// pre-registered.
    pub fn new(ambient: EventContext) -> Self {
        let mut serializers: HashMap<String, Arc<dyn Serializer>> = HashMap::new();
        serializers.insert(JSON_SERIALIZER.to_string(), Arc::new(JsonSerializer));

        Self {
            serializers: RwLock::new(serializers),
            crypto: RwLock::new(Arc::new(IdentityCrypto)),
            ambient: RwLock::new(ambient),
        }
    }

    /// Registers a serializer under a name, replacing any existing one.
    pub fn register_serializer(&self, name: impl Into<String>, serializer: Arc<dyn Serializer>) {
        let name = name.into();
        debug!(serializer = %name, "registered serializer");
        self.serializers.write().insert(name, serializer);
    }

    /// Replaces the crypto module.
    pub fn register_crypto(&self, crypto: Arc<dyn Crypto>) {
        *self.crypto.write() = crypto;
    }

    /// True when a serializer is registered under `name`. The bus checks
    /// this before admitting an event so an unknown name surfaces as a
    /// synchronous validation error rather than a dead-letter.
    pub fn has_serializer(&self, name: &str) -> bool {
        self.serializers.read().contains_key(name)
    }

    /// Adds an ambient context value merged into every published event.
    pub fn set_context(&self, key: impl Into<String>, value: impl Into<String>) {
        self.ambient.write().insert(key.into(), value.into());
    }

    /// Runs the forward pipeline: context injection, serialization,
    /// encryption. Explicit context keys on the event win over ambient ones.
    pub fn seal(&self, mut event: Event, serializer_name: &str) -> Result<SealedEvent, TransformError> {
        for (key, value) in self.ambient.read().iter() {
            event
                .context
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        let serializer = self
            .serializers
            .read()
            .get(serializer_name)
            .cloned()
            .ok_or_else(|| {
                TransformError::Serialize(format!("serializer '{}' not registered", serializer_name))
            })?;

        let wire = serializer.serialize(&event)?;
        let wire = self.crypto.read().clone().encrypt(wire)?;

        Ok(SealedEvent {
            event_id: event.id,
            topic: event.topic,
            serializer: serializer_name.to_string(),
            wire,
        })
    }

    /// Runs the mirror pipeline: decryption, then deserialization with the
    /// serializer recorded on the sealed event.
    pub fn unseal(&self, sealed: &SealedEvent) -> Result<Event, TransformError> {
        let plain = self.crypto.read().clone().decrypt(sealed.wire.clone())?;

        let serializer = self
            .serializers
            .read()
            .get(&sealed.serializer)
            .cloned()
            .ok_or_else(|| {
                TransformError::Deserialize(format!(
                    "serializer '{}' not registered",
                    sealed.serializer
                ))
            })?;

        serializer.deserialize(&plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain_with_ambient(pairs: &[(&str, &str)]) -> TransformChain {
        let mut ambient = EventContext::new();
        for (key, value) in pairs {
            ambient.insert(key.to_string(), value.to_string());
        }
        TransformChain::new(ambient)
    }

    #[test]
    fn test_seal_and_unseal_round_trip() {
        let chain = chain_with_ambient(&[]);
        let event = Event::new("orders.created", json!({"qty": 3}), EventContext::new());

        let sealed = chain.seal(event.clone(), JSON_SERIALIZER).unwrap();
        assert_eq!(sealed.event_id, event.id);
        assert_eq!(sealed.topic, "orders.created");

        let decoded = chain.unseal(&sealed).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_ambient_context_never_overwrites_explicit_keys() {
        let chain = chain_with_ambient(&[("tenant", "ambient"), ("region", "eu")]);

        let mut context = EventContext::new();
        context.insert("tenant".to_string(), "explicit".to_string());
        let event = Event::new("orders.created", json!(null), context);

        let sealed = chain.seal(event, JSON_SERIALIZER).unwrap();
        let decoded = chain.unseal(&sealed).unwrap();

        assert_eq!(decoded.context.get("tenant").unwrap(), "explicit");
        assert_eq!(decoded.context.get("region").unwrap(), "eu");
    }

    #[test]
    fn test_unknown_serializer_fails_seal() {
        let chain = chain_with_ambient(&[]);
        let event = Event::new("orders.created", json!(null), EventContext::new());
        assert!(chain.seal(event, "avro").is_err());
        assert!(!chain.has_serializer("avro"));
    }

    struct XorCrypto(u8);

    impl Crypto for XorCrypto {
        fn encrypt(&self, bytes: Vec<u8>) -> Result<Vec<u8>, TransformError> {
            Ok(bytes.into_iter().map(|b| b ^ self.0).collect())
        }

        fn decrypt(&self, bytes: Vec<u8>) -> Result<Vec<u8>, TransformError> {
            self.encrypt(bytes)
        }
    }

    #[test]
    fn test_custom_crypto_round_trip() {
        let chain = chain_with_ambient(&[]);
        chain.register_crypto(Arc::new(XorCrypto(0x5a)));

        let event = Event::new("orders.created", json!({"qty": 1}), EventContext::new());
        let sealed = chain.seal(event.clone(), JSON_SERIALIZER).unwrap();

        // Ciphertext must differ from the plain serialization
        let plain = serde_json::to_vec(&event).unwrap();
        assert_ne!(sealed.wire, plain);

        assert_eq!(chain.unseal(&sealed).unwrap(), event);
    }

    struct FailingSerializer;

    impl Serializer for FailingSerializer {
        fn serialize(&self, _event: &Event) -> Result<Vec<u8>, TransformError> {
            Err(TransformError::Serialize("boom".to_string()))
        }

        fn deserialize(&self, _bytes: &[u8]) -> Result<Event, TransformError> {
            Err(TransformError::Deserialize("boom".to_string()))
        }
    }

    #[test]
    fn test_serializer_failure_propagates() {
        let chain = chain_with_ambient(&[]);
        chain.register_serializer("broken", Arc::new(FailingSerializer));

        let event = Event::new("orders.created", json!(null), EventContext::new());
        assert!(matches!(
            chain.seal(event, "broken"),
            Err(TransformError::Serialize(_))
        ));
    }
}
