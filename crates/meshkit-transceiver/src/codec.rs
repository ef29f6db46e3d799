//! Typed message codec and per-type dispatch table.
//!
//! Every payload travels inside an [`Envelope`] tagged with a type name. A
//! tag must be registered (by `register` for inbound, implicitly by `encode`
//! for outbound) before its payload is interpreted.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use meshkit_core::message::short_type_name;
use meshkit_core::{Envelope, MeshError, Peer, Result};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A payload that can be exchanged between transceivers.
///
/// The wire tag defaults to the type's short name (`chat::Note` is sent as
/// `"Note"`), so both sides must agree on it. Override `type_tag` to pin a
/// tag that survives renames.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn type_tag() -> String {
        short_type_name(std::any::type_name::<Self>())
    }
}

type AnyPayload = Box<dyn Any + Send>;
type DecodeFn = Arc<dyn Fn(serde_json::Value) -> Result<AnyPayload> + Send + Sync>;
type EncodeFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<serde_json::Value> + Send + Sync>;
type HandlerFn = Arc<dyn Fn(AnyPayload, Peer) + Send + Sync>;

struct Registration {
    type_id: TypeId,
    type_name: &'static str,
    decoder: Option<DecodeFn>,
    encoder: Option<EncodeFn>,
    handler: Option<HandlerFn>,
}

impl Registration {
    fn empty<T: Message>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            decoder: None,
            encoder: None,
            handler: None,
        }
    }
}

/// An inbound envelope after the payload was (possibly) decoded.
pub struct DecodedEnvelope {
    pub type_tag: String,
    /// `None` when no decoder is registered for the tag.
    pub payload: Option<AnyPayload>,
}

impl DecodedEnvelope {
    /// Take the payload as a concrete type.
    pub fn into_payload<T: Message>(self) -> Option<T> {
        self.payload
            .and_then(|p| p.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }
}

impl std::fmt::Debug for DecodedEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedEnvelope")
            .field("type_tag", &self.type_tag)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Per-transceiver registry of message types.
#[derive(Default)]
pub struct DispatchTable {
    registrations: RwLock<HashMap<String, Registration>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the decoder and handler for `T`, replacing any previous handler.
    pub fn register<T, F>(&self, handler: F) -> Result<()>
    where
        T: Message,
        F: Fn(T, Peer) + Send + Sync + 'static,
    {
        let tag = T::type_tag();
        let mut registrations = self.registrations.write();
        let registration = Self::slot::<T>(&mut registrations, &tag)?;

        registration.decoder = Some(Arc::new(move |value: serde_json::Value| {
            let payload: T = serde_json::from_value(value).map_err(|e| MeshError::Decoding {
                type_tag: T::type_tag(),
                reason: e.to_string(),
            })?;
            Ok(Box::new(payload) as AnyPayload)
        }));
        registration.handler = Some(Arc::new(move |payload: AnyPayload, sender: Peer| {
            match payload.downcast::<T>() {
                Ok(payload) => handler(*payload, sender),
                Err(_) => warn!(type_tag = %T::type_tag(), "payload type mismatch, dropping message"),
            }
        }));
        debug!(type_tag = %tag, "registered message handler");
        Ok(())
    }

    /// Whether inbound payloads with this tag are decoded.
    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.registrations
            .read()
            .get(type_tag)
            .is_some_and(|r| r.decoder.is_some())
    }

    /// Encode a payload, registering `T`'s encoder first.
    pub fn encode<T: Message>(&self, payload: &T) -> Result<Vec<u8>> {
        let tag = T::type_tag();
        {
            let mut registrations = self.registrations.write();
            let registration = Self::slot::<T>(&mut registrations, &tag)?;
            if registration.encoder.is_none() {
                registration.encoder = Some(Arc::new(|any: &(dyn Any + Send + Sync)| {
                    let payload = any.downcast_ref::<T>().ok_or_else(|| MeshError::Encoding {
                        type_tag: T::type_tag(),
                        reason: format!("payload is not a {}", std::any::type_name::<T>()),
                    })?;
                    serde_json::to_value(payload).map_err(|e| MeshError::Encoding {
                        type_tag: T::type_tag(),
                        reason: e.to_string(),
                    })
                }));
            }
        }
        self.encode_envelope(&tag, payload)
    }

    /// Encode `payload` under an already registered tag.
    pub fn encode_envelope(&self, type_tag: &str, payload: &(dyn Any + Send + Sync)) -> Result<Vec<u8>> {
        let encoder = self
            .registrations
            .read()
            .get(type_tag)
            .and_then(|r| r.encoder.clone())
            .ok_or_else(|| MeshError::Encoding {
                type_tag: type_tag.to_string(),
                reason: "no encoder registered for this type".into(),
            })?;
        let value = encoder(payload)?;
        Envelope::new(type_tag, Some(value)).to_bytes()
    }

    /// Parse an envelope and decode its payload if the tag is registered.
    ///
    /// An unregistered tag is not an error: the payload is simply absent.
    pub fn decode_envelope(&self, bytes: &[u8]) -> Result<DecodedEnvelope> {
        let envelope = Envelope::from_bytes(bytes)?;
        let decoder = self
            .registrations
            .read()
            .get(&envelope.type_tag)
            .and_then(|r| r.decoder.clone());

        let payload = match decoder {
            Some(decode) => Some(decode(envelope.payload.unwrap_or(serde_json::Value::Null))?),
            None => None,
        };
        Ok(DecodedEnvelope {
            type_tag: envelope.type_tag,
            payload,
        })
    }

    /// Typed convenience over `decode_envelope`.
    pub fn decode<T: Message>(&self, bytes: &[u8]) -> Result<Option<T>> {
        Ok(self.decode_envelope(bytes)?.into_payload::<T>())
    }

    /// Hand a decoded message to its handler. Returns false if there is none.
    pub fn dispatch(&self, decoded: DecodedEnvelope, sender: Peer) -> bool {
        let handler = self
            .registrations
            .read()
            .get(&decoded.type_tag)
            .and_then(|r| r.handler.clone());

        match (handler, decoded.payload) {
            (Some(handler), Some(payload)) => {
                handler(payload, sender);
                true
            }
            _ => {
                debug!(type_tag = %decoded.type_tag, "no handler for message type");
                false
            }
        }
    }

    fn slot<'a, T: Message>(
        registrations: &'a mut HashMap<String, Registration>,
        tag: &str,
    ) -> Result<&'a mut Registration> {
        let registration = registrations
            .entry(tag.to_string())
            .or_insert_with(Registration::empty::<T>);
        if registration.type_id != TypeId::of::<T>() {
            return Err(MeshError::Encoding {
                type_tag: tag.to_string(),
                reason: format!(
                    "tag already used by {}, cannot reuse it for {}",
                    registration.type_name,
                    std::any::type_name::<T>()
                ),
            });
        }
        Ok(registration)
    }
}
