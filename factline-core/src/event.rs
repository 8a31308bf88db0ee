//! Application event declaration and conversion.
//!
//! [`EventObject`] is the contract application event types implement: a
//! serde-serializable value plus declared log coordinates (namespace, kind,
//! version). The [`EventConverter`] turns such a value into a
//! transport-ready [`Fact`].

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

use crate::fact::Fact;

/// An application event that can be published as a fact.
///
/// The declared constants are the fact coordinates; the payload is the
/// serde serialization of the value. Events belonging to an aggregate
/// override [`aggregate_id`](Self::aggregate_id) so the published fact is
/// tagged with the aggregate's identity.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct InvoiceSent {
///     invoice: Uuid,
///     amount_cents: u64,
/// }
///
/// impl EventObject for InvoiceSent {
///     const NAMESPACE: &'static str = "billing";
///     const KIND: &'static str = "invoice-sent";
///
///     fn aggregate_id(&self) -> Option<Uuid> {
///         Some(self.invoice)
///     }
/// }
/// ```
pub trait EventObject: Serialize + DeserializeOwned {
    /// Namespace of the published fact.
    const NAMESPACE: &'static str;
    /// Type string of the published fact.
    const KIND: &'static str;
    /// Schema version of the published fact.
    const VERSION: u32 = 1;

    /// Aggregate identity to tag the fact with, if any.
    fn aggregate_id(&self) -> Option<Uuid> {
        None
    }
}

/// Failure to encode an event or decode a payload.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The event declaration is unusable (empty namespace or kind).
    #[error("event declaration for `{kind}` is incomplete: {detail}")]
    IncompleteDeclaration {
        kind: &'static str,
        detail: &'static str,
    },
    /// Payload encoding failed.
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    /// Payload (or snapshot) decoding failed.
    #[error("failed to decode payload as `{target}`: {source}")]
    Decode {
        target: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Converts application events into transport-ready facts.
///
/// Pure and stateless: every call generates a fresh fact id and encodes
/// the payload through serde.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventConverter;

impl EventConverter {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Turn an event value into a fact.
    ///
    /// # Errors
    ///
    /// Returns [`SerializationError::IncompleteDeclaration`] when the event
    /// declares an empty namespace or kind, or
    /// [`SerializationError::Encode`] when payload encoding fails.
    pub fn to_fact<E: EventObject>(&self, event: &E) -> Result<Fact, SerializationError> {
        if E::NAMESPACE.is_empty() {
            return Err(SerializationError::IncompleteDeclaration {
                kind: E::KIND,
                detail: "namespace must not be empty",
            });
        }
        if E::KIND.is_empty() {
            return Err(SerializationError::IncompleteDeclaration {
                kind: E::NAMESPACE,
                detail: "kind must not be empty",
            });
        }

        let payload = serde_json::to_vec(event).map_err(SerializationError::Encode)?;

        let mut builder = Fact::builder(E::NAMESPACE, E::KIND)
            .version(E::VERSION)
            .payload(payload);
        if let Some(id) = event.aggregate_id() {
            builder = builder.aggregate_id(id);
        }
        Ok(builder.build())
    }
}
