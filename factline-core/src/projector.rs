//! Fact dispatch into projections.
//!
//! A [`Dispatch`] is the precomputed routing table for one projection
//! type: which fact coordinates it consumes, and how each incoming fact is
//! decoded and applied. Projections build their table once, by explicit
//! registration, in [`FactModel::dispatch`](crate::projection::FactModel::dispatch):
//!
//! ```ignore
//! fn dispatch() -> Dispatch<Self> {
//!     Dispatch::builder()
//!         .on::<InvoiceSent>()
//!         .on::<InvoicePaid>()
//!         .build()
//! }
//! ```

use thiserror::Error;

use crate::{
    event::{EventObject, SerializationError},
    fact::{Fact, FactId, FactSpec, VersionRange},
};

/// Apply one decoded event to a projection.
///
/// Handlers receive the decoded event together with the carrying fact, so
/// they can consult header metadata or the aggregate id when needed.
pub trait Apply<E: EventObject> {
    fn apply(&mut self, event: E, fact: &Fact);
}

/// A fact arrived for which the projection has no handler.
///
/// Callers treat this as fatal for the subscription that produced it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("no handler for fact {ns}/{kind} v{version} ({id})")]
pub struct UnhandledFactError {
    pub ns: String,
    pub kind: String,
    pub version: u32,
    pub id: FactId,
}

/// Failure to route a fact into a projection.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Unhandled(#[from] UnhandledFactError),
    #[error(transparent)]
    Decode(SerializationError),
}

type Handler<P> = Box<dyn Fn(&mut P, &Fact) -> Result<(), SerializationError> + Send + Sync>;

struct Route<P> {
    ns: &'static str,
    kind: &'static str,
    versions: VersionRange,
    handler: Handler<P>,
}

impl<P> Route<P> {
    fn covers(&self, fact: &Fact) -> bool {
        self.ns == fact.ns() && self.kind == fact.kind() && self.versions.contains(fact.version())
    }
}

/// Precomputed dispatch table for one projection type.
pub struct Dispatch<P> {
    routes: Vec<Route<P>>,
}

impl<P> Dispatch<P> {
    #[must_use]
    pub fn builder() -> DispatchBuilder<P> {
        DispatchBuilder { routes: Vec::new() }
    }

    /// The set of fact filters this projection consumes.
    ///
    /// Finite, order-irrelevant; identical routes are reported once.
    #[must_use]
    pub fn fact_specs(&self) -> Vec<FactSpec> {
        let mut specs: Vec<FactSpec> = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let spec = FactSpec::new(route.ns, route.kind).versions(route.versions);
            if !specs.contains(&spec) {
                specs.push(spec);
            }
        }
        specs
    }

    /// Route a fact to the matching handler.
    ///
    /// When several routes cover the fact's version, an exact-version route
    /// wins over a range route.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Unhandled`] when no route covers the fact,
    /// or [`DispatchError::Decode`] when the payload cannot be decoded.
    pub fn apply(&self, projection: &mut P, fact: &Fact) -> Result<(), DispatchError> {
        let mut fallback: Option<&Route<P>> = None;
        for route in &self.routes {
            if !route.covers(fact) {
                continue;
            }
            if route.versions.is_exact() {
                return (route.handler)(projection, fact).map_err(DispatchError::Decode);
            }
            fallback.get_or_insert(route);
        }

        match fallback {
            Some(route) => (route.handler)(projection, fact).map_err(DispatchError::Decode),
            None => Err(UnhandledFactError {
                ns: fact.ns().to_string(),
                kind: fact.kind().to_string(),
                version: fact.version(),
                id: fact.id(),
            }
            .into()),
        }
    }
}

/// Builder for [`Dispatch`], one registration per handled event shape.
pub struct DispatchBuilder<P> {
    routes: Vec<Route<P>>,
}

impl<P: 'static> DispatchBuilder<P> {
    /// Register an event type at its declared version.
    #[must_use]
    pub fn on<E>(self) -> Self
    where
        E: EventObject + 'static,
        P: Apply<E>,
    {
        self.on_versions::<E>(VersionRange::Exact(E::VERSION))
    }

    /// Register an event type for a range of versions.
    ///
    /// The handler decodes every covered version with `E`'s serde shape;
    /// use this for versions that are wire-compatible.
    #[must_use]
    pub fn on_versions<E>(mut self, versions: VersionRange) -> Self
    where
        E: EventObject + 'static,
        P: Apply<E>,
    {
        self.routes.push(Route {
            ns: E::NAMESPACE,
            kind: E::KIND,
            versions,
            handler: Box::new(|projection, fact| {
                let event: E =
                    serde_json::from_slice(fact.payload()).map_err(|source| {
                        SerializationError::Decode {
                            target: E::KIND.to_string(),
                            source,
                        }
                    })?;
                Apply::apply(projection, event, fact);
                Ok(())
            }),
        });
        self
    }

    /// Register a raw-fact handler: no payload decoding, the closure gets
    /// the fact as-is.
    #[must_use]
    pub fn on_raw<H>(
        mut self,
        ns: &'static str,
        kind: &'static str,
        versions: VersionRange,
        handler: H,
    ) -> Self
    where
        H: Fn(&mut P, &Fact) + Send + Sync + 'static,
    {
        self.routes.push(Route {
            ns,
            kind,
            versions,
            handler: Box::new(move |projection, fact| {
                handler(projection, fact);
                Ok(())
            }),
        });
        self
    }

    #[must_use]
    pub fn build(self) -> Dispatch<P> {
        Dispatch {
            routes: self.routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::EventConverter;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl EventObject for Deposited {
        const NAMESPACE: &'static str = "bank";
        const KIND: &'static str = "deposited";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Withdrawn {
        amount: i64,
    }

    impl EventObject for Withdrawn {
        const NAMESPACE: &'static str = "bank";
        const KIND: &'static str = "withdrawn";
    }

    #[derive(Debug, Default)]
    struct Balance {
        value: i64,
        via_range_handler: bool,
        raw_seen: u32,
    }

    impl Apply<Deposited> for Balance {
        fn apply(&mut self, event: Deposited, _fact: &Fact) {
            self.value += event.amount;
        }
    }

    impl Apply<Withdrawn> for Balance {
        fn apply(&mut self, event: Withdrawn, _fact: &Fact) {
            self.value -= event.amount;
        }
    }

    fn fact_for<E: EventObject>(event: &E) -> Fact {
        EventConverter::new().to_fact(event).unwrap()
    }

    #[test]
    fn dispatches_to_matching_handler() {
        let dispatch = Dispatch::builder()
            .on::<Deposited>()
            .on::<Withdrawn>()
            .build();
        let mut balance = Balance::default();

        dispatch
            .apply(&mut balance, &fact_for(&Deposited { amount: 100 }))
            .unwrap();
        dispatch
            .apply(&mut balance, &fact_for(&Withdrawn { amount: 30 }))
            .unwrap();

        assert_eq!(balance.value, 70);
    }

    #[test]
    fn unmatched_fact_is_an_error() {
        let dispatch = Dispatch::<Balance>::builder().on::<Deposited>().build();
        let mut balance = Balance::default();

        let result = dispatch.apply(&mut balance, &fact_for(&Withdrawn { amount: 1 }));
        assert!(matches!(result, Err(DispatchError::Unhandled(e)) if e.kind == "withdrawn"));
    }

    #[test]
    fn exact_version_wins_over_range() {
        let dispatch = Dispatch::builder()
            .on_raw(
                "bank",
                "deposited",
                VersionRange::Any,
                |balance: &mut Balance, _fact| balance.via_range_handler = true,
            )
            .on::<Deposited>()
            .build();
        let mut balance = Balance::default();

        dispatch
            .apply(&mut balance, &fact_for(&Deposited { amount: 5 }))
            .unwrap();

        assert_eq!(balance.value, 5);
        assert!(!balance.via_range_handler);
    }

    #[test]
    fn range_handler_catches_other_versions() {
        let dispatch = Dispatch::builder()
            .on::<Deposited>()
            .on_raw(
                "bank",
                "deposited",
                VersionRange::From(2),
                |balance: &mut Balance, _fact| balance.raw_seen += 1,
            )
            .build();
        let mut balance = Balance::default();

        let v3 = Fact::builder("bank", "deposited").version(3).build();
        dispatch.apply(&mut balance, &v3).unwrap();

        assert_eq!(balance.raw_seen, 1);
        assert_eq!(balance.value, 0);
    }

    #[test]
    fn undecodable_payload_is_a_decode_error() {
        let dispatch = Dispatch::<Balance>::builder().on::<Deposited>().build();
        let mut balance = Balance::default();

        let broken = Fact::builder("bank", "deposited")
            .payload(b"not json".to_vec())
            .build();
        let result = dispatch.apply(&mut balance, &broken);
        assert!(matches!(result, Err(DispatchError::Decode(_))));
    }

    #[test]
    fn fact_specs_cover_registrations_without_duplicates() {
        let dispatch = Dispatch::builder()
            .on::<Deposited>()
            .on::<Deposited>()
            .on::<Withdrawn>()
            .build();

        let specs = dispatch.fact_specs();
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.ns() == "bank"));
        assert!(
            specs
                .iter()
                .any(|s| s.kind() == "deposited" && s.version_range() == VersionRange::Exact(1))
        );
        assert!(specs.iter().any(|s| s.kind() == "withdrawn"));
    }
}
