//! Prometheus instrumentation for the engine.
//!
//! Thin hooks only: timing histograms around the public operations, a
//! gauge for loaded snapshot sizes, and a latency histogram fed from the
//! `_ts` fact header. Every sample is tagged with `class` (the projection
//! name) and, where the operation exists in locked and unlocked form,
//! `locked`. Recording never fails and never alters control flow; an
//! engine built without a registry records nothing.

use std::{sync::Arc, time::Duration};

use prometheus::{GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

struct Collectors {
    fetch_duration: HistogramVec,
    find_duration: HistogramVec,
    update_duration: HistogramVec,
    event_processing_latency: HistogramVec,
    fetch_size: GaugeVec,
}

/// Handle onto the engine's metric collectors.
///
/// Cheap to clone; all collectors are shared.
#[derive(Clone)]
pub struct EngineMetrics {
    collectors: Option<Arc<Collectors>>,
}

impl EngineMetrics {
    /// Metrics that record nothing. The default for a new engine.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { collectors: None }
    }

    /// Create and register the collectors.
    ///
    /// # Errors
    ///
    /// Returns a [`prometheus::Error`] when registration fails (for
    /// example a name collision on a shared registry).
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let fetch_duration = HistogramVec::new(
            HistogramOpts::new(
                "factline_fetch_duration_seconds",
                "Time to materialize a snapshot projection",
            ),
            &["class", "locked"],
        )?;
        registry.register(Box::new(fetch_duration.clone()))?;

        let find_duration = HistogramVec::new(
            HistogramOpts::new(
                "factline_find_duration_seconds",
                "Time to materialize an aggregate",
            ),
            &["class", "locked"],
        )?;
        registry.register(Box::new(find_duration.clone()))?;

        let update_duration = HistogramVec::new(
            HistogramOpts::new(
                "factline_managed_projection_update_duration_seconds",
                "Time to catch a managed projection up to the log tail",
            ),
            &["class"],
        )?;
        registry.register(Box::new(update_duration.clone()))?;

        let event_processing_latency = HistogramVec::new(
            HistogramOpts::new(
                "factline_event_processing_latency_seconds",
                "Delay between fact publication and application by a subscribed projection",
            ),
            &["class"],
        )?;
        registry.register(Box::new(event_processing_latency.clone()))?;

        let fetch_size = GaugeVec::new(
            Opts::new(
                "factline_fetch_size_bytes",
                "Size of the snapshot loaded during the last materialization",
            ),
            &["class"],
        )?;
        registry.register(Box::new(fetch_size.clone()))?;

        Ok(Self {
            collectors: Some(Arc::new(Collectors {
                fetch_duration,
                find_duration,
                update_duration,
                event_processing_latency,
                fetch_size,
            })),
        })
    }

    pub(crate) fn record_fetch_duration(&self, class: &str, locked: bool, elapsed: Duration) {
        if let Some(collectors) = &self.collectors {
            collectors
                .fetch_duration
                .with_label_values(&[class, locked_label(locked)])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub(crate) fn record_find_duration(&self, class: &str, locked: bool, elapsed: Duration) {
        if let Some(collectors) = &self.collectors {
            collectors
                .find_duration
                .with_label_values(&[class, locked_label(locked)])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub(crate) fn record_update_duration(&self, class: &str, elapsed: Duration) {
        if let Some(collectors) = &self.collectors {
            collectors
                .update_duration
                .with_label_values(&[class])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub(crate) fn record_event_processing_latency(&self, class: &str, latency: Duration) {
        if let Some(collectors) = &self.collectors {
            collectors
                .event_processing_latency
                .with_label_values(&[class])
                .observe(latency.as_secs_f64());
        }
    }

    pub(crate) fn record_fetch_size(&self, class: &str, bytes: usize) {
        if let Some(collectors) = &self.collectors {
            #[allow(clippy::cast_precision_loss)]
            collectors
                .fetch_size
                .with_label_values(&[class])
                .set(bytes as f64);
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::disabled()
    }
}

const fn locked_label(locked: bool) -> &'static str {
    if locked { "true" } else { "false" }
}
