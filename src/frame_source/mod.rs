//! FrameSource - Frame Producer Adapters
//!
//! ## Responsibilities
//!
//! - Common producer contract: start / stop / restart
//! - Pipeline variant: locator -> supervised transcoder -> JPEG demux
//! - Direct-feed variant: vendor feed of discrete images -> forward
//! - Variant selection per vendor family (SourceSet)
//!
//! Producers push `FrameEvent`s into a bounded per-start queue owned by the
//! session controller. Every producer ends with exactly one `Terminated`.

mod demuxer;
mod direct_feed;
mod pipeline;
mod transcoder;
mod types;

pub use demuxer::{JpegDemuxer, DEFAULT_MAX_FRAME_BYTES};
pub use direct_feed::DirectFeedSource;
pub use pipeline::{PipelineSource, DEFAULT_MAX_TRANSCODERS};
pub use transcoder::{
    check_transcoder, TranscoderConfig, DEFAULT_FPS, DEFAULT_READ_TIMEOUT_SEC, DEFAULT_STOP_GRACE_MS,
};
pub use types::*;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Live producer bound to one session; exclusively owned by its controller
#[async_trait]
pub trait FrameSourceConnection: Send {
    /// Halt production and release every resource. Idempotent.
    async fn stop(&mut self);

    /// Whether the production task is still alive
    fn is_running(&self) -> bool;

    /// OS process ID of the supervised transcoder, if any
    fn process_id(&self) -> Option<u32> {
        None
    }
}

/// Frame producer factory (one per adapter variant)
#[async_trait]
pub trait FrameSource: Send + Sync {
    fn variant(&self) -> AdapterVariant;

    /// Begin production into `sink`
    ///
    /// Returns once the producer is running; first-frame arrival is
    /// observed on the sink.
    async fn start(&self, params: &StartParams, sink: FrameSink) -> Result<Box<dyn FrameSourceConnection>>;

    /// Stop-then-start on the same session
    ///
    /// The prior producer is fully released before the new one starts.
    async fn restart(
        &self,
        current: &mut Option<Box<dyn FrameSourceConnection>>,
        params: &StartParams,
        sink: FrameSink,
    ) -> Result<Box<dyn FrameSourceConnection>> {
        if let Some(mut previous) = current.take() {
            previous.stop().await;
        }
        self.start(params, sink).await
    }
}

/// Stop signal + production task shared by both variants
pub(crate) struct ProducerHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    /// Upper bound on waiting for the task after signalling stop
    stop_bound: Duration,
}

impl ProducerHandle {
    pub(crate) fn new(stop_tx: watch::Sender<bool>, task: JoinHandle<()>, stop_bound: Duration) -> Self {
        Self {
            stop_tx,
            task: Some(task),
            stop_bound,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub(crate) async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.stop_tx.send(true);

        let abort = task.abort_handle();
        if tokio::time::timeout(self.stop_bound, task).await.is_err() {
            tracing::warn!(
                bound_ms = self.stop_bound.as_millis() as u64,
                "Producer did not stop in time, aborting"
            );
            abort.abort();
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.stop_tx.send(true);
            task.abort();
        }
    }
}

/// Resolves once stop has been requested (or the handle is gone)
pub(crate) async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Send an event unless stop is requested first
///
/// Returns false when the producer should wind down.
pub(crate) async fn forward(sink: &FrameSink, event: FrameEvent, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = stop_requested(stop_rx) => false,
        sent = sink.send(event) => sent.is_ok(),
    }
}

/// Emit the single terminal event
///
/// After a stop request nobody drains the sink, so only try once.
pub(crate) async fn emit_terminal(sink: &FrameSink, reason: TerminalReason, stop_rx: &mut watch::Receiver<bool>) {
    if *stop_rx.borrow() {
        let _ = sink.try_send(FrameEvent::Terminated(reason));
        return;
    }
    let event = FrameEvent::Terminated(reason.clone());
    if !forward(sink, event, stop_rx).await {
        let _ = sink.try_send(FrameEvent::Terminated(reason));
    }
}

/// Adapter variants keyed by vendor family
pub struct SourceSet {
    sources: HashMap<AdapterVariant, Arc<dyn FrameSource>>,
    bindings: HashMap<String, AdapterVariant>,
    default_variant: AdapterVariant,
}

impl SourceSet {
    pub fn new(default_variant: AdapterVariant) -> Self {
        Self {
            sources: HashMap::new(),
            bindings: HashMap::new(),
            default_variant,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.sources.insert(source.variant(), source);
        self
    }

    /// Bind a vendor family to a variant
    pub fn bind(mut self, family: &str, variant: AdapterVariant) -> Self {
        self.bindings.insert(family.to_lowercase(), variant);
        self
    }

    /// Parse `family=variant,...`; the `default` key sets the fallback
    pub fn with_bindings(mut self, spec: &str) -> Result<Self> {
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (family, variant) = entry
                .split_once('=')
                .ok_or_else(|| Error::Configuration(format!("Invalid source binding: {}", entry)))?;
            let variant = variant
                .parse::<AdapterVariant>()
                .map_err(Error::Configuration)?;
            if family.trim().eq_ignore_ascii_case("default") {
                self.default_variant = variant;
            } else {
                self = self.bind(family.trim(), variant);
            }
        }
        Ok(self)
    }

    pub fn variant_for(&self, family: &str) -> AdapterVariant {
        self.bindings
            .get(&family.to_lowercase())
            .copied()
            .unwrap_or(self.default_variant)
    }

    /// Adapter for a vendor family
    pub fn select(&self, family: &str) -> Result<Arc<dyn FrameSource>> {
        let variant = self.variant_for(family);
        self.sources.get(&variant).cloned().ok_or_else(|| {
            Error::Configuration(format!(
                "No {:?} adapter configured for family {}",
                variant, family
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSource(AdapterVariant);

    #[async_trait]
    impl FrameSource for NullSource {
        fn variant(&self) -> AdapterVariant {
            self.0
        }

        async fn start(&self, _params: &StartParams, _sink: FrameSink) -> Result<Box<dyn FrameSourceConnection>> {
            Err(Error::SourceUnavailable("null".to_string()))
        }
    }

    #[test]
    fn test_source_set_selects_by_binding() {
        let set = SourceSet::new(AdapterVariant::Pipeline)
            .with_source(Arc::new(NullSource(AdapterVariant::Pipeline)))
            .with_source(Arc::new(NullSource(AdapterVariant::DirectFeed)))
            .with_bindings("nest=direct_feed, default=pipeline")
            .unwrap();

        assert_eq!(set.select("Nest").unwrap().variant(), AdapterVariant::DirectFeed);
        assert_eq!(set.select("tapo").unwrap().variant(), AdapterVariant::Pipeline);
    }

    #[test]
    fn test_source_set_missing_variant_is_configuration_error() {
        let set = SourceSet::new(AdapterVariant::Pipeline)
            .with_source(Arc::new(NullSource(AdapterVariant::Pipeline)))
            .bind("axis", AdapterVariant::DirectFeed);
        assert!(matches!(set.select("axis"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_bad_binding_rejected() {
        let result = SourceSet::new(AdapterVariant::Pipeline).with_bindings("nest");
        assert!(result.is_err());
        let result = SourceSet::new(AdapterVariant::Pipeline).with_bindings("nest=carrier-pigeon");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_forward_stops_when_requested() {
        let (sink, _rx) = tokio::sync::mpsc::channel(1);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        // Fill the queue so a plain send would block
        sink.try_send(FrameEvent::Terminated(TerminalReason::NormalStop)).unwrap();
        stop_tx.send(true).unwrap();

        let event = FrameEvent::Terminated(TerminalReason::Timeout);
        assert!(!forward(&sink, event, &mut stop_rx).await);
    }
}
