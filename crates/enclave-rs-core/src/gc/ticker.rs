//! Periodic GC driven by a tokio interval.

use super::GcService;
use crate::context::RequestContext;
use enclave_rs_protocol::GcRequest;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Actor name recorded on periodic collections.
pub const GC_LOOP_ACTOR: &str = "gc-loop";

/// Background ticker that runs the configured default policy.
pub struct GcLoop {
    service: Arc<GcService>,
    interval: Duration,
}

impl GcLoop {
    pub fn new(service: Arc<GcService>) -> Self {
        let interval = Duration::from_secs(service.config().interval.max(1));
        Self { service, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run on the current runtime until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Tick until `shutdown` fires. An in-flight run is cancelled with it and
    /// stops between records.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("gc loop started (interval_ms={})", self.interval.as_millis());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let ctx = RequestContext::with_token(shutdown.child_token());
            let request = GcRequest {
                policy: None,
                dry_run: false,
                limit: None,
                actor: GC_LOOP_ACTOR.to_string(),
            };
            match self.service.run(&ctx, request).await {
                Ok(result) => debug!(
                    "gc tick done (collected={}, errors={})",
                    result.collected.len(),
                    result.errors.len()
                ),
                Err(err) => warn!("gc tick failed (error={err})"),
            }
        }
        info!("gc loop stopped");
    }
}
