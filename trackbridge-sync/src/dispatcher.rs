//! Event dispatcher: one single-consumer loop per hub subscription
//!
//! Raw hub events are normalized, then each typed event goes to the first
//! handler whose `should_handle` accepts it. Events are handled one at a time
//! in delivery order. A failing or panicking handler is logged and the loop
//! carries on with the next event.

use crate::context::SyncContext;
use crate::handlers::{AssetVersionSync, NoteSync, SyncHandler, TaskSync};
use crate::outcome::SyncOutcome;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, Instrument};
use trackbridge_common::config::SyncSettings;
use trackbridge_common::event::normalize;
use trackbridge_common::{Event, RawEvent, RetryPolicy, Subscription};

/// Counters for one dispatch loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub unmatched: u64,
    pub created: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl DispatchStats {
    fn record(&mut self, outcome: &SyncOutcome) {
        if outcome.is_created() {
            self.created += 1;
        } else if outcome.is_failed() {
            self.failed += 1;
        } else {
            self.skipped += 1;
        }
    }
}

pub struct Dispatcher {
    context: SyncContext,
    handlers: Vec<Box<dyn SyncHandler>>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(context: SyncContext, handlers: Vec<Box<dyn SyncHandler>>) -> Self {
        Self {
            context,
            handlers,
            stats: DispatchStats::default(),
        }
    }

    /// Dispatcher with the Task, Note and AssetVersion handlers
    pub fn with_default_handlers(context: SyncContext, settings: &SyncSettings, retry: &RetryPolicy) -> Self {
        let handlers: Vec<Box<dyn SyncHandler>> = vec![
            Box::new(TaskSync::new(settings.task_marker.clone(), retry.clone())),
            Box::new(NoteSync::new(retry.clone())),
            Box::new(AssetVersionSync::new(retry.clone())),
        ];
        Self::new(context, handlers)
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Normalize a hub event and dispatch every entity it reports
    pub async fn dispatch_raw(&mut self, raw: &RawEvent) -> Vec<SyncOutcome> {
        let events = normalize(raw);
        if events.is_empty() {
            debug!(topic = %raw.topic, event_id = %raw.id, "Event reports no usable entities");
        }

        let mut outcomes = Vec::new();
        for event in &events {
            if let Some(outcome) = self.dispatch(event).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Route one typed event; `None` when no handler wants it
    pub async fn dispatch(&mut self, event: &Event) -> Option<SyncOutcome> {
        self.stats.received += 1;

        let span = tracing::info_span!(
            "event",
            server = %self.context.source().server_name(),
            entity_id = %event.entity_id,
            kind = %event.entity_kind,
            action = %event.action
        );
        let outcome = route(&self.context, &self.handlers, event).instrument(span).await;

        match &outcome {
            Some(outcome) => self.stats.record(outcome),
            None => self.stats.unmatched += 1,
        }
        outcome
    }

    /// Drain a subscription until it closes
    pub async fn run(mut self, mut subscription: Subscription) -> DispatchStats {
        let span = self.context.span();
        async move {
            info!(topics = ?subscription.topics(), "Dispatch loop started");
            while let Some(raw) = subscription.next().await {
                self.dispatch_raw(&raw).await;
            }
            let stats = self.stats;
            info!(
                received = stats.received,
                unmatched = stats.unmatched,
                created = stats.created,
                skipped = stats.skipped,
                failed = stats.failed,
                "Dispatch loop stopped"
            );
            stats
        }
        .instrument(span)
        .await
    }
}

async fn route(context: &SyncContext, handlers: &[Box<dyn SyncHandler>], event: &Event) -> Option<SyncOutcome> {
    let Some(handler) = handlers.iter().find(|h| h.should_handle(event)) else {
        debug!("No handler for event, dropped");
        return None;
    };
    debug!(handler = handler.name(), "Routing event");

    let source = context.source();
    let target = context.target();
    let outcome = match AssertUnwindSafe(handler.sync(event, source, target))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(handler = handler.name(), panic = %message, "Handler panicked");
            target.rollback().await;
            SyncOutcome::Failed(format!("handler panicked: {}", message))
        }
    };

    outcome.log(handler.name(), target.server_name());
    Some(outcome)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
