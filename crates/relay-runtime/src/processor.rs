//! Message processor: central dispatch of one delivery
//!
//! Per message: parse the envelope, build the context, look up matching
//! subscribers, run the middleware chain + handler for each (bounded
//! concurrency, optional timeout), then fold the per-handler outcomes into
//! exactly one disposition:
//!
//! - all handlers succeeded        -> ack
//! - any unrecoverable failure     -> DLQ (reason unrecoverable), ack;
//!                                    nak/term when the DLQ is unavailable
//! - delivery limits reached       -> DLQ (reason max_deliver_exceeded),
//!                                    then term either way (no redelivery
//!                                    loop when the DLQ is broken)
//! - otherwise                     -> the subscriber's error decision:
//!                                    retry (nak with backoff), discard
//!                                    (ack), or dead-letter (DLQ then term)
//!
//! Handler errors never escape this module; a crash inside the processor
//! itself naks the message and keeps the worker alive. When the inbox is
//! enabled the whole dispatch runs under its at-most-once guard.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use tracing::{debug, error, info, warn};

use relay_domain::envelope::{EventEnvelope, MessageContext};
use relay_domain::errors::{EnvelopeError, HandlerError};
use relay_domain::{BackoffPolicy, RelayConfig};
use relay_ports::{BusDelivery, DeliveryInfo, Metrics, NewInboxRecord, RepositoryError};

use crate::dlq::{DlqReason, DlqRouter};
use crate::inbox::{InboxEngine, InboxError};
use crate::middleware::MiddlewareChain;
use crate::registry::FrozenRegistry;
use crate::subscriber::{ErrorContext, ErrorDecision, Subscriber};

/// Final acknowledgement decision for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nak(Duration),
    Term,
}

#[derive(Debug, thiserror::Error)]
enum ProcessorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

struct HandlerOutcome {
    subscriber: Arc<Subscriber>,
    result: Result<(), HandlerError>,
}

/// Dispatches deliveries to subscribers and resolves acknowledgements.
pub struct MessageProcessor {
    registry: Arc<FrozenRegistry>,
    chain: MiddlewareChain,
    dlq: Option<Arc<DlqRouter>>,
    inbox: Option<Arc<InboxEngine>>,
    backoff: BackoffPolicy,
    metrics: Arc<dyn Metrics>,
    per_message_concurrency: usize,
    subscriber_timeout: Option<Duration>,
    delivery_ceiling: u64,
}

impl MessageProcessor {
    pub fn new(
        registry: Arc<FrozenRegistry>,
        chain: MiddlewareChain,
        dlq: Option<Arc<DlqRouter>>,
        inbox: Option<Arc<InboxEngine>>,
        backoff: BackoffPolicy,
        metrics: Arc<dyn Metrics>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            registry,
            chain,
            dlq,
            inbox,
            backoff,
            metrics,
            per_message_concurrency: config.per_message_concurrency.max(1),
            subscriber_timeout: config.subscriber_timeout(),
            delivery_ceiling: config.delivery_ceiling(),
        }
    }

    /// Process one delivery and apply the resulting acknowledgement.
    pub async fn process(&self, delivery: &dyn BusDelivery) -> Disposition {
        self.metrics.received();

        let disposition = match self.run(delivery).await {
            Ok(disposition) => disposition,
            Err(e) => {
                // A fault in the processor itself, not the handler. Nak so
                // the message stays retryable and keep the worker alive.
                let info = delivery.info();
                error!(
                    subject = %delivery.subject(),
                    deliveries = info.delivered,
                    error = %e,
                    "Processor fault; message nak'd"
                );
                Disposition::Nak(self.backoff.delay(info.delivered, true))
            }
        };

        self.apply(delivery, disposition).await;
        disposition
    }

    async fn run(&self, delivery: &dyn BusDelivery) -> Result<Disposition, ProcessorError> {
        let info = delivery.info();
        let subject = delivery.subject().to_string();

        let envelope = match EventEnvelope::decode(delivery.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Ok(self.handle_malformed(delivery, &info, &subject, e).await);
            }
        };

        let ctx = MessageContext::from_delivery(
            &envelope,
            &subject,
            info.delivered,
            &info.stream,
            info.stream_sequence,
        );

        let subscribers = self.registry.subscribers_for(&subject);
        if subscribers.is_empty() {
            debug!(subject = %subject, event_id = %envelope.event_id, "No subscribers; ack");
            return Ok(Disposition::Ack);
        }

        let outcomes = match &self.inbox {
            Some(inbox) => {
                let record = NewInboxRecord {
                    event_id: envelope.event_id,
                    subject: subject.clone(),
                    payload: delivery.payload().to_vec(),
                    headers: delivery.headers(),
                    stream: Some(info.stream.clone()),
                    stream_seq: Some(info.stream_sequence),
                    deliveries: info.delivered.min(u32::MAX as u64) as u32,
                };

                let slot = std::sync::Mutex::new(Vec::new());
                let slot_ref = &slot;
                let subscribers_ref = &subscribers;
                let envelope_ref = &envelope;
                let ctx_ref = &ctx;
                let dispatch = move || async move {
                    let outcomes = self.dispatch(subscribers_ref, envelope_ref, ctx_ref).await;
                    // The row records the most severe failure; the fold
                    // below still sees every outcome.
                    let aggregate = outcomes
                        .iter()
                        .filter_map(|o| o.result.as_ref().err())
                        .max_by_key(|e| e.is_unrecoverable())
                        .cloned();
                    *slot_ref.lock().expect("outcome slot") = outcomes;
                    match aggregate {
                        Some(error) => Err(error),
                        None => Ok(()),
                    }
                };

                match inbox.process(record, dispatch).await {
                    Ok(true) => slot.into_inner().expect("outcome slot"),
                    Ok(false) => {
                        debug!(
                            subject = %subject,
                            event_id = %envelope.event_id,
                            "Duplicate delivery skipped by inbox"
                        );
                        return Ok(Disposition::Ack);
                    }
                    Err(InboxError::Handler(_)) => slot.into_inner().expect("outcome slot"),
                    Err(InboxError::Repository(e)) => return Err(e.into()),
                }
            }
            None => self.dispatch(&subscribers, &envelope, &ctx).await,
        };

        Ok(self
            .decide(delivery, &info, &subject, &envelope, &ctx, outcomes)
            .await)
    }

    /// Run every subscriber under the middleware chain, at most
    /// `per_message_concurrency` at a time, each under the effective
    /// timeout.
    async fn dispatch(
        &self,
        subscribers: &[Arc<Subscriber>],
        envelope: &EventEnvelope,
        ctx: &MessageContext,
    ) -> Vec<HandlerOutcome> {
        let futures = subscribers.iter().cloned().map(|subscriber| {
            let message = envelope.message.clone();
            let ctx = ctx.clone();
            let chain = self.chain.clone();
            let timeout = match subscriber.options().timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => self.subscriber_timeout,
            };

            async move {
                let endpoint = subscriber.handle_fn();
                let invocation = chain.execute(endpoint, message, ctx);
                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, invocation).await {
                        Ok(result) => result,
                        Err(_) => Err(HandlerError::transient(format!(
                            "handler timed out after {}ms",
                            limit.as_millis()
                        ))),
                    },
                    None => invocation.await,
                };
                HandlerOutcome { subscriber, result }
            }
        });

        futures::stream::iter(futures)
            .buffer_unordered(self.per_message_concurrency)
            .collect()
            .await
    }

    /// Fold per-handler outcomes into one acknowledgement decision.
    async fn decide(
        &self,
        delivery: &dyn BusDelivery,
        info: &DeliveryInfo,
        subject: &str,
        envelope: &EventEnvelope,
        ctx: &MessageContext,
        outcomes: Vec<HandlerOutcome>,
    ) -> Disposition {
        let failures: Vec<(Arc<Subscriber>, HandlerError)> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome.result {
                Ok(()) => None,
                Err(e) => Some((outcome.subscriber, e)),
            })
            .collect();

        if failures.is_empty() {
            self.metrics.processed();
            info!(
                subject = %subject,
                event_id = %envelope.event_id,
                deliveries = info.delivered,
                "Message processed"
            );
            return Disposition::Ack;
        }

        self.metrics.failed();
        for (subscriber, error) in &failures {
            warn!(
                subject = %subject,
                event_id = %envelope.event_id,
                subscriber = subscriber.name(),
                deliveries = info.delivered,
                error = %error,
                "Handler failed"
            );
        }

        let deliveries = info.delivered;
        let raw = delivery.payload();

        // Unrecoverable failures skip retries entirely.
        if let Some((_, error)) = failures.iter().find(|(_, e)| e.is_unrecoverable()) {
            return match &self.dlq {
                Some(dlq) => {
                    let routed = dlq
                        .route(
                            raw,
                            subject,
                            Some(envelope),
                            info,
                            DlqReason::Unrecoverable,
                            error.class(),
                            &error.to_string(),
                        )
                        .await;
                    if routed {
                        Disposition::Ack
                    } else if deliveries >= self.delivery_ceiling {
                        Disposition::Term
                    } else {
                        Disposition::Nak(self.backoff.delay_for(deliveries, error))
                    }
                }
                None => Disposition::Term,
            };
        }

        // Delivery limits: dead-letter and stop redelivering. Term even if
        // the DLQ publish failed, so a broken DLQ can't cause a loop.
        if deliveries >= self.delivery_ceiling {
            let (_, error) = &failures[0];
            if let Some(dlq) = &self.dlq {
                let routed = dlq
                    .route(
                        raw,
                        subject,
                        Some(envelope),
                        info,
                        DlqReason::MaxDeliverExceeded,
                        error.class(),
                        &error.to_string(),
                    )
                    .await;
                if !routed {
                    error!(
                        subject = %subject,
                        event_id = %envelope.event_id,
                        "DLQ unavailable at delivery limit; terminating to avoid a loop"
                    );
                }
            }
            return Disposition::Term;
        }

        // Under the limits: the subscriber decides.
        let (subscriber, error) = &failures[0];
        let decision = subscriber.on_error(&ErrorContext {
            error,
            deliveries,
            context: ctx,
        });

        match decision {
            ErrorDecision::Retry => Disposition::Nak(self.backoff.delay_for(deliveries, error)),
            ErrorDecision::Discard => {
                debug!(
                    subject = %subject,
                    event_id = %envelope.event_id,
                    subscriber = subscriber.name(),
                    "Failure discarded by subscriber decision"
                );
                Disposition::Ack
            }
            ErrorDecision::DeadLetter => match &self.dlq {
                Some(dlq) => {
                    let routed = dlq
                        .route(
                            raw,
                            subject,
                            Some(envelope),
                            info,
                            DlqReason::HandlerError,
                            error.class(),
                            &error.to_string(),
                        )
                        .await;
                    if routed {
                        Disposition::Term
                    } else {
                        Disposition::Nak(self.backoff.delay_for(deliveries, error))
                    }
                }
                None => Disposition::Term,
            },
        }
    }

    async fn handle_malformed(
        &self,
        delivery: &dyn BusDelivery,
        info: &DeliveryInfo,
        subject: &str,
        error: EnvelopeError,
    ) -> Disposition {
        warn!(
            subject = %subject,
            deliveries = info.delivered,
            error = %error,
            "Malformed payload"
        );
        self.metrics.failed();

        if let Some(dlq) = &self.dlq {
            let routed = dlq
                .route(
                    delivery.payload(),
                    subject,
                    None,
                    info,
                    DlqReason::MalformedPayload,
                    "malformed_payload",
                    &error.to_string(),
                )
                .await;
            if routed {
                return Disposition::Ack;
            }
        }
        Disposition::Nak(self.backoff.delay(info.delivered, false))
    }

    async fn apply(&self, delivery: &dyn BusDelivery, disposition: Disposition) {
        let result = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Nak(delay) => delivery.nak(Some(delay)).await,
            Disposition::Term => delivery.term().await,
        };
        if let Err(e) = result {
            error!(
                subject = %delivery.subject(),
                disposition = ?disposition,
                error = %e,
                "Failed to apply acknowledgement"
            );
        }
    }
}
