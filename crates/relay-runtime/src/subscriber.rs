//! Subscriber values
//!
//! A subscriber is a plain value carrying its subject patterns, options,
//! handler function, and an optional error-decision hook. The registry
//! stores these values; nothing is registered through types or globals.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use relay_domain::envelope::MessageContext;
use relay_domain::errors::HandlerError;

/// Boxed handler function invoked per matching delivery.
pub type HandleFn =
    Arc<dyn Fn(Value, MessageContext) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Error-decision hook consulted when a handler fails under the delivery
/// limits.
pub type OnErrorFn = Arc<dyn Fn(&ErrorContext<'_>) -> ErrorDecision + Send + Sync>;

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Nak with backoff and let the bus redeliver
    Retry,
    /// Ack and drop the message
    Discard,
    /// Route to the dead-letter stream, then terminate
    DeadLetter,
}

/// Context handed to the error-decision hook.
#[derive(Debug)]
pub struct ErrorContext<'a> {
    pub error: &'a HandlerError,
    pub deliveries: u64,
    pub context: &'a MessageContext,
}

/// Per-subscriber options.
#[derive(Debug, Clone, Default)]
pub struct SubscriberOptions {
    /// Handler timeout override in milliseconds; falls back to the runtime
    /// configuration when unset, 0 disables the timeout for this subscriber
    pub timeout_ms: Option<u64>,
}

/// Subscriber build errors.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("subscriber {name} declares no subject patterns")]
    NoPatterns { name: String },

    #[error("subscriber {name} has no handler")]
    MissingHandler { name: String },
}

/// A registered event handler.
pub struct Subscriber {
    name: String,
    patterns: Vec<String>,
    options: SubscriberOptions,
    handle_fn: HandleFn,
    on_error_fn: Option<OnErrorFn>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .finish()
    }
}

impl Subscriber {
    pub fn builder(name: impl Into<String>) -> SubscriberBuilder {
        SubscriberBuilder {
            name: name.into(),
            patterns: Vec::new(),
            options: SubscriberOptions::default(),
            handle_fn: None,
            on_error_fn: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn options(&self) -> &SubscriberOptions {
        &self.options
    }

    /// Invoke the handler for one delivery.
    pub async fn handle(&self, message: Value, ctx: MessageContext) -> Result<(), HandlerError> {
        (self.handle_fn)(message, ctx).await
    }

    pub(crate) fn handle_fn(&self) -> HandleFn {
        self.handle_fn.clone()
    }

    /// Consult the subscriber's error hook; defaults to retry.
    pub fn on_error(&self, ctx: &ErrorContext<'_>) -> ErrorDecision {
        match &self.on_error_fn {
            Some(hook) => hook(ctx),
            None => ErrorDecision::Retry,
        }
    }
}

/// Fluent builder yielding a `Subscriber` value.
pub struct SubscriberBuilder {
    name: String,
    patterns: Vec<String>,
    options: SubscriberOptions,
    handle_fn: Option<HandleFn>,
    on_error_fn: Option<OnErrorFn>,
}

impl SubscriberBuilder {
    /// Add one subject pattern this subscriber listens on.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Add several subject patterns.
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Override the handler timeout for this subscriber.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the handler function.
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handle_fn = Some(Arc::new(move |message, ctx| f(message, ctx).boxed()));
        self
    }

    /// Set the error-decision hook.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorContext<'_>) -> ErrorDecision + Send + Sync + 'static,
    {
        self.on_error_fn = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Subscriber, SubscriberError> {
        if self.patterns.is_empty() {
            return Err(SubscriberError::NoPatterns { name: self.name });
        }
        let handle_fn = self.handle_fn.ok_or(SubscriberError::MissingHandler {
            name: self.name.clone(),
        })?;
        Ok(Subscriber {
            name: self.name,
            patterns: self.patterns,
            options: self.options,
            handle_fn,
            on_error_fn: self.on_error_fn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::envelope::EventEnvelope;
    use serde_json::json;

    fn test_context() -> MessageContext {
        let envelope = EventEnvelope::new("orders.created", "svc-a", json!({}));
        MessageContext::from_delivery(&envelope, "test.svc-a.orders.created", 1, "events", 1)
    }

    #[tokio::test]
    async fn test_builder_and_handle() {
        let subscriber = Subscriber::builder("orders")
            .pattern("test.svc-a.orders.created")
            .handler(|message, _ctx| async move {
                assert_eq!(message["id"], "o-1");
                Ok(())
            })
            .build()
            .unwrap();

        assert_eq!(subscriber.name(), "orders");
        assert_eq!(subscriber.patterns().len(), 1);
        subscriber
            .handle(json!({"id": "o-1"}), test_context())
            .await
            .unwrap();
    }

    #[test]
    fn test_build_requires_patterns_and_handler() {
        let no_patterns = Subscriber::builder("x")
            .handler(|_, _| async { Ok(()) })
            .build();
        assert!(matches!(no_patterns, Err(SubscriberError::NoPatterns { .. })));

        let no_handler = Subscriber::builder("x").pattern("a.b").build();
        assert!(matches!(
            no_handler,
            Err(SubscriberError::MissingHandler { .. })
        ));
    }

    #[test]
    fn test_default_error_decision_is_retry() {
        let subscriber = Subscriber::builder("x")
            .pattern("a.b")
            .handler(|_, _| async { Ok(()) })
            .build()
            .unwrap();

        let error = HandlerError::failed("boom");
        let ctx = test_context();
        let decision = subscriber.on_error(&ErrorContext {
            error: &error,
            deliveries: 1,
            context: &ctx,
        });
        assert_eq!(decision, ErrorDecision::Retry);
    }

    #[test]
    fn test_custom_error_hook() {
        let subscriber = Subscriber::builder("x")
            .pattern("a.b")
            .handler(|_, _| async { Ok(()) })
            .on_error(|ctx| {
                if ctx.deliveries >= 2 {
                    ErrorDecision::Discard
                } else {
                    ErrorDecision::Retry
                }
            })
            .build()
            .unwrap();

        let error = HandlerError::failed("boom");
        let ctx = test_context();
        assert_eq!(
            subscriber.on_error(&ErrorContext {
                error: &error,
                deliveries: 1,
                context: &ctx
            }),
            ErrorDecision::Retry
        );
        assert_eq!(
            subscriber.on_error(&ErrorContext {
                error: &error,
                deliveries: 2,
                context: &ctx
            }),
            ErrorDecision::Discard
        );
    }
}
