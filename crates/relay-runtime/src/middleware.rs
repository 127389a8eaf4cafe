//! Middleware chain
//!
//! Interceptors run in order around every handler invocation. Each receives
//! the message, the delivery context, and a `Next`; calling `next.run(..)`
//! zero times short-circuits the chain and the handler never runs, calling
//! it once continues inward. Errors propagate outward unless an enclosing
//! interceptor maps them. The chain runs exactly once per handler per
//! delivery.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use relay_domain::envelope::MessageContext;
use relay_domain::errors::HandlerError;

use crate::subscriber::HandleFn;

/// One interceptor in the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        message: Value,
        ctx: MessageContext,
        next: Next,
    ) -> Result<(), HandlerError>;
}

/// Continuation over the remaining interceptors and the final handler.
///
/// Advances an index over the shared chain slice; no recursion over batch
/// size is possible here, depth is bounded by the chain length.
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    endpoint: HandleFn,
}

impl Next {
    /// Run the rest of the chain, ending at the handler.
    pub async fn run(mut self, message: Value, ctx: MessageContext) -> Result<(), HandlerError> {
        if self.index < self.chain.len() {
            let middleware = self.chain[self.index].clone();
            self.index += 1;
            middleware.handle(message, ctx, self).await
        } else {
            (self.endpoint)(message, ctx).await
        }
    }
}

/// Ordered list of interceptors applied around every handler.
#[derive(Clone)]
pub struct MiddlewareChain {
    chain: Arc<[Arc<dyn Middleware>]>,
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            chain: middlewares.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Execute the chain around one handler invocation.
    pub async fn execute(
        &self,
        endpoint: HandleFn,
        message: Value,
        ctx: MessageContext,
    ) -> Result<(), HandlerError> {
        Next {
            chain: self.chain.clone(),
            index: 0,
            endpoint,
        }
        .run(message, ctx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use relay_domain::envelope::EventEnvelope;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_context() -> MessageContext {
        let envelope = EventEnvelope::new("t", "p", json!({}));
        MessageContext::from_delivery(&envelope, "test.p.t", 1, "events", 1)
    }

    fn counting_endpoint(counter: Arc<AtomicUsize>) -> HandleFn {
        Arc::new(move |_message, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    struct Recorder {
        label: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(
            &self,
            message: Value,
            ctx: MessageContext,
            next: Next,
        ) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push(self.label);
            let result = next.run(message, ctx).await;
            self.log.lock().unwrap().push(self.label);
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(
            &self,
            _message: Value,
            _ctx: MessageContext,
            _next: Next,
        ) -> Result<(), HandlerError> {
            // Never calls next: the handler must not run.
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Middleware for Failing {
        async fn handle(
            &self,
            _message: Value,
            _ctx: MessageContext,
            _next: Next,
        ) -> Result<(), HandlerError> {
            Err(HandlerError::failed("interceptor rejected"))
        }
    }

    #[tokio::test]
    async fn test_ordering_wraps_like_an_onion() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new(vec![
            Arc::new(Recorder {
                label: "outer",
                log: log.clone(),
            }),
            Arc::new(Recorder {
                label: "inner",
                log: log.clone(),
            }),
        ]);

        let counter = Arc::new(AtomicUsize::new(0));
        chain
            .execute(counting_endpoint(counter.clone()), json!({}), test_context())
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner", "inner", "outer"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let chain = MiddlewareChain::new(vec![Arc::new(ShortCircuit)]);
        let counter = Arc::new(AtomicUsize::new(0));

        chain
            .execute(counting_endpoint(counter.clone()), json!({}), test_context())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_propagates_outward() {
        let chain = MiddlewareChain::new(vec![Arc::new(Failing)]);
        let counter = Arc::new(AtomicUsize::new(0));

        let err = chain
            .execute(counting_endpoint(counter.clone()), json!({}), test_context())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Failed { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_runs_handler_directly() {
        let chain = MiddlewareChain::default();
        let counter = Arc::new(AtomicUsize::new(0));
        chain
            .execute(counting_endpoint(counter.clone()), json!({}), test_context())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
