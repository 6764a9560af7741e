//! Observer chain
//!
//! Observers see every call twice: [`CallObserver::notify_before`] before
//! the wrapped service runs and [`CallObserver::notify_after`] once a
//! response exists. All hooks default to no-ops, so an observer implements
//! only what it needs.
//!
//! ```text
//! alter_request (all) → freeze request
//!   → notify_before (in order)      ── an error aborts here
//!   → service.invoke                ── skipped when the call was cancelled
//!   → notify_after (reverse order)
//!   → alter_response (all) → freeze response
//! ```
//!
//! Every observer whose `notify_before` succeeded is unwound exactly once:
//! by `notify_after` when a response exists, otherwise by
//! [`CallObserver::abort`]. That also holds when the `execute` future is
//! dropped mid-flight, in which case the aborts run on a spawned task.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::call::{Call, CallId, Request, ServiceError};
use crate::error::ObserverError;

/// The remote service being wrapped
#[async_trait]
pub trait Service: Send + Sync {
    async fn invoke(&self, request: &Request) -> Result<Value, ServiceError>;

    /// Name recorded on calls for diagnostics and grace refreshes
    fn name(&self) -> &str {
        "service"
    }
}

/// Hooks run around each call
#[async_trait]
pub trait CallObserver: Send + Sync {
    /// Rewrite the request before it is frozen
    async fn alter_request(&self, _call: &mut Call) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn notify_before(&self, _call: &mut Call) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn notify_after(&self, _call: &mut Call) -> Result<(), ObserverError> {
        Ok(())
    }

    /// Rewrite the response before it is frozen
    async fn alter_response(&self, _call: &mut Call) -> Result<(), ObserverError> {
        Ok(())
    }

    /// Undo `notify_before` for a call that will never reach `notify_after`
    ///
    /// Runs when a later hook fails before a response exists, or when the
    /// call is dropped. `call` is the aborted call and `root` its tree root.
    async fn abort(&self, _root: CallId, _call: CallId) {}

    /// Requests for `service` to replay as terminating calls during shutdown
    async fn pending_refreshes(&self, _service: &str) -> Vec<Request> {
        Vec::new()
    }

    /// Run once when the host drains
    async fn terminate(&self) -> Result<(), ObserverError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "observer"
    }
}

/// Ordered set of observers around one service
#[derive(Clone, Default)]
pub struct ObserverChain {
    observers: Vec<Arc<dyn CallObserver>>,
}

impl ObserverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn CallObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Run `call` through every observer and, unless cancelled, `service`
    ///
    /// # Errors
    ///
    /// Returns the first hook error. An error from `notify_before`
    /// (including `TerminateShortCircuit`) stops the chain before the
    /// service runs; observers already entered are aborted, not notified,
    /// since no response data exists. Once a response exists every entered
    /// observer gets `notify_after` even if an earlier one failed.
    pub async fn execute(
        &self,
        call: &mut Call,
        service: &dyn Service,
    ) -> Result<(), ObserverError> {
        call.default_service(service.name());
        for observer in &self.observers {
            observer.alter_request(call).await?;
        }
        call.request_mut().freeze();

        let mut entered = Unwind::new(call);
        for observer in &self.observers {
            if let Err(e) = observer.notify_before(call).await {
                entered.abort().await;
                return Err(e);
            }
            entered.push(Arc::clone(observer));
        }

        if call.is_cancelled() {
            debug!(
                method = %call.request().method(),
                cancellers = ?call.cancellers(),
                "Call cancelled before execution"
            );
        } else {
            let outcome = service.invoke(call.request()).await;
            let response = call.response_mut();
            let stored = match outcome {
                Ok(value) => response.set_result(value),
                Err(error) => response.set_error(error),
            };
            if let Err(e) = stored {
                entered.abort().await;
                return Err(e.into());
            }
        }

        let mut failure = None;
        while let Some(observer) = entered.last() {
            let outcome = observer.notify_after(call).await;
            entered.pop();
            if let Err(e) = outcome {
                warn!(observer = observer.name(), error = %e, "notify_after failed");
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            call.response_mut().freeze();
            return Err(e);
        }

        for observer in &self.observers {
            observer.alter_response(call).await?;
        }
        call.response_mut().freeze();

        Ok(())
    }

    /// Shutdown: replay pending refreshes as terminating calls, then terminate every observer
    ///
    /// Short-circuits during replay are expected and swallowed; other
    /// failures are logged so one bad refresh never blocks the drain.
    pub async fn terminate(&self, service: &dyn Service) -> Result<(), ObserverError> {
        let mut refreshes = Vec::new();
        for observer in &self.observers {
            refreshes.extend(observer.pending_refreshes(service.name()).await);
        }

        for request in refreshes {
            let method = request.method().to_string();
            let mut call = Call::new(request)
                .with_service(service.name())
                .terminating();
            match self.execute(&mut call, service).await {
                Ok(()) => debug!(method = %method, "Grace refresh completed"),
                Err(e) if e.is_short_circuit() => {
                    debug!(method = %method, "Grace refresh not needed");
                }
                Err(e) => warn!(method = %method, error = %e, "Grace refresh failed"),
            }
        }

        for observer in &self.observers {
            observer.terminate().await?;
        }
        Ok(())
    }
}

/// Observers entered by one call that still owe it an unwind
struct Unwind {
    root: CallId,
    call: CallId,
    observers: Vec<Arc<dyn CallObserver>>,
}

impl Unwind {
    fn new(call: &Call) -> Self {
        Self {
            root: call.root(),
            call: call.id(),
            observers: Vec::new(),
        }
    }

    fn push(&mut self, observer: Arc<dyn CallObserver>) {
        self.observers.push(observer);
    }

    fn last(&self) -> Option<Arc<dyn CallObserver>> {
        self.observers.last().cloned()
    }

    fn pop(&mut self) {
        self.observers.pop();
    }

    async fn abort(&mut self) {
        while let Some(observer) = self.observers.pop() {
            observer.abort(self.root, self.call).await;
        }
    }
}

impl Drop for Unwind {
    fn drop(&mut self) {
        if self.observers.is_empty() {
            return;
        }
        let observers = std::mem::take(&mut self.observers);
        let (root, call) = (self.root, self.call);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(
                    call = %call,
                    observers = observers.len(),
                    "Call dropped mid-flight, aborting observers"
                );
                handle.spawn(async move {
                    for observer in observers.iter().rev() {
                        observer.abort(root, call).await;
                    }
                });
            }
            Err(_) => warn!(call = %call, "Call dropped outside a runtime; observers not unwound"),
        }
    }
}
