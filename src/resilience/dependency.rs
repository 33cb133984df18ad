//! A named downstream dependency guarded by one breaker and one retry policy.
//!
//! `call` is the composition the rest of the service uses: every attempt
//! inside `with_backoff` first takes a breaker permit, and only an admitted
//! attempt invokes the operation. [`OpenCircuitBehavior`] decides whether a
//! rejection ends the loop.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::resilience::circuit_breaker::{CircuitBreaker, Rejection};
use crate::resilience::retries::{with_backoff, OpenCircuitBehavior, RetryError, RetryPolicy};

/// Errors returned by [`ProtectedDependency::call`].
#[derive(Debug, Error)]
pub enum DependencyError<E> {
    /// The breaker refused the call and the policy did not (or could no
    /// longer) wait it out.
    #[error("{operation}: dependency unavailable after {attempts} attempt(s)")]
    CircuitOpen {
        operation: String,
        attempts: u32,
        #[source]
        rejection: Rejection,
    },

    /// Every attempt reached the dependency and failed.
    #[error("{operation} failed after {attempts} attempt(s)")]
    Failed {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The dependency returned an error the policy does not retry.
    #[error("{operation} failed with a non-retryable error")]
    Permanent {
        operation: String,
        #[source]
        source: E,
    },

    /// The caller's token fired.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

impl<E> DependencyError<E> {
    pub fn operation(&self) -> &str {
        match self {
            DependencyError::CircuitOpen { operation, .. }
            | DependencyError::Failed { operation, .. }
            | DependencyError::Permanent { operation, .. }
            | DependencyError::Cancelled { operation } => operation,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, DependencyError::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DependencyError::Cancelled { .. })
    }
}

/// What a single attempt produced, as seen by the retry loop.
#[derive(Debug)]
enum Attempt<E> {
    Failed(E),
    Rejected(Rejection),
}

/// Breaker + retry policy for one dependency.
pub struct ProtectedDependency<E> {
    name: String,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy<E>,
}

impl<E: 'static> ProtectedDependency<E> {
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy<E>) -> Self {
        Self {
            name: breaker.name().to_string(),
            breaker,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy<E> {
        &self.policy
    }

    /// Run `f` under the breaker, retrying per the policy.
    ///
    /// `f` is invoked once per admitted attempt; rejected attempts never call it.
    pub async fn call<T, F, Fut>(
        &self,
        ctx: &CancellationToken,
        mut f: F,
    ) -> Result<T, DependencyError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let inner = self.policy.retryable_fn();
        let keep_retrying = self.policy.on_open_circuit == OpenCircuitBehavior::KeepRetrying;
        let policy = self.policy.map_retryable(move |attempt: &Attempt<E>| match attempt {
            Attempt::Failed(e) => inner(e),
            Attempt::Rejected(_) => keep_retrying,
        });

        let breaker: &CircuitBreaker = &self.breaker;
        let result = with_backoff(ctx, &policy, &self.name, move || {
            // `f` runs only once a permit is held.
            let admitted = breaker.try_acquire().map(|permit| (permit, f()));
            async move {
                let (permit, fut) = match admitted {
                    Ok(admitted) => admitted,
                    Err(rejection) => return Err(Attempt::Rejected(rejection)),
                };
                match fut.await {
                    Ok(value) => {
                        permit.success();
                        Ok(value)
                    }
                    Err(e) => {
                        permit.failure();
                        Err(Attempt::Failed(e))
                    }
                }
            }
        })
        .await;

        result.map_err(|err| self.classify(err))
    }

    fn classify(&self, err: RetryError<Attempt<E>>) -> DependencyError<E> {
        let operation = self.name.clone();
        match err {
            RetryError::Cancelled { .. } => DependencyError::Cancelled { operation },
            RetryError::Exhausted {
                attempts, source, ..
            } => match source {
                Attempt::Failed(source) => DependencyError::Failed {
                    operation,
                    attempts,
                    source,
                },
                Attempt::Rejected(rejection) => DependencyError::CircuitOpen {
                    operation,
                    attempts,
                    rejection,
                },
            },
            RetryError::Permanent {
                attempts, source, ..
            } => match source {
                Attempt::Failed(source) => DependencyError::Permanent { operation, source },
                Attempt::Rejected(rejection) => {
                    tracing::debug!(operation = %operation, attempts, "Circuit open, not retrying");
                    DependencyError::CircuitOpen {
                        operation,
                        attempts,
                        rejection,
                    }
                }
            },
        }
    }
}

impl<E> std::fmt::Debug for ProtectedDependency<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedDependency")
            .field("name", &self.name)
            .field("breaker", &self.breaker)
            .field("policy", &self.policy)
            .finish()
    }
}
