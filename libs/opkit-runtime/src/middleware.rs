use std::sync::Arc;

use async_trait::async_trait;
use opkit_policy::{Policies, check_policies};
use opkit_retrieve::{FunctionCapabilities, selected_type};
use opkit_schema::{DecodeOptions, Type, decode};
use serde_json::json;

use crate::error::InvocationError;
use crate::function::{FunctionArgs, FunctionBody, FunctionMeta, Outcome, error_slots};

/// One link of the invocation chain.
///
/// A middleware may rewrite the arguments before calling [`Next::run`],
/// observe or replace the result after, or short-circuit without calling it
/// at all. The chain is an explicit ordered list walked by index — no
/// nested closure composition.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &str;

    /// Run this link.
    ///
    /// # Errors
    ///
    /// Escalates an [`InvocationError`] out of the typed-failure channel;
    /// transports map it to a 5xx-equivalent.
    async fn apply(
        &self,
        args: FunctionArgs,
        next: Next<'_>,
        function: &FunctionMeta,
    ) -> Result<Outcome, InvocationError>;
}

/// Continuation into the rest of the chain (and finally the body).
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    index: usize,
    body: &'a FunctionBody,
    function: &'a FunctionMeta,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn Middleware>],
        body: &'a FunctionBody,
        function: &'a FunctionMeta,
    ) -> Self {
        Self {
            chain,
            index: 0,
            body,
            function,
        }
    }

    /// Run the remainder of the chain with the given arguments.
    ///
    /// # Errors
    ///
    /// Propagates whatever the downstream links or the body escalate.
    pub async fn run(self, args: FunctionArgs) -> Result<Outcome, InvocationError> {
        match self.chain.get(self.index) {
            Some(middleware) => {
                let next = Self {
                    chain: self.chain,
                    index: self.index + 1,
                    body: self.body,
                    function: self.function,
                };
                middleware.apply(args, next, self.function).await
            }
            None => (self.body)(args).await,
        }
    }
}

/// Default middleware: authorize (and augment) the retrieve against the
/// module's policies.
///
/// On violation, functions declaring the
/// [`error_slots::POLICY_VIOLATION`] slot fail typed; all others escalate.
pub struct PolicyCheck {
    output: Type,
    policies: Policies,
    capabilities: FunctionCapabilities,
}

impl PolicyCheck {
    pub(crate) fn new(
        output: Type,
        policies: Policies,
        capabilities: FunctionCapabilities,
    ) -> Arc<Self> {
        Arc::new(Self {
            output,
            policies,
            capabilities,
        })
    }
}

#[async_trait]
impl Middleware for PolicyCheck {
    fn name(&self) -> &str {
        "policy-check"
    }

    async fn apply(
        &self,
        mut args: FunctionArgs,
        next: Next<'_>,
        function: &FunctionMeta,
    ) -> Result<Outcome, InvocationError> {
        match check_policies(
            &self.output,
            args.retrieve.as_ref(),
            &self.policies,
            &self.capabilities,
        ) {
            Ok(effective) => {
                args.retrieve = effective;
                next.run(args).await
            }
            Err(violation) => {
                tracing::debug!(function = %function.name, %violation, "retrieve rejected by policy");
                if function.declares_error(error_slots::POLICY_VIOLATION) {
                    let message = violation.to_string();
                    let payload = serde_json::to_value(&violation)
                        .unwrap_or_else(|_| json!({"message": message}));
                    Ok(Outcome::fail(error_slots::POLICY_VIOLATION, payload))
                } else {
                    Err(InvocationError::PolicyViolation(violation))
                }
            }
        }
    }
}

/// How the output check reacts to a mismatching body result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputCheckMode {
    /// Escalate an [`InvocationError::OutputMismatch`].
    #[default]
    Strict,
    /// Log and pass the value through unchanged (best-effort production
    /// mode).
    LogOnly,
}

/// Default middleware, innermost: decode the body's result against the
/// projection of the output type onto the requested selection.
///
/// The body may return more than was requested — the excess is trimmed, not
/// rejected — but missing required fields are a contract violation handled
/// per [`OutputCheckMode`].
pub struct OutputCheck {
    output: Type,
    mode: OutputCheckMode,
}

impl OutputCheck {
    pub(crate) fn new(output: Type, mode: OutputCheckMode) -> Arc<Self> {
        Arc::new(Self { output, mode })
    }
}

#[async_trait]
impl Middleware for OutputCheck {
    fn name(&self) -> &str {
        "output-check"
    }

    async fn apply(
        &self,
        args: FunctionArgs,
        next: Next<'_>,
        function: &FunctionMeta,
    ) -> Result<Outcome, InvocationError> {
        let retrieve = args.retrieve.clone();
        let outcome = next.run(args).await?;
        let Outcome::Ok(value) = outcome else {
            return Ok(outcome);
        };
        let projected = selected_type(&self.output, retrieve.as_ref());
        match decode(&projected, &value, &DecodeOptions::stripping()) {
            Ok(trimmed) => Ok(Outcome::Ok(trimmed)),
            Err(error) => match self.mode {
                OutputCheckMode::Strict => Err(InvocationError::OutputMismatch(error)),
                OutputCheckMode::LogOnly => {
                    tracing::warn!(
                        function = %function.name,
                        %error,
                        "function output does not match the requested selection",
                    );
                    Ok(Outcome::Ok(value))
                }
            },
        }
    }
}
