use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use opkit_retrieve::{FunctionCapabilities, Retrieve};
use opkit_schema::Type;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::InvocationError;
use crate::middleware::Middleware;
use crate::provider::{Guard, Provider};

/// Conventional error-slot names a function opts into by declaring them.
pub mod error_slots {
    /// Input or retrieve failed decoding.
    pub const BAD_INPUT: &str = "badInput";
    /// The policy engine rejected the retrieve.
    pub const POLICY_VIOLATION: &str = "policyViolation";
}

/// The error type conventionally declared under
/// [`error_slots::BAD_INPUT`]: `{message: string, from: "input"|"retrieve"}`.
#[must_use]
pub fn bad_input_error_type() -> Type {
    Type::object(
        "BadInputError",
        [("message", Type::string()), ("from", Type::string())],
    )
}

/// The error type conventionally declared under
/// [`error_slots::POLICY_VIOLATION`]: the serialized
/// [`opkit_policy::PolicyViolation`] shape.
#[must_use]
pub fn policy_violation_error_type() -> Type {
    Type::object(
        "PolicyViolationError",
        [
            ("path", Type::string()),
            (
                "policies",
                Type::array(Type::anonymous_object([
                    ("label", Type::optional(Type::string())),
                    ("outcome", Type::string()),
                    ("forbidden", Type::optional(Type::array(Type::string()))),
                ])),
            ),
        ],
    )
}

/// Per-invocation metadata threaded through providers, guards and
/// middlewares.
#[derive(Clone, Debug)]
pub struct InvocationInfo {
    /// Name of the invoked function.
    pub function: String,
    /// Unique id of this invocation, for correlation in logs.
    pub operation_id: Uuid,
}

/// A resolved context value, produced by a provider.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Fully resolved arguments handed to middlewares and the body.
#[derive(Clone)]
pub struct FunctionArgs {
    /// Decoded, canonical input.
    pub input: Value,
    /// Decoded retrieve request, if the function accepts one.
    pub retrieve: Option<Retrieve>,
    /// Provider outputs by provider name.
    pub context: BTreeMap<String, ContextValue>,
    /// Invocation metadata.
    pub info: InvocationInfo,
}

impl FunctionArgs {
    /// Downcast a provider output to its concrete type.
    #[must_use]
    pub fn context_value<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.context
            .get(name)
            .and_then(|value| value.clone().downcast::<T>().ok())
    }
}

impl fmt::Debug for FunctionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionArgs")
            .field("input", &self.input)
            .field("retrieve", &self.retrieve)
            .field("context", &self.context.keys())
            .field("info", &self.info)
            .finish()
    }
}

/// A typed, declared failure: one of the function's error slots with its
/// payload.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionFailure {
    /// The declared error slot.
    pub error: String,
    /// The error payload.
    pub value: Value,
}

impl FunctionFailure {
    /// Build a failure for a declared error slot.
    #[must_use]
    pub fn new(error: impl Into<String>, value: Value) -> Self {
        Self {
            error: error.into(),
            value,
        }
    }
}

/// Terminal result of a function invocation's typed channel.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Success, carrying the (selection-trimmed) value.
    Ok(Value),
    /// A declared, typed failure.
    Fail(FunctionFailure),
}

impl Outcome {
    /// Success outcome.
    #[must_use]
    pub fn ok(value: Value) -> Self {
        Self::Ok(value)
    }

    /// Typed failure outcome.
    #[must_use]
    pub fn fail(error: impl Into<String>, value: Value) -> Self {
        Self::Fail(FunctionFailure::new(error, value))
    }

    /// Returns `true` for [`Outcome::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// The wire response shape consumed by transport adapters:
    /// `{isOk: true, value}` or `{isOk: false, error: {slot: payload}}`.
    #[must_use]
    pub fn to_response(&self) -> Value {
        match self {
            Self::Ok(value) => json!({"isOk": true, "value": value}),
            Self::Fail(failure) => {
                let mut error = serde_json::Map::new();
                error.insert(failure.error.clone(), failure.value.clone());
                json!({"isOk": false, "error": error})
            }
        }
    }
}

/// The function body: async, takes the fully resolved arguments, returns the
/// typed outcome (or escalates with an [`InvocationError`]).
pub type FunctionBody = Arc<
    dyn Fn(FunctionArgs) -> BoxFuture<'static, Result<Outcome, InvocationError>> + Send + Sync,
>;

/// Static description of a function, visible to middlewares.
#[derive(Clone, Debug)]
pub struct FunctionMeta {
    /// Function name (unique within the module).
    pub name: String,
    /// Input schema.
    pub input: Type,
    /// Output schema.
    pub output: Type,
    /// Declared error slots.
    pub errors: BTreeMap<String, Type>,
    /// Retrieve capabilities, if the function accepts a retrieve.
    pub capabilities: Option<FunctionCapabilities>,
}

impl FunctionMeta {
    /// Returns `true` if the function declares the given error slot.
    #[must_use]
    pub fn declares_error(&self, slot: &str) -> bool {
        self.errors.contains_key(slot)
    }
}

/// A function definition, assembled with the builder API and registered on
/// a module.
///
/// Defined once at module-build time; the module wraps it (immutably) with
/// the default middlewares into a deployed
/// [`crate::module::FunctionImplementation`].
#[derive(Clone)]
pub struct FunctionDef {
    pub(crate) input: Type,
    pub(crate) output: Type,
    pub(crate) errors: BTreeMap<String, Type>,
    pub(crate) capabilities: Option<FunctionCapabilities>,
    pub(crate) providers: BTreeMap<String, Arc<Provider>>,
    pub(crate) guards: BTreeMap<String, Arc<Guard>>,
    pub(crate) middlewares: Vec<Arc<dyn Middleware>>,
    pub(crate) body: FunctionBody,
    pub(crate) max_selection_depth: Option<usize>,
}

impl FunctionDef {
    /// Start a definition from its schemas and body.
    #[must_use]
    pub fn new(
        input: Type,
        output: Type,
        body: impl Fn(FunctionArgs) -> BoxFuture<'static, Result<Outcome, InvocationError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            input,
            output,
            errors: BTreeMap::new(),
            capabilities: None,
            providers: BTreeMap::new(),
            guards: BTreeMap::new(),
            middlewares: Vec::new(),
            body: Arc::new(body),
            max_selection_depth: None,
        }
    }

    /// Declare a typed error slot.
    #[must_use]
    pub fn error(mut self, slot: impl Into<String>, ty: Type) -> Self {
        self.errors.insert(slot.into(), ty);
        self
    }

    /// Declare the retrieve capabilities callers may use.
    #[must_use]
    pub fn retrieve(mut self, capabilities: FunctionCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Register a context provider under a name.
    #[must_use]
    pub fn provider(mut self, provider: Arc<Provider>) -> Self {
        self.providers.insert(provider.name().to_owned(), provider);
        self
    }

    /// Register a guard.
    #[must_use]
    pub fn guard(mut self, guard: Arc<Guard>) -> Self {
        self.guards.insert(guard.name().to_owned(), guard);
        self
    }

    /// Append a user middleware. User middlewares run after the depth
    /// check and before the policy and output checks.
    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Override the module-wide maximum selection depth.
    #[must_use]
    pub fn max_selection_depth(mut self, depth: usize) -> Self {
        self.max_selection_depth = Some(depth);
        self
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("errors", &self.errors.keys())
            .field("capabilities", &self.capabilities)
            .field("providers", &self.providers.keys())
            .field("guards", &self.guards.keys())
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}
