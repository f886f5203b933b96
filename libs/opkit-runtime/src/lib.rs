//! Function execution core for OpKit modules.
//!
//! A function is defined once ([`FunctionDef`]: schemas, error slots,
//! retrieve capabilities, providers, guards, middlewares, body), registered
//! on a [`Module`], and wrapped at build time into a deployed
//! [`FunctionImplementation`]. Per invocation the pipeline is:
//!
//! 1. decode the input against the function's input schema;
//! 2. decode the retrieve against the synthesized retrieve type;
//! 3. bound the selection depth;
//! 4. resolve guards, then providers, as a memoized dependency DAG
//!    (each body runs at most once per request, first failure aborts);
//! 5. run the middleware chain — user middlewares, then the policy check,
//!    then the output check innermost — around the body.
//!
//! Conditions a function opts into ([`function::error_slots`]) come back as
//! typed [`Outcome::Fail`] values; everything else escalates as an
//! [`InvocationError`] for the transport to map to a 5xx-equivalent.
//! Build-time misconfiguration is a [`BuildError`]: the module never starts.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod error;
pub mod function;
pub mod middleware;
pub mod module;
pub mod provider;

pub use error::{BadInputSource, BuildError, InvocationError};
pub use function::{
    ContextValue, FunctionArgs, FunctionBody, FunctionDef, FunctionFailure, FunctionMeta,
    InvocationInfo, Outcome, bad_input_error_type, error_slots, policy_violation_error_type,
};
pub use middleware::{Middleware, Next, OutputCheckMode};
pub use module::{FunctionImplementation, Module, ModuleOptions, ModuleRuntime};
pub use provider::{Guard, Provider, ProviderArgs, RESERVED_NAMES, is_reserved_name};
