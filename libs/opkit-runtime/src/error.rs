use opkit_policy::PolicyViolation;
use opkit_schema::DecodeError;

/// Module build failure. Always fatal: a module that fails these checks
/// never starts.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Two functions registered under the same name.
    #[error("duplicate function name `{name}`")]
    DuplicateFunction {
        /// The colliding name.
        name: String,
    },

    /// Two distinct named types share a name across the module's function
    /// schemas.
    #[error("duplicate type name `{name}` across function schemas")]
    DuplicateTypeName {
        /// The colliding name.
        name: String,
    },

    /// A provider or guard uses a name reserved for invocation metadata.
    #[error("`{name}` is a reserved provider name")]
    ReservedProviderName {
        /// The offending name.
        name: String,
    },

    /// The provider dependency graph is not a DAG.
    #[error("provider dependency cycle involving `{name}`")]
    ProviderCycle {
        /// A provider on the cycle.
        name: String,
    },

    /// A function declares retrieve capabilities but its output does not
    /// unwrap to an entity.
    #[error("function `{function}` declares retrieve capabilities but its output is not an entity")]
    RetrieveUnsupported {
        /// The offending function.
        function: String,
    },
}

/// Which of the two decoded request parts failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BadInputSource {
    /// The function input.
    Input,
    /// The retrieve request.
    Retrieve,
}

impl BadInputSource {
    /// Wire name used in the conventional `badInput` error payload.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Retrieve => "retrieve",
        }
    }
}

/// Invocation failure outside the typed-error channel.
///
/// Everything here is the "thrown" half of the error taxonomy: transports
/// map these to a generic 5xx-equivalent. Conditions a function opts into
/// handling (bad input, policy violations) only surface here when the
/// function does not declare the corresponding error slot.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// No function with this name exists in the module.
    #[error("unknown function `{name}`")]
    UnknownFunction {
        /// The requested name.
        name: String,
    },

    /// A retrieve was supplied to a function that declares no retrieve
    /// capabilities.
    #[error("function `{function}` does not accept a retrieve")]
    RetrieveNotAccepted {
        /// The invoked function.
        function: String,
    },

    /// Input or retrieve failed decoding and the function declares no
    /// `badInput` error slot.
    #[error("bad {} for function `{function}`: {source}", .part.as_str())]
    BadInput {
        /// The invoked function.
        function: String,
        /// Which request part failed.
        part: BadInputSource,
        /// The decode failure.
        source: DecodeError,
    },

    /// The requested selection nests deeper than the function allows.
    #[error("selection depth {depth} exceeds the limit of {limit}")]
    SelectionTooDeep {
        /// Requested depth.
        depth: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Policy check failed and the function declares no `policyViolation`
    /// error slot.
    #[error("unhandled policy violation: {0}")]
    PolicyViolation(#[from] PolicyViolation),

    /// The body's result does not match the requested selection and the
    /// module runs strict output checks.
    #[error("output does not match the requested selection: {0}")]
    OutputMismatch(DecodeError),

    /// An internal invariant broke mid-invocation. Transports treat this as
    /// fatal; it is never part of the typed-error channel.
    #[error("internal error: {message}")]
    Internal {
        /// What broke.
        message: String,
    },
}
