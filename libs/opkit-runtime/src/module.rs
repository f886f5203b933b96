use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use opkit_policy::Policies;
use opkit_retrieve::{Retrieve, Synthesizer, selection_depth};
use opkit_schema::{DecodeError, DecodeOptions, NodeId, Type, decode, walk};
use serde_json::{Value, json};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{BadInputSource, BuildError, InvocationError};
use crate::function::{
    FunctionArgs, FunctionBody, FunctionDef, FunctionMeta, InvocationInfo, Outcome, error_slots,
};
use crate::middleware::{Middleware, Next, OutputCheck, OutputCheckMode, PolicyCheck};
use crate::provider::{
    Guard, Provider, ResolutionCache, find_cycle, is_reserved_name, resolve_provider, run_guard,
};

/// Module-wide execution options.
#[derive(Clone, Copy, Debug)]
pub struct ModuleOptions {
    /// Maximum entity-to-entity selection depth accepted per request, unless
    /// a function overrides it.
    pub max_selection_depth: usize,
    /// Output check behavior. Strict by default; relax to
    /// [`OutputCheckMode::LogOnly`] for best-effort production serving.
    pub output_check: OutputCheckMode,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            max_selection_depth: 3,
            output_check: OutputCheckMode::Strict,
        }
    }
}

/// A set of functions deployed together with shared policies and options.
///
/// Assembled with the builder API, then [`Module::build`] runs the
/// build-time assertions and wraps every function with the default
/// middlewares into a [`ModuleRuntime`]. A module that fails to build never
/// serves a request.
#[derive(Debug, Default)]
pub struct Module {
    name: String,
    functions: Vec<(String, FunctionDef)>,
    policies: Policies,
    options: ModuleOptions,
}

impl Module {
    /// Start an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            policies: Policies::new(),
            options: ModuleOptions::default(),
        }
    }

    /// Register a function under a name.
    #[must_use]
    pub fn function(mut self, name: impl Into<String>, def: FunctionDef) -> Self {
        self.functions.push((name.into(), def));
        self
    }

    /// Attach the module's access policies.
    #[must_use]
    pub fn policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    /// Override the execution options.
    #[must_use]
    pub fn options(mut self, options: ModuleOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the module and wrap its functions for deployment.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] on duplicate function names, duplicate type
    /// names across the function schemas, reserved provider/guard names,
    /// provider dependency cycles, or retrieve capabilities declared on a
    /// non-entity output. All of these are programmer errors; the module
    /// must not start.
    pub fn build(self) -> Result<ModuleRuntime, BuildError> {
        let mut seen_names: HashMap<String, NodeId> = HashMap::new();
        let mut synthesizer = Synthesizer::new();
        let mut functions: BTreeMap<String, Arc<FunctionImplementation>> = BTreeMap::new();

        for (name, def) in self.functions {
            if functions.contains_key(&name) {
                return Err(BuildError::DuplicateFunction { name });
            }

            validate_units(&def)?;
            validate_type_names(&def, &mut seen_names)?;

            let retrieve_type = match &def.capabilities {
                None => None,
                Some(caps) => match synthesizer.retrieve_type(&def.output, caps) {
                    Some(ty) => Some(ty),
                    None => return Err(BuildError::RetrieveUnsupported { function: name }),
                },
            };

            let meta = FunctionMeta {
                name: name.clone(),
                input: def.input.clone(),
                output: def.output.clone(),
                errors: def.errors.clone(),
                capabilities: def.capabilities.clone(),
            };

            // Default middlewares wrap the user's in a fixed order: the
            // policy check runs after them, the output check innermost.
            let mut chain: Vec<Arc<dyn Middleware>> = def.middlewares.clone();
            chain.push(PolicyCheck::new(
                def.output.clone(),
                self.policies.clone(),
                def.capabilities.clone().unwrap_or_default(),
            ));
            chain.push(OutputCheck::new(def.output.clone(), self.options.output_check));

            let implementation = FunctionImplementation {
                meta,
                retrieve_type,
                providers: def.providers,
                guards: def.guards,
                chain,
                body: def.body,
                max_depth: def
                    .max_selection_depth
                    .unwrap_or(self.options.max_selection_depth),
            };
            functions.insert(name, Arc::new(implementation));
        }

        Ok(ModuleRuntime {
            name: self.name,
            functions,
        })
    }
}

fn validate_units(def: &FunctionDef) -> Result<(), BuildError> {
    let mut all_providers: Vec<Arc<Provider>> = def.providers.values().cloned().collect();
    for guard in def.guards.values() {
        if is_reserved_name(guard.name()) {
            return Err(BuildError::ReservedProviderName {
                name: guard.name().to_owned(),
            });
        }
        all_providers.extend(guard.dependencies().iter().cloned());
    }
    // Reserved names apply to the whole reachable graph, not just the
    // directly registered providers.
    let mut stack = all_providers.clone();
    let mut visited = std::collections::HashSet::new();
    while let Some(provider) = stack.pop() {
        if !visited.insert(Arc::as_ptr(&provider) as usize) {
            continue;
        }
        if is_reserved_name(provider.name()) {
            return Err(BuildError::ReservedProviderName {
                name: provider.name().to_owned(),
            });
        }
        stack.extend(provider.dependencies().iter().cloned());
    }
    if let Some(name) = find_cycle(all_providers.into_iter()) {
        return Err(BuildError::ProviderCycle { name });
    }
    Ok(())
}

fn validate_type_names(
    def: &FunctionDef,
    seen: &mut HashMap<String, NodeId>,
) -> Result<(), BuildError> {
    let mut conflict: Option<String> = None;
    let schemas = [&def.input, &def.output]
        .into_iter()
        .chain(def.errors.values());
    for schema in schemas {
        walk(schema, &mut |node: &Type| {
            let Some(name) = node.name() else {
                return;
            };
            let id = node.node_id();
            match seen.get(&name) {
                Some(existing) if *existing != id => {
                    conflict.get_or_insert(name);
                }
                Some(_) => {}
                None => {
                    seen.insert(name, id);
                }
            }
        });
    }
    match conflict {
        Some(name) => Err(BuildError::DuplicateTypeName { name }),
        None => Ok(()),
    }
}

/// A deployed module: the entrypoint transport adapters call per request.
#[derive(Debug)]
pub struct ModuleRuntime {
    name: String,
    functions: BTreeMap<String, Arc<FunctionImplementation>>,
}

impl ModuleRuntime {
    /// The module's name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a deployed function.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Arc<FunctionImplementation>> {
        self.functions.get(name)
    }

    /// Invoke a function by name with raw (undecoded) input and retrieve.
    ///
    /// # Errors
    ///
    /// [`InvocationError::UnknownFunction`] for unregistered names;
    /// otherwise whatever the function's pipeline escalates.
    pub async fn apply(
        &self,
        function: &str,
        input: &Value,
        retrieve: Option<&Value>,
    ) -> Result<Outcome, InvocationError> {
        let Some(implementation) = self.functions.get(function) else {
            return Err(InvocationError::UnknownFunction {
                name: function.to_owned(),
            });
        };
        implementation.apply(input, retrieve).await
    }
}

/// A function wrapped for deployment: schemas, synthesized retrieve type,
/// providers, guards and the complete middleware chain.
///
/// Stateless across invocations; all per-request state (the provider
/// resolution cache, the effective retrieve) lives on the invocation's own
/// stack.
pub struct FunctionImplementation {
    meta: FunctionMeta,
    retrieve_type: Option<Type>,
    providers: BTreeMap<String, Arc<Provider>>,
    guards: BTreeMap<String, Arc<Guard>>,
    chain: Vec<Arc<dyn Middleware>>,
    body: FunctionBody,
    max_depth: usize,
}

impl FunctionImplementation {
    /// Static metadata (schemas, error slots, capabilities).
    #[inline]
    #[must_use]
    pub fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    /// The synthesized retrieve type, for transports generating schemas.
    #[inline]
    #[must_use]
    pub fn retrieve_type(&self) -> Option<&Type> {
        self.retrieve_type.as_ref()
    }

    /// Execute one invocation: decode, depth-check, resolve guards and
    /// providers, then run the middleware chain around the body.
    ///
    /// # Errors
    ///
    /// See [`InvocationError`]; conditions the function declares error slots
    /// for come back as [`Outcome::Fail`] instead.
    #[instrument(skip(self, input, retrieve), fields(function = %self.meta.name))]
    pub async fn apply(
        &self,
        input: &Value,
        retrieve: Option<&Value>,
    ) -> Result<Outcome, InvocationError> {
        let input = match decode(&self.meta.input, input, &DecodeOptions::strict()) {
            Ok(value) => value,
            Err(error) => return self.bad_request(BadInputSource::Input, error),
        };

        let retrieve = match (&self.retrieve_type, retrieve) {
            (_, None) => None,
            (None, Some(_)) => {
                return Err(InvocationError::RetrieveNotAccepted {
                    function: self.meta.name.clone(),
                });
            }
            (Some(retrieve_ty), Some(raw)) => {
                match decode(retrieve_ty, raw, &DecodeOptions::strict()) {
                    Err(error) => return self.bad_request(BadInputSource::Retrieve, error),
                    Ok(canonical) => Some(Retrieve::from_value(&canonical).map_err(|e| {
                        InvocationError::Internal {
                            message: format!("decoded retrieve failed conversion: {e}"),
                        }
                    })?),
                }
            }
        };

        // Bound adversarially deep selections before any real work happens:
        // providers, policies and the body never see such a request.
        if let Some(retrieve) = &retrieve {
            let depth = selection_depth(&self.meta.output, retrieve);
            if depth > self.max_depth {
                tracing::debug!(depth, limit = self.max_depth, "selection too deep");
                return Err(InvocationError::SelectionTooDeep {
                    depth,
                    limit: self.max_depth,
                });
            }
        }

        let info = InvocationInfo {
            function: self.meta.name.clone(),
            operation_id: Uuid::new_v4(),
        };

        let mut cache = ResolutionCache::default();
        for guard in self.guards.values() {
            if let Err(failure) = run_guard(guard, &mut cache, &input, retrieve.as_ref(), &info).await
            {
                tracing::debug!(guard = %guard.name(), error = %failure.error, "guard rejected invocation");
                return Ok(Outcome::Fail(failure));
            }
        }
        let mut context = BTreeMap::new();
        for (name, provider) in &self.providers {
            match resolve_provider(provider, &mut cache, &input, retrieve.as_ref(), &info).await {
                Ok(value) => {
                    context.insert(name.clone(), value);
                }
                Err(failure) => {
                    tracing::debug!(provider = %name, error = %failure.error, "provider failed");
                    return Ok(Outcome::Fail(failure));
                }
            }
        }

        let args = FunctionArgs {
            input,
            retrieve,
            context,
            info,
        };
        Next::new(&self.chain, &self.body, &self.meta).run(args).await
    }

    fn bad_request(
        &self,
        part: BadInputSource,
        error: DecodeError,
    ) -> Result<Outcome, InvocationError> {
        if self.meta.declares_error(error_slots::BAD_INPUT) {
            Ok(Outcome::fail(
                error_slots::BAD_INPUT,
                json!({"message": error.to_string(), "from": part.as_str()}),
            ))
        } else {
            Err(InvocationError::BadInput {
                function: self.meta.name.clone(),
                part,
                source: error,
            })
        }
    }
}

impl std::fmt::Debug for FunctionImplementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionImplementation")
            .field("name", &self.meta.name)
            .field("max_depth", &self.max_depth)
            .field("middlewares", &self.chain.len())
            .finish_non_exhaustive()
    }
}
