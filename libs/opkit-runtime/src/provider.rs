use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use opkit_retrieve::Retrieve;
use serde_json::Value;

use crate::function::{ContextValue, FunctionFailure, InvocationInfo};

/// Names reserved for invocation metadata; providers and guards may not use
/// them. Checked once at module build, never per request.
pub const RESERVED_NAMES: [&str; 4] = ["input", "retrieve", "logger", "tracer"];

/// Returns `true` if the name collides with invocation metadata.
#[must_use]
pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Arguments handed to a provider or guard body: the decoded request plus
/// the already-resolved dependency values.
#[derive(Clone)]
pub struct ProviderArgs {
    /// Decoded function input.
    pub input: Value,
    /// Decoded retrieve request, if any.
    pub retrieve: Option<Retrieve>,
    /// Resolved dependency outputs, by provider name.
    pub dependencies: BTreeMap<String, ContextValue>,
    /// Invocation metadata.
    pub info: InvocationInfo,
}

impl ProviderArgs {
    /// Downcast a dependency output to its concrete type.
    #[must_use]
    pub fn dependency<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.dependencies
            .get(name)
            .and_then(|value| value.clone().downcast::<T>().ok())
    }
}

type ProviderFn =
    Arc<dyn Fn(ProviderArgs) -> BoxFuture<'static, Result<ContextValue, FunctionFailure>> + Send + Sync>;

type GuardFn =
    Arc<dyn Fn(ProviderArgs) -> BoxFuture<'static, Result<(), FunctionFailure>> + Send + Sync>;

/// A named unit of context derivation with declared dependencies.
///
/// Providers form a DAG by holding `Arc`s to their dependencies; resolution
/// is a memoized depth-first walk keyed by provider identity, so a shared
/// dependency's body runs exactly once per request no matter how many
/// providers reach it.
pub struct Provider {
    name: String,
    dependencies: Vec<Arc<Provider>>,
    body: ProviderFn,
}

impl Provider {
    /// Define a provider with no dependencies.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(ProviderArgs) -> BoxFuture<'static, Result<ContextValue, FunctionFailure>>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            dependencies: Vec::new(),
            body: Arc::new(body),
        })
    }

    /// Define a provider depending on other providers.
    #[must_use]
    pub fn with_dependencies(
        name: impl Into<String>,
        dependencies: Vec<Arc<Self>>,
        body: impl Fn(ProviderArgs) -> BoxFuture<'static, Result<ContextValue, FunctionFailure>>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            dependencies,
            body: Arc::new(body),
        })
    }

    /// The provider's name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared dependencies.
    #[inline]
    #[must_use]
    pub fn dependencies(&self) -> &[Arc<Self>] {
        &self.dependencies
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field(
                "dependencies",
                &self.dependencies.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// A named admission check with declared provider dependencies.
///
/// Guards run before providers are handed to the body; a failing guard
/// aborts the whole pipeline with its typed failure.
pub struct Guard {
    name: String,
    dependencies: Vec<Arc<Provider>>,
    body: GuardFn,
}

impl Guard {
    /// Define a guard with no dependencies.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(ProviderArgs) -> BoxFuture<'static, Result<(), FunctionFailure>>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            dependencies: Vec::new(),
            body: Arc::new(body),
        })
    }

    /// Define a guard depending on providers.
    #[must_use]
    pub fn with_dependencies(
        name: impl Into<String>,
        dependencies: Vec<Arc<Provider>>,
        body: impl Fn(ProviderArgs) -> BoxFuture<'static, Result<(), FunctionFailure>>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            dependencies,
            body: Arc::new(body),
        })
    }

    /// The guard's name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared dependencies.
    #[inline]
    #[must_use]
    pub fn dependencies(&self) -> &[Arc<Provider>] {
        &self.dependencies
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("name", &self.name)
            .field(
                "dependencies",
                &self.dependencies.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Per-request resolution cache, keyed by provider identity. Request-scoped:
/// dropped when the invocation completes, never shared across requests.
#[derive(Default)]
pub(crate) struct ResolutionCache {
    values: HashMap<usize, ContextValue>,
}

fn provider_key(provider: &Arc<Provider>) -> usize {
    Arc::as_ptr(provider) as usize
}

/// Resolve one provider depth-first, memoized: each body runs at most once
/// per request, and the first failure short-circuits the walk.
pub(crate) fn resolve_provider<'a>(
    provider: &'a Arc<Provider>,
    cache: &'a mut ResolutionCache,
    input: &'a Value,
    retrieve: Option<&'a Retrieve>,
    info: &'a InvocationInfo,
) -> BoxFuture<'a, Result<ContextValue, FunctionFailure>> {
    Box::pin(async move {
        if let Some(value) = cache.values.get(&provider_key(provider)) {
            return Ok(value.clone());
        }
        let mut dependencies = BTreeMap::new();
        for dependency in provider.dependencies() {
            let value = resolve_provider(dependency, &mut *cache, input, retrieve, info).await?;
            dependencies.insert(dependency.name().to_owned(), value);
        }
        let args = ProviderArgs {
            input: input.clone(),
            retrieve: retrieve.cloned(),
            dependencies,
            info: info.clone(),
        };
        tracing::debug!(provider = %provider.name(), "resolving provider");
        let value = (provider.body)(args).await?;
        cache.values.insert(provider_key(provider), value.clone());
        Ok(value)
    })
}

/// Resolve a guard's dependencies (through the shared cache) and run it.
pub(crate) async fn run_guard(
    guard: &Guard,
    cache: &mut ResolutionCache,
    input: &Value,
    retrieve: Option<&Retrieve>,
    info: &InvocationInfo,
) -> Result<(), FunctionFailure> {
    let mut dependencies = BTreeMap::new();
    for dependency in guard.dependencies() {
        let value = resolve_provider(dependency, &mut *cache, input, retrieve, info).await?;
        dependencies.insert(dependency.name().to_owned(), value);
    }
    let args = ProviderArgs {
        input: input.clone(),
        retrieve: retrieve.cloned(),
        dependencies,
        info: info.clone(),
    };
    tracing::debug!(guard = %guard.name(), "running guard");
    (guard.body)(args).await
}

/// Detect cycles in the provider graph reachable from `roots`.
///
/// Returns the name of a provider on a cycle, or `None` for a proper DAG.
#[must_use]
pub(crate) fn find_cycle(roots: impl Iterator<Item = Arc<Provider>>) -> Option<String> {
    let mut finished: HashSet<usize> = HashSet::new();
    let mut in_stack: HashSet<usize> = HashSet::new();
    for root in roots {
        if let Some(name) = visit(&root, &mut finished, &mut in_stack) {
            return Some(name);
        }
    }
    None
}

fn visit(
    provider: &Arc<Provider>,
    finished: &mut HashSet<usize>,
    in_stack: &mut HashSet<usize>,
) -> Option<String> {
    let key = provider_key(provider);
    if finished.contains(&key) {
        return None;
    }
    if !in_stack.insert(key) {
        return Some(provider.name().to_owned());
    }
    for dependency in provider.dependencies() {
        if let Some(name) = visit(dependency, finished, in_stack) {
            return Some(name);
        }
    }
    in_stack.remove(&key);
    finished.insert(key);
    None
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn info() -> InvocationInfo {
        InvocationInfo {
            function: "test".to_owned(),
            operation_id: Uuid::new_v4(),
        }
    }

    fn counting_provider(name: &str, counter: Arc<AtomicUsize>) -> Arc<Provider> {
        Provider::new(name, move |_args| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(42u64) as ContextValue)
            })
        })
    }

    #[tokio::test]
    async fn shared_dependency_resolves_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let base = counting_provider("base", counter.clone());
        let left = Provider::with_dependencies("left", vec![base.clone()], |args| {
            Box::pin(async move {
                let base: Arc<u64> = args.dependency("base").unwrap();
                Ok(Arc::new(*base + 1) as ContextValue)
            })
        });
        let right = Provider::with_dependencies("right", vec![base.clone()], |args| {
            Box::pin(async move {
                let base: Arc<u64> = args.dependency("base").unwrap();
                Ok(Arc::new(*base + 2) as ContextValue)
            })
        });

        let mut cache = ResolutionCache::default();
        let input = json!({});
        let meta = info();
        let l = resolve_provider(&left, &mut cache, &input, None, &meta)
            .await
            .unwrap();
        let r = resolve_provider(&right, &mut cache, &input, None, &meta)
            .await
            .unwrap();

        assert_eq!(*l.downcast::<u64>().unwrap(), 43);
        assert_eq!(*r.downcast::<u64>().unwrap(), 44);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_dependency_short_circuits() {
        let failing = Provider::new("auth", |_args| {
            Box::pin(async move {
                Err(FunctionFailure::new("unauthorized", json!({"reason": "no token"})))
            })
        });
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_inner = ran.clone();
        let dependent = Provider::with_dependencies("db", vec![failing], move |_args| {
            let ran = ran_inner.clone();
            Box::pin(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(()) as ContextValue)
            })
        });

        let mut cache = ResolutionCache::default();
        let input = json!({});
        let meta = info();
        let err = resolve_provider(&dependent, &mut cache, &input, None, &meta)
            .await
            .unwrap_err();
        assert_eq!(err.error, "unauthorized");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn guard_sees_resolved_dependencies() {
        let counter = Arc::new(AtomicUsize::new(0));
        let base = counting_provider("base", counter.clone());
        let guard = Guard::with_dependencies("gate", vec![base.clone()], |args| {
            Box::pin(async move {
                let base: Arc<u64> = args.dependency("base").unwrap();
                if *base == 42 {
                    Ok(())
                } else {
                    Err(FunctionFailure::new("denied", json!({})))
                }
            })
        });

        let mut cache = ResolutionCache::default();
        let input = json!({});
        let meta = info();
        run_guard(&guard, &mut cache, &input, None, &meta)
            .await
            .unwrap();
        // The guard's dependency is memoized for later provider resolution.
        resolve_provider(&base, &mut cache, &input, None, &meta)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reserved_names_are_flagged() {
        assert!(is_reserved_name("input"));
        assert!(is_reserved_name("tracer"));
        assert!(!is_reserved_name("db"));
    }

    #[test]
    fn cycle_detection() {
        // Cycles cannot be built through the public constructors (Arc
        // dependencies are acquired before the dependent exists), so a
        // self-referential graph is the degenerate check here: a diamond
        // must NOT be reported as a cycle.
        let counter = Arc::new(AtomicUsize::new(0));
        let base = counting_provider("base", counter.clone());
        let left = Provider::with_dependencies("left", vec![base.clone()], |_args| {
            Box::pin(async move { Ok(Arc::new(()) as ContextValue) })
        });
        let right = Provider::with_dependencies("right", vec![base], |_args| {
            Box::pin(async move { Ok(Arc::new(()) as ContextValue) })
        });
        let top = Provider::with_dependencies("top", vec![left, right], |_args| {
            Box::pin(async move { Ok(Arc::new(()) as ContextValue) })
        });
        assert!(find_cycle([top].into_iter()).is_none());
    }
}
