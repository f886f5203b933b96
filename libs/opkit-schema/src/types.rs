use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::caps::EntityCapabilities;

/// Field names starting with this prefix are reserved for computed fields
/// (e.g. `_count`) and never participate in where/orderBy synthesis.
pub const RESERVED_FIELD_PREFIX: char = '_';

/// Returns `true` if the field name is reserved for framework use.
#[must_use]
pub fn is_reserved_field(name: &str) -> bool {
    name.starts_with(RESERVED_FIELD_PREFIX)
}

/// A node in a possibly cyclic schema graph.
///
/// `Type` is a cheap-clone handle (`Arc` inside). Cycles are expressed with
/// deferred nodes: either a thunk evaluated on first use ([`Type::defer`]) or
/// an explicit placeholder bound after construction ([`Type::placeholder`] +
/// [`Type::bind`]). Every algorithm that recurses over a schema graph must
/// first call [`Type::concretise`] and key its memoization on
/// [`Type::node_id`].
#[derive(Clone)]
pub struct Type {
    inner: Arc<TypeInner>,
}

enum TypeInner {
    Scalar(ScalarType),
    Optional(Type),
    Nullable(Type),
    Array(Type),
    Object(ObjectType),
    Entity(EntityType),
    Union(UnionType),
    Deferred(DeferredType),
}

/// Scalar kinds. The core needs no advanced scalars (dates, decimals, ...);
/// those remain the concern of richer schema layers.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarType {
    /// UTF-8 string.
    String,
    /// Bounded integer with an optional decode default.
    Integer(IntegerType),
    /// Any JSON number.
    Number,
    /// Boolean.
    Boolean,
    /// Exactly one JSON value (used for enum-like unions).
    Literal(Value),
}

/// Integer constraints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntegerType {
    /// Inclusive lower bound.
    pub minimum: Option<i64>,
    /// Inclusive upper bound.
    pub maximum: Option<i64>,
    /// Value substituted when the enclosing object field is absent.
    pub default: Option<i64>,
}

/// A named or anonymous field map without identity.
#[derive(Clone, Debug)]
pub struct ObjectType {
    name: Option<String>,
    fields: BTreeMap<String, Type>,
}

impl ObjectType {
    /// Optional type name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The field map.
    #[inline]
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Type> {
        &self.fields
    }
}

/// A named field map with identity. Entities are the only legal retrieve
/// roots and the only policy subjects.
#[derive(Clone, Debug)]
pub struct EntityType {
    name: String,
    fields: BTreeMap<String, Type>,
    capabilities: EntityCapabilities,
}

impl EntityType {
    /// The entity name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The field map.
    #[inline]
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Type> {
        &self.fields
    }

    /// The entity's declared retrieve capabilities.
    #[inline]
    #[must_use]
    pub fn capabilities(&self) -> &EntityCapabilities {
        &self.capabilities
    }
}

/// A named-variant union. Decoding tries variants in declaration order.
#[derive(Clone, Debug)]
pub struct UnionType {
    name: Option<String>,
    variants: Vec<(String, Type)>,
}

impl UnionType {
    /// Optional type name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The variants in declaration order.
    #[inline]
    #[must_use]
    pub fn variants(&self) -> &[(String, Type)] {
        &self.variants
    }
}

type Thunk = Box<dyn Fn() -> Type + Send + Sync>;

struct DeferredType {
    name: Option<String>,
    cell: OnceLock<Type>,
    thunk: Option<Thunk>,
}

impl fmt::Debug for DeferredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredType")
            .field("name", &self.name)
            .field("resolved", &self.cell.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Stable identity of a concrete schema node.
///
/// Two handles share a `NodeId` iff they concretise to the same node; this is
/// the memoization key for every recursive derivation over a schema graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Borrowed kind-matching view over a concrete node.
#[derive(Clone, Copy, Debug)]
pub enum TypeView<'a> {
    /// Scalar leaf.
    Scalar(&'a ScalarType),
    /// May be absent (object-field level).
    Optional(&'a Type),
    /// May be explicitly `null`.
    Nullable(&'a Type),
    /// Homogeneous list.
    Array(&'a Type),
    /// Identity-free field map.
    Object(&'a ObjectType),
    /// Field map with identity.
    Entity(&'a EntityType),
    /// Untagged union of named variants.
    Union(&'a UnionType),
}

impl Type {
    fn new(inner: TypeInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    // ── Constructors ────────────────────────────────────────────────

    /// String scalar.
    #[must_use]
    pub fn string() -> Self {
        Self::new(TypeInner::Scalar(ScalarType::String))
    }

    /// Unbounded integer scalar.
    #[must_use]
    pub fn integer() -> Self {
        Self::new(TypeInner::Scalar(ScalarType::Integer(IntegerType::default())))
    }

    /// Integer scalar with explicit constraints.
    #[must_use]
    pub fn integer_with(constraints: IntegerType) -> Self {
        Self::new(TypeInner::Scalar(ScalarType::Integer(constraints)))
    }

    /// Number scalar.
    #[must_use]
    pub fn number() -> Self {
        Self::new(TypeInner::Scalar(ScalarType::Number))
    }

    /// Boolean scalar.
    #[must_use]
    pub fn boolean() -> Self {
        Self::new(TypeInner::Scalar(ScalarType::Boolean))
    }

    /// Literal scalar matching exactly one JSON value.
    #[must_use]
    pub fn literal(value: Value) -> Self {
        Self::new(TypeInner::Scalar(ScalarType::Literal(value)))
    }

    /// Optional wrapper: the enclosing object field may be absent.
    #[must_use]
    pub fn optional(inner: Self) -> Self {
        Self::new(TypeInner::Optional(inner))
    }

    /// Nullable wrapper: the value may be an explicit `null`.
    #[must_use]
    pub fn nullable(inner: Self) -> Self {
        Self::new(TypeInner::Nullable(inner))
    }

    /// Array wrapper.
    #[must_use]
    pub fn array(inner: Self) -> Self {
        Self::new(TypeInner::Array(inner))
    }

    /// Named object type.
    #[must_use]
    pub fn object(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (impl Into<String>, Self)>,
    ) -> Self {
        Self::new(TypeInner::Object(ObjectType {
            name: Some(name.into()),
            fields: collect_fields(fields),
        }))
    }

    /// Anonymous object type.
    #[must_use]
    pub fn anonymous_object(fields: impl IntoIterator<Item = (impl Into<String>, Self)>) -> Self {
        Self::new(TypeInner::Object(ObjectType {
            name: None,
            fields: collect_fields(fields),
        }))
    }

    /// Entity with default (empty) capabilities.
    #[must_use]
    pub fn entity(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (impl Into<String>, Self)>,
    ) -> Self {
        Self::entity_with(name, fields, EntityCapabilities::default())
    }

    /// Entity with explicit retrieve capability declarations.
    #[must_use]
    pub fn entity_with(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (impl Into<String>, Self)>,
        capabilities: EntityCapabilities,
    ) -> Self {
        Self::new(TypeInner::Entity(EntityType {
            name: name.into(),
            fields: collect_fields(fields),
            capabilities,
        }))
    }

    /// Named union of variants, tried in declaration order at decode time.
    #[must_use]
    pub fn union(
        name: Option<&str>,
        variants: impl IntoIterator<Item = (impl Into<String>, Self)>,
    ) -> Self {
        Self::new(TypeInner::Union(UnionType {
            name: name.map(ToOwned::to_owned),
            variants: variants
                .into_iter()
                .map(|(n, t)| (n.into(), t))
                .collect(),
        }))
    }

    /// Lazily evaluated reference, for user-declared recursive schemas.
    ///
    /// The thunk must return a stable handle (clone of a shared `Type`), not
    /// rebuild the graph: node identity is what terminates recursive
    /// derivations.
    #[must_use]
    pub fn defer(thunk: impl Fn() -> Self + Send + Sync + 'static) -> Self {
        Self::new(TypeInner::Deferred(DeferredType {
            name: None,
            cell: OnceLock::new(),
            thunk: Some(Box::new(thunk)),
        }))
    }

    /// Unbound placeholder, for knot-tying when deriving recursive types.
    ///
    /// Must be bound with [`Type::bind`] before any decode/traversal touches
    /// it.
    #[must_use]
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::new(TypeInner::Deferred(DeferredType {
            name: Some(name.into()),
            cell: OnceLock::new(),
            thunk: None,
        }))
    }

    /// Bind a placeholder to its final type.
    ///
    /// # Panics
    ///
    /// Panics if `self` is not a placeholder or is already bound — both are
    /// programmer errors in derivation code.
    pub fn bind(&self, target: Self) {
        let TypeInner::Deferred(d) = &*self.inner else {
            panic!("bind() on a non-placeholder type");
        };
        assert!(
            d.thunk.is_none() && d.cell.set(target).is_ok(),
            "bind() target must be an unbound placeholder"
        );
    }

    // ── Graph access ────────────────────────────────────────────────

    /// Resolve deferred nodes to the underlying concrete node.
    ///
    /// Thunks are forced once and cached; chains of deferred nodes are
    /// followed to the end.
    ///
    /// # Panics
    ///
    /// Panics on an unbound placeholder (derivation bug).
    #[must_use]
    pub fn concretise(&self) -> Self {
        let mut current = self.clone();
        loop {
            let next = match &*current.inner {
                TypeInner::Deferred(d) => d
                    .cell
                    .get_or_init(|| {
                        let thunk = d
                            .thunk
                            .as_ref()
                            .unwrap_or_else(|| panic!("unbound placeholder {:?}", d.name));
                        thunk()
                    })
                    .clone(),
                _ => return current,
            };
            current = next;
        }
    }

    /// Kind-matching view. Must be called on a concrete handle.
    ///
    /// # Panics
    ///
    /// Panics on a deferred node; call [`Type::concretise`] first.
    #[must_use]
    pub fn view(&self) -> TypeView<'_> {
        match &*self.inner {
            TypeInner::Scalar(s) => TypeView::Scalar(s),
            TypeInner::Optional(t) => TypeView::Optional(t),
            TypeInner::Nullable(t) => TypeView::Nullable(t),
            TypeInner::Array(t) => TypeView::Array(t),
            TypeInner::Object(o) => TypeView::Object(o),
            TypeInner::Entity(e) => TypeView::Entity(e),
            TypeInner::Union(u) => TypeView::Union(u),
            TypeInner::Deferred(_) => panic!("view() on a deferred type; concretise first"),
        }
    }

    /// Stable identity of the concrete node behind this handle.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        let concrete = self.concretise();
        NodeId(Arc::as_ptr(&concrete.inner) as usize)
    }

    /// Returns `true` if both handles concretise to the same node.
    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        self.node_id() == other.node_id()
    }

    /// Strip `Optional`/`Nullable`/`Array` wrappers down to the first
    /// non-wrapper node.
    #[must_use]
    pub fn unwrapped(&self) -> Self {
        let mut current = self.concretise();
        loop {
            let next = match &*current.inner {
                TypeInner::Optional(t) | TypeInner::Nullable(t) | TypeInner::Array(t) => {
                    t.concretise()
                }
                _ => return current,
            };
            current = next;
        }
    }

    /// Returns `true` if the unwrapped type is an entity.
    #[must_use]
    pub fn is_entity(&self) -> bool {
        matches!(&*self.unwrapped().inner, TypeInner::Entity(_))
    }

    /// The declared name of the concrete node, if any.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        let concrete = self.concretise();
        match &*concrete.inner {
            TypeInner::Object(o) => o.name.clone(),
            TypeInner::Entity(e) => Some(e.name.clone()),
            TypeInner::Union(u) => u.name.clone(),
            TypeInner::Scalar(_)
            | TypeInner::Optional(_)
            | TypeInner::Nullable(_)
            | TypeInner::Array(_)
            | TypeInner::Deferred(_) => None,
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            TypeInner::Scalar(s) => write!(f, "Scalar({s:?})"),
            TypeInner::Optional(t) => write!(f, "Optional({t:?})"),
            TypeInner::Nullable(t) => write!(f, "Nullable({t:?})"),
            TypeInner::Array(t) => write!(f, "Array({t:?})"),
            TypeInner::Object(o) => match o.name() {
                Some(name) => write!(f, "Object({name})"),
                None => write!(f, "Object({} fields)", o.fields.len()),
            },
            TypeInner::Entity(e) => write!(f, "Entity({})", e.name),
            TypeInner::Union(u) => match u.name() {
                Some(name) => write!(f, "Union({name})"),
                None => write!(f, "Union({} variants)", u.variants.len()),
            },
            TypeInner::Deferred(d) => write!(f, "Deferred({:?})", d.name),
        }
    }
}

fn collect_fields(
    fields: impl IntoIterator<Item = (impl Into<String>, Type)>,
) -> BTreeMap<String, Type> {
    fields.into_iter().map(|(n, t)| (n.into(), t)).collect()
}

/// Cycle-safe traversal of every reachable concrete node, parents first.
///
/// Each node is visited exactly once; revisits through cycles are skipped.
pub fn walk(ty: &Type, f: &mut impl FnMut(&Type)) {
    let mut visited = std::collections::HashSet::new();
    walk_inner(ty, f, &mut visited);
}

fn walk_inner(
    ty: &Type,
    f: &mut impl FnMut(&Type),
    visited: &mut std::collections::HashSet<NodeId>,
) {
    let concrete = ty.concretise();
    if !visited.insert(concrete.node_id()) {
        return;
    }
    f(&concrete);
    match concrete.view() {
        TypeView::Scalar(_) => {}
        TypeView::Optional(t) | TypeView::Nullable(t) | TypeView::Array(t) => {
            walk_inner(t, f, visited);
        }
        TypeView::Object(o) => {
            for field in o.fields().values() {
                walk_inner(field, f, visited);
            }
        }
        TypeView::Entity(e) => {
            for field in e.fields().values() {
                walk_inner(field, f, visited);
            }
        }
        TypeView::Union(u) => {
            for (_, variant) in u.variants() {
                walk_inner(variant, f, visited);
            }
        }
    }
}
