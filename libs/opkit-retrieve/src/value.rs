use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A position accepting either a single `T` or an array of `T`
/// (`AND`/`OR`/`orderBy`). Normalized to a vector internally; serialized
/// back as an array.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OneOrMany<T>(pub Vec<T>);

impl<T> OneOrMany<T> {
    /// A single-element group.
    #[must_use]
    pub fn one(value: T) -> Self {
        Self(vec![value])
    }

    /// Iterate over the normalized elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
}

impl<'a, T> IntoIterator for &'a OneOrMany<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OneOrMany<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Many(Vec<T>),
            One(T),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Many(items) => Self(items),
            Repr::One(item) => Self(vec![item]),
        })
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A retrieve request: what to fetch and how to shape it.
///
/// This is the generic runtime value; which of its parts a caller may
/// actually use is governed by the synthesized retrieve type (decode time)
/// and by the policy engine (authorization time).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Retrieve {
    /// Field selection; absent means the default (non-entity) fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Selection>,
    /// Row filter.
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<WhereTree>,
    /// Sort specification.
    #[serde(rename = "orderBy", default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OneOrMany<OrderByTree>>,
    /// Maximum number of rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take: Option<u64>,
    /// Number of rows to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
}

impl Retrieve {
    /// A retrieve carrying only a selection.
    #[must_use]
    pub fn selecting(selection: Selection) -> Self {
        Self {
            select: Some(selection),
            ..Self::default()
        }
    }

    /// Deserialize from a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error when the value does not have the
    /// retrieve shape; values decoded against a synthesized retrieve type
    /// always convert cleanly.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Serialize back to the wire shape.
    ///
    /// # Panics
    ///
    /// Never panics: every field of the retrieve model is JSON-representable.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| unreachable!("retrieve is always JSON"))
    }
}

/// A select tree: field name to `true`/`false` or a nested sub-retrieve.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selection(pub BTreeMap<String, SelectionEntry>);

impl Selection {
    /// Build from `(field, entry)` pairs.
    #[must_use]
    pub fn from_entries(
        entries: impl IntoIterator<Item = (impl Into<String>, SelectionEntry)>,
    ) -> Self {
        Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Returns `true` if the field is selected (as `true` or with a nested
    /// sub-retrieve).
    #[must_use]
    pub fn is_selected(&self, field: &str) -> bool {
        match self.0.get(field) {
            Some(SelectionEntry::Flag(flag)) => *flag,
            Some(SelectionEntry::Nested(_)) => true,
            None => false,
        }
    }

    /// Iterate over the effectively selected `(field, entry)` pairs,
    /// skipping `false` flags.
    pub fn selected(&self) -> impl Iterator<Item = (&String, &SelectionEntry)> {
        self.0
            .iter()
            .filter(|(_, entry)| !matches!(entry, SelectionEntry::Flag(false)))
    }

    /// Returns `true` if nothing is effectively selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selected().next().is_none()
    }
}

/// One select position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectionEntry {
    /// `true` selects the field wholesale (an entity field with its default
    /// non-entity sub-fields); `false` deselects.
    Flag(bool),
    /// Nested sub-retrieve for entity fields, or `{select: ...}` for
    /// embedded objects.
    Nested(Box<Retrieve>),
}

impl SelectionEntry {
    /// Shorthand for a nested `{select: ...}` entry.
    #[must_use]
    pub fn nested(selection: Selection) -> Self {
        Self::Nested(Box::new(Retrieve::selecting(selection)))
    }
}

/// A recursive filter predicate tree.
///
/// Field keys carry per-field predicates; `AND`/`OR`/`NOT` compose nested
/// trees. The synthesized where type is what restricts which fields may
/// appear here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WhereTree {
    /// Conjunction of nested filters.
    #[serde(rename = "AND", default, skip_serializing_if = "Option::is_none")]
    pub and: Option<OneOrMany<WhereTree>>,
    /// Disjunction of nested filters.
    #[serde(rename = "OR", default, skip_serializing_if = "Option::is_none")]
    pub or: Option<OneOrMany<WhereTree>>,
    /// Negated nested filters.
    #[serde(rename = "NOT", default, skip_serializing_if = "Option::is_none")]
    pub not: Option<OneOrMany<WhereTree>>,
    /// Per-field predicates.
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldPredicate>,
}

impl WhereTree {
    /// A tree with a single field predicate.
    #[must_use]
    pub fn field(name: impl Into<String>, predicate: FieldPredicate) -> Self {
        Self {
            fields: BTreeMap::from([(name.into(), predicate)]),
            ..Self::default()
        }
    }

    /// `AND` of the given trees.
    #[must_use]
    pub fn all_of(trees: Vec<Self>) -> Self {
        Self {
            and: Some(OneOrMany(trees)),
            ..Self::default()
        }
    }

    /// `OR` of the given trees.
    #[must_use]
    pub fn any_of(trees: Vec<Self>) -> Self {
        Self {
            or: Some(OneOrMany(trees)),
            ..Self::default()
        }
    }

    /// Returns `true` if the tree has no predicates and no composition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.and.is_none() && self.or.is_none() && self.not.is_none() && self.fields.is_empty()
    }

    /// Returns `true` if the tree uses `AND`/`OR`/`NOT` composition at the
    /// top level.
    #[must_use]
    pub fn has_composition(&self) -> bool {
        self.and.is_some() || self.or.is_some() || self.not.is_some()
    }
}

/// Per-field predicate inside a [`WhereTree`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldPredicate {
    /// Scalar leaf: `{equals?, in?}`.
    Scalar(ScalarPredicate),
    /// Array-of-entity field: `{some?, every?, none?}`.
    Quantified(QuantifiedPredicate),
    /// Single entity field: a nested where on that entity.
    Entity(Box<WhereTree>),
}

impl FieldPredicate {
    /// Equality predicate on a scalar field.
    #[must_use]
    pub fn equals(value: Value) -> Self {
        Self::Scalar(ScalarPredicate {
            equals: Some(value),
            r#in: None,
        })
    }

    /// Set-membership predicate on a scalar field.
    #[must_use]
    pub fn within(values: Vec<Value>) -> Self {
        Self::Scalar(ScalarPredicate {
            equals: None,
            r#in: Some(values),
        })
    }

    /// `some` quantifier on an array-of-entity field.
    #[must_use]
    pub fn some(filter: WhereTree) -> Self {
        Self::Quantified(QuantifiedPredicate {
            some: Some(Box::new(filter)),
            every: None,
            none: None,
        })
    }
}

/// Scalar leaf predicate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalarPredicate {
    /// Exact match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    /// Set membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#in: Option<Vec<Value>>,
}

/// Quantified predicate over an array-of-entity field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantifiedPredicate {
    /// At least one element matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub some: Option<Box<WhereTree>>,
    /// Every element matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<Box<WhereTree>>,
    /// No element matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub none: Option<Box<WhereTree>>,
}

impl QuantifiedPredicate {
    /// Iterate over the present quantifier branches.
    pub fn branches(&self) -> impl Iterator<Item = &WhereTree> {
        [self.some.as_deref(), self.every.as_deref(), self.none.as_deref()]
            .into_iter()
            .flatten()
    }
}

/// A per-field direction map, recursing into nested entities; `_count`
/// orders by collection size.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderByTree(pub BTreeMap<String, OrderByEntry>);

impl OrderByTree {
    /// A tree ordering a single field.
    #[must_use]
    pub fn field(name: impl Into<String>, entry: OrderByEntry) -> Self {
        Self(BTreeMap::from([(name.into(), entry)]))
    }
}

/// One orderBy position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderByEntry {
    /// Order by this field's value.
    Direction(Direction),
    /// Recurse into a nested entity (or `{_count: direction}` for arrays).
    Nested(OrderByTree),
}
