use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use opkit_schema::{Type, TypeView};

use crate::value::{
    FieldPredicate, OrderByEntry, OrderByTree, Retrieve, Selection, SelectionEntry, WhereTree,
};

/// Dot-notation address of a field reachable through a select tree,
/// rendered as `$.posts.author.name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SelectionPath(Vec<String>);

impl SelectionPath {
    /// The root path `$`.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Extend with one field segment.
    #[must_use]
    pub fn child(&self, field: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(field.into());
        Self(segments)
    }

    /// Returns `true` if `self` is a (non-strict) prefix of `other` — i.e.
    /// selecting `self` covers the subtree `other` lives in.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for SelectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for segment in &self.0 {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

impl serde::Serialize for SelectionPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Flatten a select tree into the set of dot-paths it touches.
///
/// Recursion stops at entity boundaries unless the selection explicitly
/// continues into them; embedded objects recurse transparently.
#[must_use]
pub fn selection_to_paths(ty: &Type, selection: &Selection) -> BTreeSet<SelectionPath> {
    let mut out = BTreeSet::new();
    collect_paths(ty, selection, &SelectionPath::root(), &mut out);
    out
}

fn collect_paths(
    ty: &Type,
    selection: &Selection,
    prefix: &SelectionPath,
    out: &mut BTreeSet<SelectionPath>,
) {
    let Some(fields) = fields_of(ty) else {
        return;
    };
    for (name, entry) in selection.selected() {
        let Some(field_ty) = fields.get(name) else {
            continue;
        };
        let path = prefix.child(name.clone());
        match entry {
            SelectionEntry::Flag(_) => {
                out.insert(path);
            }
            SelectionEntry::Nested(nested) => match &nested.select {
                Some(sub) if !sub.is_empty() => {
                    collect_paths(&field_ty.unwrapped(), sub, &path, out);
                }
                _ => {
                    out.insert(path);
                }
            },
        }
    }
}

/// Check that every requested path is covered by some allowed path.
///
/// Returns the uncovered (forbidden) paths; an empty vector means the
/// requested selection is included in the allowed one.
#[must_use]
pub fn selection_excess(
    requested: &BTreeSet<SelectionPath>,
    allowed: &BTreeSet<SelectionPath>,
) -> Vec<SelectionPath> {
    requested
        .iter()
        .filter(|r| !allowed.iter().any(|a| a.covers(r)))
        .cloned()
        .collect()
}

/// Returns `true` if `requested` is a subset of `allowed` under subtree
/// coverage.
#[must_use]
pub fn is_selection_included(
    requested: &BTreeSet<SelectionPath>,
    allowed: &BTreeSet<SelectionPath>,
) -> bool {
    selection_excess(requested, allowed).is_empty()
}

/// Rewrite a `where` tree into the selection of fields it touches: you
/// cannot filter on a field you haven't implicitly read.
#[must_use]
pub fn where_to_selection(filter: &WhereTree) -> Selection {
    let mut selection = Selection::default();
    for (name, predicate) in &filter.fields {
        let entry = match predicate {
            FieldPredicate::Scalar(_) => SelectionEntry::Flag(true),
            FieldPredicate::Entity(nested) => SelectionEntry::nested(where_to_selection(nested)),
            FieldPredicate::Quantified(quantified) => {
                let mut merged = Selection::default();
                for branch in quantified.branches() {
                    merged = union_selections(&merged, &where_to_selection(branch));
                }
                SelectionEntry::nested(merged)
            }
        };
        insert_union(&mut selection, name.clone(), entry);
    }
    for group in [&filter.and, &filter.or, &filter.not] {
        if let Some(group) = group {
            for nested in group {
                selection = union_selections(&selection, &where_to_selection(nested));
            }
        }
    }
    selection
}

/// Rewrite `orderBy` trees into the selection of fields they touch.
#[must_use]
pub fn order_by_to_selection<'a>(trees: impl IntoIterator<Item = &'a OrderByTree>) -> Selection {
    let mut selection = Selection::default();
    for tree in trees {
        selection = union_selections(&selection, &order_by_tree_selection(tree));
    }
    selection
}

fn order_by_tree_selection(tree: &OrderByTree) -> Selection {
    let mut selection = Selection::default();
    for (name, entry) in &tree.0 {
        let entry = match entry {
            OrderByEntry::Direction(_) => SelectionEntry::Flag(true),
            OrderByEntry::Nested(nested) => {
                // `{_count: ...}` orders by collection size: the relation is
                // touched, but no sub-field is.
                let without_count: BTreeMap<_, _> = nested
                    .0
                    .iter()
                    .filter(|(key, _)| key.as_str() != "_count")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if without_count.is_empty() {
                    SelectionEntry::Flag(true)
                } else {
                    SelectionEntry::nested(order_by_tree_selection(&OrderByTree(without_count)))
                }
            }
        };
        insert_union(&mut selection, name.clone(), entry);
    }
    selection
}

/// Expand a retrieve's selection with everything its `where`/`orderBy`
/// reference, so visibility checks see filtered/sorted fields as read.
#[must_use]
pub fn visible_selection(retrieve: &Retrieve) -> Selection {
    let mut selection = retrieve.select.clone().unwrap_or_default();
    if let Some(filter) = &retrieve.filter {
        selection = union_selections(&selection, &where_to_selection(filter));
    }
    if let Some(order_by) = &retrieve.order_by {
        selection = union_selections(&selection, &order_by_to_selection(order_by.iter()));
    }
    selection
}

/// Type-free union of two selections (used where both sides were derived
/// from the same schema, so entries for one field never disagree in kind).
#[must_use]
pub fn union_selections(left: &Selection, right: &Selection) -> Selection {
    let mut out = left.0.clone();
    for (name, entry) in &right.0 {
        insert_union_owned(&mut out, name.clone(), entry.clone());
    }
    Selection(out)
}

fn insert_union(selection: &mut Selection, name: String, entry: SelectionEntry) {
    insert_union_owned(&mut selection.0, name, entry);
}

fn insert_union_owned(
    map: &mut BTreeMap<String, SelectionEntry>,
    name: String,
    entry: SelectionEntry,
) {
    match map.remove(&name) {
        None => {
            map.insert(name, entry);
        }
        Some(existing) => {
            let merged = match (existing, entry) {
                (SelectionEntry::Flag(false), other) | (other, SelectionEntry::Flag(false)) => {
                    other
                }
                (SelectionEntry::Nested(l), SelectionEntry::Nested(r)) => {
                    let select = match (&l.select, &r.select) {
                        (Some(a), Some(b)) => Some(union_selections(a, b)),
                        (a, b) => a.clone().or_else(|| b.clone()),
                    };
                    SelectionEntry::Nested(Box::new(Retrieve {
                        select,
                        ..*l
                    }))
                }
                (nested @ SelectionEntry::Nested(_), SelectionEntry::Flag(true))
                | (SelectionEntry::Flag(true), nested @ SelectionEntry::Nested(_)) => nested,
                (SelectionEntry::Flag(true), SelectionEntry::Flag(true)) => {
                    SelectionEntry::Flag(true)
                }
            };
            map.insert(name, merged);
        }
    }
}

fn fields_of(ty: &Type) -> Option<BTreeMap<String, Type>> {
    let inner = ty.unwrapped();
    match inner.view() {
        TypeView::Entity(e) => Some(e.fields().clone()),
        TypeView::Object(o) => Some(o.fields().clone()),
        _ => None,
    }
}
