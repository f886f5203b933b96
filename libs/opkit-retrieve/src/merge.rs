use std::collections::BTreeMap;

use opkit_schema::{Type, TypeView};

use crate::value::{OneOrMany, Retrieve, Selection, SelectionEntry, WhereTree};

/// Which side's scalar value wins when both are present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SidePreference {
    /// Left operand wins.
    #[default]
    Left,
    /// Right operand wins.
    Right,
}

/// Concatenation order for `orderBy` entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderByPrecedence {
    /// Left operand's criteria sort first.
    #[default]
    LeftBeforeRight,
    /// Right operand's criteria sort first.
    RightBeforeLeft,
}

/// Tie-break options for [`merge`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// `orderBy` concatenation order.
    pub order_by: OrderByPrecedence,
    /// `take` preference.
    pub take: SidePreference,
    /// `skip` preference.
    pub skip: SidePreference,
}

/// Combine two retrieves over the same type.
///
/// `where` composes as `{AND: [left, right]}` when both sides carry one;
/// `orderBy` concatenates per [`MergeOptions::order_by`]; `take`/`skip`
/// follow the side preference with the other side as fallback; `select` is a
/// field-wise union where a `true` entity selection is promoted to its
/// default sub-selection before recursing, so sub-entity selections always
/// merge as retrieves rather than booleans.
#[must_use]
pub fn merge(ty: &Type, left: &Retrieve, right: &Retrieve, options: &MergeOptions) -> Retrieve {
    let filter = match (&left.filter, &right.filter) {
        (Some(l), Some(r)) => Some(WhereTree::all_of(vec![l.clone(), r.clone()])),
        (l, r) => l.clone().or_else(|| r.clone()),
    };

    let order_by = match (&left.order_by, &right.order_by) {
        (Some(l), Some(r)) => {
            let (first, second) = match options.order_by {
                OrderByPrecedence::LeftBeforeRight => (l, r),
                OrderByPrecedence::RightBeforeLeft => (r, l),
            };
            Some(OneOrMany(
                first.iter().chain(second.iter()).cloned().collect(),
            ))
        }
        (l, r) => l.clone().or_else(|| r.clone()),
    };

    let take = pick(left.take, right.take, options.take);
    let skip = pick(left.skip, right.skip, options.skip);

    let select = match (&left.select, &right.select) {
        (Some(l), Some(r)) => Some(merge_selections(ty, l, r, options)),
        (l, r) => l.clone().or_else(|| r.clone()),
    };

    Retrieve {
        select,
        filter,
        order_by,
        take,
        skip,
    }
}

fn pick(left: Option<u64>, right: Option<u64>, preference: SidePreference) -> Option<u64> {
    match preference {
        SidePreference::Left => left.or(right),
        SidePreference::Right => right.or(left),
    }
}

/// Field-wise union of two selections over the same type.
#[must_use]
pub fn merge_selections(
    ty: &Type,
    left: &Selection,
    right: &Selection,
    options: &MergeOptions,
) -> Selection {
    let fields = fields_of(ty);
    let mut out = BTreeMap::new();
    for key in left.0.keys().chain(right.0.keys()) {
        if out.contains_key(key) {
            continue;
        }
        let entry = match (left.0.get(key), right.0.get(key)) {
            (Some(l), Some(r)) => merge_entries(fields.as_ref().and_then(|f| f.get(key)), l, r, options),
            (Some(e), None) | (None, Some(e)) => e.clone(),
            (None, None) => continue,
        };
        out.insert(key.clone(), entry);
    }
    Selection(out)
}

fn merge_entries(
    field_ty: Option<&Type>,
    left: &SelectionEntry,
    right: &SelectionEntry,
    options: &MergeOptions,
) -> SelectionEntry {
    match (left, right) {
        (SelectionEntry::Flag(false), other) | (other, SelectionEntry::Flag(false)) => {
            other.clone()
        }
        (SelectionEntry::Flag(true), SelectionEntry::Flag(true)) => SelectionEntry::Flag(true),
        (SelectionEntry::Flag(true), SelectionEntry::Nested(nested))
        | (SelectionEntry::Nested(nested), SelectionEntry::Flag(true)) => {
            match field_ty.map(Type::unwrapped) {
                Some(inner) if matches!(inner.view(), TypeView::Entity(_)) => {
                    // Promote `true` to the default sub-selection so the two
                    // sides merge as retrieves.
                    let promoted = Retrieve::selecting(default_selection(&inner));
                    SelectionEntry::Nested(Box::new(merge(&inner, &promoted, nested, options)))
                }
                // Wholesale object selection covers anything the nested side
                // could add.
                _ => SelectionEntry::Flag(true),
            }
        }
        (SelectionEntry::Nested(l), SelectionEntry::Nested(r)) => {
            let sub_ty = match field_ty {
                Some(ty) => ty.unwrapped(),
                None => Type::anonymous_object(Vec::<(String, Type)>::new()),
            };
            SelectionEntry::Nested(Box::new(merge(&sub_ty, l, r, options)))
        }
    }
}

/// The default selection of a type: every non-entity field selected `true`,
/// entity fields left out.
#[must_use]
pub fn default_selection(ty: &Type) -> Selection {
    let Some(fields) = fields_of(ty) else {
        return Selection::default();
    };
    Selection(
        fields
            .iter()
            .filter(|(_, fty)| !fty.is_entity())
            .map(|(name, _)| (name.clone(), SelectionEntry::Flag(true)))
            .collect(),
    )
}

fn fields_of(ty: &Type) -> Option<BTreeMap<String, Type>> {
    let inner = ty.unwrapped();
    match inner.view() {
        TypeView::Entity(e) => Some(e.fields().clone()),
        TypeView::Object(o) => Some(o.fields().clone()),
        _ => None,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::value::FieldPredicate;
    use serde_json::json;
    use std::sync::LazyLock;

    static USER: LazyLock<Type> = LazyLock::new(|| {
        Type::entity(
            "User",
            [
                ("id", Type::string()),
                ("name", Type::string()),
                ("posts", Type::array(Type::defer(|| POST.clone()))),
            ],
        )
    });

    static POST: LazyLock<Type> = LazyLock::new(|| {
        Type::entity(
            "Post",
            [
                ("title", Type::string()),
                ("content", Type::string()),
                ("author", Type::defer(|| USER.clone())),
            ],
        )
    });

    fn r(value: serde_json::Value) -> Retrieve {
        Retrieve::from_value(&value).unwrap()
    }

    #[test]
    fn wheres_combine_under_and() {
        let left = r(json!({"where": {"id": {"equals": "a"}}}));
        let right = r(json!({"where": {"name": {"equals": "b"}}}));
        let merged = merge(&USER, &left, &right, &MergeOptions::default());
        let and = merged.filter.unwrap().and.unwrap();
        assert_eq!(and.0.len(), 2);
    }

    #[test]
    fn single_where_passes_through() {
        let left = r(json!({"where": {"id": {"equals": "a"}}}));
        let merged = merge(&USER, &left, &Retrieve::default(), &MergeOptions::default());
        assert!(matches!(
            merged.filter.unwrap().fields["id"],
            FieldPredicate::Scalar(_)
        ));
    }

    #[test]
    fn order_by_concatenates_with_precedence() {
        let left = r(json!({"orderBy": [{"name": "asc"}]}));
        let right = r(json!({"orderBy": [{"id": "desc"}]}));

        let merged = merge(&USER, &left, &right, &MergeOptions::default());
        let order_by = merged.order_by.unwrap();
        assert!(order_by.0[0].0.contains_key("name"));

        let merged = merge(
            &USER,
            &left,
            &right,
            &MergeOptions {
                order_by: OrderByPrecedence::RightBeforeLeft,
                ..MergeOptions::default()
            },
        );
        assert!(merged.order_by.unwrap().0[0].0.contains_key("id"));
    }

    #[test]
    fn take_left_wins_by_default() {
        let left = r(json!({"take": 5}));
        let right = r(json!({"take": 10}));
        assert_eq!(
            merge(&USER, &left, &right, &MergeOptions::default()).take,
            Some(5)
        );
        assert_eq!(
            merge(
                &USER,
                &left,
                &right,
                &MergeOptions {
                    take: SidePreference::Right,
                    ..MergeOptions::default()
                }
            )
            .take,
            Some(10)
        );
        assert_eq!(
            merge(&USER, &Retrieve::default(), &right, &MergeOptions::default()).take,
            Some(10)
        );
    }

    #[test]
    fn select_union_is_field_wise() {
        let left = r(json!({"select": {"id": true}}));
        let right = r(json!({"select": {"name": true}}));
        let merged = merge(&USER, &left, &right, &MergeOptions::default());
        let select = merged.select.unwrap();
        assert!(select.is_selected("id"));
        assert!(select.is_selected("name"));
    }

    #[test]
    fn true_entity_selection_promotes_before_merging() {
        let left = r(json!({"select": {"posts": true}}));
        let right = r(json!({"select": {"posts": {"select": {"title": true}, "take": 3}}}));
        let merged = merge(&USER, &left, &right, &MergeOptions::default());

        let SelectionEntry::Nested(nested) = &merged.select.unwrap().0["posts"] else {
            panic!("expected nested entry after promotion");
        };
        let select = nested.select.as_ref().unwrap();
        // Default (non-entity) fields from the promoted side...
        assert!(select.is_selected("title"));
        assert!(select.is_selected("content"));
        assert!(!select.is_selected("author"));
        // ...and the rich side's take survives.
        assert_eq!(nested.take, Some(3));
    }

    #[test]
    fn select_union_is_commutative_on_paths() {
        let a = r(json!({"select": {"posts": true, "id": true}}));
        let b = r(json!({"select": {"posts": {"select": {"title": true}}}}));
        let ab = merge(&USER, &a, &b, &MergeOptions::default());
        let ba = merge(&USER, &b, &a, &MergeOptions::default());
        let paths_ab =
            crate::paths::selection_to_paths(&USER, ab.select.as_ref().unwrap());
        let paths_ba =
            crate::paths::selection_to_paths(&USER, ba.select.as_ref().unwrap());
        assert_eq!(paths_ab, paths_ba);
    }

    #[test]
    fn merge_is_associative_on_path_coverage() {
        let a = r(json!({"select": {"id": true, "posts": {"select": {"title": true}}}}));
        let b = r(json!({"select": {"posts": true}}));
        let c = r(json!({"select": {"name": true, "posts": {"select": {"author": true}}}}));
        let opts = MergeOptions::default();

        let left = merge(&USER, &merge(&USER, &a, &b, &opts), &c, &opts);
        let right = merge(&USER, &a, &merge(&USER, &b, &c, &opts), &opts);

        let paths_left =
            crate::paths::selection_to_paths(&USER, left.select.as_ref().unwrap());
        let paths_right =
            crate::paths::selection_to_paths(&USER, right.select.as_ref().unwrap());
        assert_eq!(paths_left, paths_right);
    }
}
