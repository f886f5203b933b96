use std::collections::BTreeMap;

use opkit_retrieve::{
    FunctionCapabilities, MergeOptions, Retrieve, Selection, SelectionEntry, SelectionPath,
    WhereTree, default_selection, merge, order_by_to_selection, selection_excess,
    selection_to_paths, union_selections, where_to_selection,
};
use opkit_schema::{Type, TypeView};

use crate::policy::{Policies, Policy, PolicySelection, Restriction};
use crate::restriction::is_within_restriction;
use crate::violation::{PolicyJudgement, PolicyOutcome, PolicyViolation};

/// Evaluate a requested retrieve against the declared policies.
///
/// Returns the *effective* retrieve: the requested one, augmented with the
/// row filters of every satisfied policy, with nested selections checked
/// recursively against their own entities' policies. Fails with a
/// [`PolicyViolation`] naming the exact forbidden paths when no policy
/// authorizes the request. Access is never widened: the returned selection
/// is a subset of the requested one.
///
/// Functions without the `select` capability (or calls without a retrieve)
/// expose no structured field-level retrieval, so policies are not
/// enforceable here and the retrieve passes through unchanged.
///
/// An entity with no declared policies denies every request that reaches
/// it — fail-closed, like every other unresolvable case in this module.
///
/// # Errors
///
/// Returns the structured [`PolicyViolation`] when no policy is satisfied
/// at some entity position of the selection.
///
/// # Panics
///
/// Panics when a satisfied policy declares a row `filter` but the function
/// lacks the `where` capability: the filter would have nowhere to go, which
/// is a module configuration bug, not a per-request condition.
pub fn check_policies(
    ty: &Type,
    retrieve: Option<&Retrieve>,
    policies: &Policies,
    caps: &FunctionCapabilities,
) -> Result<Option<Retrieve>, PolicyViolation> {
    if !caps.select {
        return Ok(retrieve.cloned());
    }
    let Some(retrieve) = retrieve else {
        return Ok(None);
    };
    let entity_ty = ty.unwrapped();
    if !matches!(entity_ty.view(), TypeView::Entity(_)) {
        return Ok(Some(retrieve.clone()));
    }
    check_at(&entity_ty, retrieve, policies, caps, &SelectionPath::root()).map(Some)
}

fn check_at(
    entity_ty: &Type,
    retrieve: &Retrieve,
    policies: &Policies,
    caps: &FunctionCapabilities,
    path: &SelectionPath,
) -> Result<Retrieve, PolicyViolation> {
    // An absent selection still reads the entity's default fields; make
    // that explicit, then expand with everything `where`/`orderBy` touch —
    // you cannot filter or sort on a field you haven't implicitly read.
    let base = Retrieve {
        select: Some(
            retrieve
                .select
                .clone()
                .unwrap_or_else(|| default_selection(entity_ty)),
        ),
        ..retrieve.clone()
    };
    let mut visibility = retrieve
        .filter
        .as_ref()
        .map(where_to_selection)
        .unwrap_or_default();
    if let Some(order_by) = &retrieve.order_by {
        visibility = union_selections(&visibility, &order_by_to_selection(order_by.iter()));
    }
    let expanded = merge(
        entity_ty,
        &base,
        &Retrieve::selecting(visibility),
        &MergeOptions::default(),
    );
    let expanded_selection = expanded.select.unwrap_or_default();
    let requested_paths = selection_to_paths(entity_ty, &expanded_selection);

    // Partition the declared policies.
    let declared = policies.for_entity(entity_ty);
    let mut satisfied: Vec<&Policy> = Vec::new();
    let mut judgements: Vec<PolicyJudgement> = Vec::new();
    for policy in declared {
        let applies = policy
            .restriction
            .as_ref()
            .is_none_or(|r| is_within_restriction(retrieve.filter.as_ref(), r));
        if !applies {
            judgements.push(PolicyJudgement {
                label: policy.label.clone(),
                outcome: PolicyOutcome::RestrictionNotMet,
            });
            continue;
        }
        match &policy.selection {
            PolicySelection::All => satisfied.push(policy),
            PolicySelection::Fields(allowed) => {
                let allowed_paths = selection_to_paths(entity_ty, allowed);
                let forbidden = selection_excess(&requested_paths, &allowed_paths);
                if forbidden.is_empty() {
                    satisfied.push(policy);
                } else {
                    judgements.push(PolicyJudgement {
                        label: policy.label.clone(),
                        outcome: PolicyOutcome::ForbiddenSelection { forbidden },
                    });
                }
            }
        }
    }

    if satisfied.is_empty() {
        tracing::warn!(path = %path, candidates = declared.len(), "no policy satisfied (fail-closed)");
        return Err(PolicyViolation {
            path: path.clone(),
            policies: judgements,
        });
    }

    // Inject the satisfied policies' row filters: access is granted only to
    // rows matching at least one of them.
    let filters: Vec<WhereTree> = satisfied
        .iter()
        .filter_map(|p| p.filter.as_ref().map(Restriction::to_where))
        .collect();
    let filter = if filters.is_empty() {
        retrieve.filter.clone()
    } else {
        assert!(
            caps.filter,
            "policy declares a row filter but the function lacks the `where` capability"
        );
        let group = flatten_or(filters);
        Some(match retrieve.filter.clone() {
            Some(existing) => WhereTree::all_of(vec![existing, group]),
            None => group,
        })
    };

    // Recurse into every entity-typed field of the expanded selection with
    // that entity's own policies; nested selections are fully capable once
    // policy-checked.
    let entity = match entity_ty.view() {
        TypeView::Entity(e) => e.clone(),
        _ => unreachable!("check_at is only called on entities"),
    };
    let mut checked_subs: BTreeMap<String, Retrieve> = BTreeMap::new();
    for (name, entry) in expanded_selection.selected() {
        let Some(field_ty) = entity.fields().get(name) else {
            continue;
        };
        let inner = field_ty.unwrapped();
        if !matches!(inner.view(), TypeView::Entity(_)) {
            continue;
        }
        let sub_retrieve = match entry {
            SelectionEntry::Nested(nested) => (**nested).clone(),
            SelectionEntry::Flag(_) => Retrieve::default(),
        };
        let checked = check_at(
            &inner,
            &sub_retrieve,
            policies,
            &FunctionCapabilities::all(),
            &path.child(name.clone()),
        )?;
        checked_subs.insert(name.clone(), checked);
    }

    // Intersect back down to the originally requested selection: the
    // visibility expansion must not leak extra fields into the authorized
    // result.
    let select = retrieve.select.as_ref().map(|original| {
        Selection(
            original
                .0
                .iter()
                .map(|(name, entry)| {
                    let entry = match checked_subs.get(name) {
                        Some(checked) => restrict_entry(checked, entry),
                        None => entry.clone(),
                    };
                    (name.clone(), entry)
                })
                .collect(),
        )
    });

    Ok(Retrieve {
        select,
        filter,
        order_by: retrieve.order_by.clone(),
        take: retrieve.take,
        skip: retrieve.skip,
    })
}

/// `OR` group with single-filter flattening, to keep emitted trees shallow.
fn flatten_or(mut filters: Vec<WhereTree>) -> WhereTree {
    if filters.len() == 1 {
        filters.remove(0)
    } else {
        WhereTree::any_of(filters)
    }
}

/// Rebuild one originally-requested selection entry from its checked
/// counterpart, keeping the original shape but carrying over injected
/// filters and nested rewrites.
fn restrict_entry(checked: &Retrieve, original: &SelectionEntry) -> SelectionEntry {
    match original {
        SelectionEntry::Flag(false) => SelectionEntry::Flag(false),
        SelectionEntry::Flag(true) => {
            if checked.filter.is_some() {
                SelectionEntry::Nested(Box::new(Retrieve {
                    filter: checked.filter.clone(),
                    ..Retrieve::default()
                }))
            } else {
                SelectionEntry::Flag(true)
            }
        }
        SelectionEntry::Nested(original) => {
            SelectionEntry::Nested(Box::new(intersect_retrieve(checked, original)))
        }
    }
}

fn intersect_retrieve(checked: &Retrieve, original: &Retrieve) -> Retrieve {
    let select = original.select.as_ref().map(|original_sel| {
        Selection(
            original_sel
                .0
                .iter()
                .map(|(name, entry)| {
                    let entry = match checked
                        .select
                        .as_ref()
                        .and_then(|checked_sel| checked_sel.0.get(name))
                    {
                        Some(SelectionEntry::Nested(checked_sub)) => {
                            restrict_entry(checked_sub, entry)
                        }
                        _ => entry.clone(),
                    };
                    (name.clone(), entry)
                })
                .collect(),
        )
    });
    Retrieve {
        select,
        filter: checked.filter.clone(),
        order_by: original.order_by.clone(),
        take: original.take,
        skip: original.skip,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use opkit_retrieve::FieldPredicate;
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

    fn selection(value: serde_json::Value) -> Selection {
        serde_json::from_value(value).unwrap()
    }

    fn name_only_policies() -> Policies {
        Policies::new()
            .on(&USER)
            .allows(Policy::selecting(selection(json!({"name": true}))).label("name-only"))
            .done()
    }

    #[test]
    fn no_select_capability_passes_through() {
        let retrieve = r(json!({"select": {"id": true}}));
        let result = check_policies(
            &USER,
            Some(&retrieve),
            &name_only_policies(),
            &FunctionCapabilities::none(),
        )
        .unwrap();
        assert_eq!(result, Some(retrieve));
    }

    #[test]
    fn no_retrieve_passes_through() {
        let result = check_policies(
            &USER,
            None,
            &name_only_policies(),
            &FunctionCapabilities::all(),
        )
        .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn forbidden_field_names_the_exact_path() {
        let retrieve = r(json!({"select": {"id": true}}));
        let violation = check_policies(
            &USER,
            Some(&retrieve),
            &name_only_policies(),
            &FunctionCapabilities::all(),
        )
        .unwrap_err();

        assert_eq!(violation.path, SelectionPath::root());
        assert_eq!(violation.policies.len(), 1);
        let PolicyOutcome::ForbiddenSelection { forbidden } = &violation.policies[0].outcome
        else {
            panic!("expected forbidden selection");
        };
        assert_eq!(forbidden, &vec![SelectionPath::root().child("id")]);
    }

    #[test]
    fn allowed_selection_returns_request_unchanged() {
        let retrieve = r(json!({"select": {"name": true}}));
        let result = check_policies(
            &USER,
            Some(&retrieve),
            &name_only_policies(),
            &FunctionCapabilities::all(),
        )
        .unwrap();
        assert_eq!(result, Some(retrieve));
    }

    #[test]
    fn satisfied_filter_is_injected_into_where() {
        let policies = Policies::new()
            .on(&POST)
            .allows(Policy::allow_all().filter(
                Restriction::new().field(
                    "author",
                    FieldPredicate::Entity(Box::new(WhereTree::field(
                        "id",
                        FieldPredicate::equals(json!(1)),
                    ))),
                ),
            ))
            .done();

        let retrieve = r(json!({"select": {"content": true}}));
        let result = check_policies(&POST, Some(&retrieve), &policies, &FunctionCapabilities::all())
            .unwrap()
            .unwrap();

        // Single filter flattens: no needless OR-of-one.
        let expected = r(json!({
            "select": {"content": true},
            "where": {"author": {"id": {"equals": 1}}}
        }));
        assert_eq!(result, expected);
    }

    #[test]
    fn injected_filter_ands_with_caller_where() {
        let policies = Policies::new()
            .on(&POST)
            .allows(
                Policy::allow_all().filter(
                    Restriction::new().field(
                        "author",
                        FieldPredicate::Entity(Box::new(WhereTree::field(
                            "id",
                            FieldPredicate::equals(json!(1)),
                        ))),
                    ),
                ),
            )
            .done();

        let retrieve = r(json!({
            "select": {"content": true},
            "where": {"title": {"equals": "t"}}
        }));
        let result = check_policies(&POST, Some(&retrieve), &policies, &FunctionCapabilities::all())
            .unwrap()
            .unwrap();

        let and = result.filter.unwrap().and.unwrap();
        assert_eq!(and.0.len(), 2);
        assert!(and.0[0].fields.contains_key("title"));
        assert!(and.0[1].fields.contains_key("author"));
    }

    #[test]
    #[should_panic(expected = "lacks the `where` capability")]
    fn filter_without_where_capability_is_a_programmer_error() {
        let policies = Policies::new()
            .on(&POST)
            .allows(Policy::allow_all().filter(
                Restriction::new().field("title", FieldPredicate::equals(json!("t"))),
            ))
            .done();

        let caps = FunctionCapabilities {
            filter: false,
            ..FunctionCapabilities::all()
        };
        let retrieve = r(json!({"select": {"content": true}}));
        let _ = check_policies(&POST, Some(&retrieve), &policies, &caps);
    }

    #[test]
    fn multiple_filters_or_together() {
        let policies = Policies::new()
            .on(&POST)
            .allows(Policy::allow_all().filter(
                Restriction::new().field("title", FieldPredicate::equals(json!("a"))),
            ))
            .allows(Policy::allow_all().filter(
                Restriction::new().field("title", FieldPredicate::equals(json!("b"))),
            ))
            .done();

        let retrieve = r(json!({"select": {"content": true}}));
        let result = check_policies(&POST, Some(&retrieve), &policies, &FunctionCapabilities::all())
            .unwrap()
            .unwrap();

        let or = result.filter.unwrap().or.unwrap();
        assert_eq!(or.0.len(), 2);
    }

    #[test]
    fn restriction_gates_applicability() {
        let policies = Policies::new()
            .on(&USER)
            .allows(
                Policy::allow_all()
                    .label("self")
                    .when(Restriction::new().field("id", FieldPredicate::equals(json!("u1")))),
            )
            .done();

        // Caller constrains to the restricted domain: applies.
        let ok = r(json!({"select": {"name": true}, "where": {"id": {"equals": "u1"}}}));
        assert!(
            check_policies(&USER, Some(&ok), &policies, &FunctionCapabilities::all()).is_ok()
        );

        // No such constraint: restriction not met.
        let bad = r(json!({"select": {"name": true}}));
        let violation =
            check_policies(&USER, Some(&bad), &policies, &FunctionCapabilities::all())
                .unwrap_err();
        assert_eq!(
            violation.policies[0].outcome,
            PolicyOutcome::RestrictionNotMet
        );
    }

    #[test]
    fn where_fields_count_as_read() {
        // Filtering on `id` requires `id` to be visible, even though the
        // selection only asks for `name`.
        let retrieve = r(json!({
            "select": {"name": true},
            "where": {"id": {"equals": "u1"}}
        }));
        let violation = check_policies(
            &USER,
            Some(&retrieve),
            &name_only_policies(),
            &FunctionCapabilities::all(),
        )
        .unwrap_err();
        let PolicyOutcome::ForbiddenSelection { forbidden } = &violation.policies[0].outcome
        else {
            panic!("expected forbidden selection");
        };
        assert_eq!(forbidden, &vec![SelectionPath::root().child("id")]);
    }

    #[test]
    fn expansion_does_not_leak_into_result() {
        let policies = Policies::new()
            .on(&USER)
            .allows(Policy::allow_all())
            .done();
        let retrieve = r(json!({
            "select": {"name": true},
            "where": {"id": {"equals": "u1"}}
        }));
        let result = check_policies(&USER, Some(&retrieve), &policies, &FunctionCapabilities::all())
            .unwrap()
            .unwrap();
        // `id` was checked for visibility but must not appear in the
        // authorized selection.
        assert_eq!(result.select, retrieve.select);
    }

    #[test]
    fn nested_entities_are_checked_with_their_own_policies() {
        // User readable, Post has no policies at all: selecting into posts
        // fails at $.posts.
        let policies = Policies::new()
            .on(&USER)
            .allows(Policy::allow_all())
            .done();
        let retrieve = r(json!({
            "select": {"name": true, "posts": {"select": {"title": true}}}
        }));
        let violation =
            check_policies(&USER, Some(&retrieve), &policies, &FunctionCapabilities::all())
                .unwrap_err();
        assert_eq!(violation.path, SelectionPath::root().child("posts"));
        assert!(violation.policies.is_empty());
    }

    #[test]
    fn nested_filter_injection_lands_in_the_nested_retrieve() {
        let policies = Policies::new()
            .on(&USER)
            .allows(Policy::allow_all())
            .on(&POST)
            .allows(Policy::allow_all().filter(
                Restriction::new().field("title", FieldPredicate::equals(json!("public"))),
            ))
            .done();

        let retrieve = r(json!({
            "select": {"name": true, "posts": {"select": {"title": true}}}
        }));
        let result = check_policies(&USER, Some(&retrieve), &policies, &FunctionCapabilities::all())
            .unwrap()
            .unwrap();

        let SelectionEntry::Nested(posts) = &result.select.unwrap().0["posts"] else {
            panic!("expected nested posts entry");
        };
        assert_eq!(
            posts.filter,
            r(json!({"where": {"title": {"equals": "public"}}})).filter
        );
        // The nested selection itself is unchanged.
        assert!(posts.select.as_ref().unwrap().is_selected("title"));
        assert_eq!(posts.select.as_ref().unwrap().selected().count(), 1);
    }

    #[test]
    fn true_entity_selection_gains_filter_via_rewrite() {
        let policies = Policies::new()
            .on(&USER)
            .allows(Policy::allow_all())
            .on(&POST)
            .allows(Policy::allow_all().filter(
                Restriction::new().field("title", FieldPredicate::equals(json!("public"))),
            ))
            .done();

        let retrieve = r(json!({"select": {"posts": true}}));
        let result = check_policies(&USER, Some(&retrieve), &policies, &FunctionCapabilities::all())
            .unwrap()
            .unwrap();

        let SelectionEntry::Nested(posts) = &result.select.unwrap().0["posts"] else {
            panic!("expected posts rewritten to carry the filter");
        };
        assert!(posts.select.is_none());
        assert!(posts.filter.is_some());
    }

    #[test]
    fn never_widens_access() {
        let policies = Policies::new()
            .on(&USER)
            .allows(Policy::selecting(selection(json!({"name": true, "id": true}))))
            .done();
        let retrieve = r(json!({"select": {"name": true}}));
        let result = check_policies(&USER, Some(&retrieve), &policies, &FunctionCapabilities::all())
            .unwrap()
            .unwrap();

        let requested = selection_to_paths(&USER, retrieve.select.as_ref().unwrap());
        let returned = selection_to_paths(&USER, result.select.as_ref().unwrap());
        assert!(returned.is_subset(&requested));
    }
}
