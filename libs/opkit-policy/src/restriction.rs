use opkit_retrieve::{FieldPredicate, ScalarPredicate, WhereTree};

use crate::policy::Restriction;

/// Does the caller's `where` already constrain the entity within the
/// policy's restriction domain?
///
/// A policy with no restriction always applies. Otherwise every restriction
/// key must appear at the top level of the caller's `where` with a deeply
/// equal predicate. The only widening this check recognizes is the
/// `in`/`equals` pair: a caller `equals: v` satisfies a restriction
/// `in: [... v ...]`, and a caller `in` list satisfies a restriction `in`
/// superset.
///
/// This is deliberately a subset check over syntax, not predicate-domain
/// containment: a caller `where` that is logically narrower but spelled
/// differently (e.g. nested under `AND`) does not satisfy the restriction.
// TODO: recognize predicates nested under a top-level AND group.
#[must_use]
pub fn is_within_restriction(filter: Option<&WhereTree>, restriction: &Restriction) -> bool {
    if restriction.is_empty() {
        return true;
    }
    let Some(filter) = filter else {
        return false;
    };
    restriction.fields().iter().all(|(name, wanted)| {
        filter
            .fields
            .get(name)
            .is_some_and(|actual| predicate_within(actual, wanted))
    })
}

fn predicate_within(actual: &FieldPredicate, wanted: &FieldPredicate) -> bool {
    if actual == wanted {
        return true;
    }
    match (actual, wanted) {
        (FieldPredicate::Scalar(actual), FieldPredicate::Scalar(wanted)) => {
            scalar_within(actual, wanted)
        }
        (FieldPredicate::Entity(actual), FieldPredicate::Entity(wanted)) => {
            wanted.fields.iter().all(|(name, sub)| {
                actual
                    .fields
                    .get(name)
                    .is_some_and(|actual_sub| predicate_within(actual_sub, sub))
            })
        }
        _ => false,
    }
}

fn scalar_within(actual: &ScalarPredicate, wanted: &ScalarPredicate) -> bool {
    match (&actual.equals, &actual.r#in, &wanted.equals, &wanted.r#in) {
        // equals vs equals is covered by deep equality above.
        (Some(value), _, None, Some(domain)) => domain.contains(value),
        (None, Some(values), None, Some(domain)) => {
            !values.is_empty() && values.iter().all(|v| domain.contains(v))
        }
        _ => false,
    }
}
