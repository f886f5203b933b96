//! Field- and row-level access policies for OpKit retrieval.
//!
//! A [`Policy`] bounds what a caller may read from one entity: `selection`
//! is the maximal set of readable paths, `restriction` narrows when the
//! policy applies at all (only if the caller's `where` already constrains
//! the entity within that domain), and `filter` is a row predicate injected
//! into the effective `where` whenever the policy is applied.
//!
//! [`check_policies`] is the evaluation engine: it expands the requested
//! selection with everything `where`/`orderBy` touch, partitions the
//! entity's policies into satisfied / potentially-applicable / not-met,
//! fails with an exact-path [`PolicyViolation`] when nothing is satisfied,
//! injects the satisfied row filters, and recurses into nested entity
//! selections with their own policies. Everything unresolvable is
//! fail-closed.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod check;
pub mod policy;
pub mod restriction;
pub mod violation;

pub use check::check_policies;
pub use policy::{Policies, PoliciesOn, Policy, PolicySelection, Restriction};
pub use restriction::is_within_restriction;
pub use violation::{PolicyJudgement, PolicyOutcome, PolicyViolation};
