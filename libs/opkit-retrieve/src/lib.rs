//! Capability-aware retrieve model for OpKit.
//!
//! A retrieve request (`{select, where, orderBy, take, skip}`) describes
//! what a caller wants fetched and how it should be shaped. This crate owns
//! three layers of that story:
//!
//! - the **value model** ([`Retrieve`] and friends): serde types honoring
//!   the wire contract, normalized for programmatic use;
//! - the **type synthesizer** ([`Synthesizer`]): derives, per
//!   `(entity, capabilities)` pair, the structural type accepting exactly
//!   the legal retrieve requests — memoized per schema node so cyclic
//!   entities come out as recursive types instead of unrolling forever;
//! - the **value utilities**: [`merge`], [`selected_type`],
//!   [`selection_depth`] and the path helpers
//!   ([`selection_to_paths`], [`where_to_selection`],
//!   [`order_by_to_selection`]) the policy engine builds on.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod caps;
pub mod merge;
pub mod paths;
pub mod project;
pub mod synth;
pub mod value;

pub use caps::{DEFAULT_TAKE_MAX, FunctionCapabilities};
pub use merge::{MergeOptions, OrderByPrecedence, SidePreference, default_selection, merge, merge_selections};
pub use paths::{
    SelectionPath, is_selection_included, order_by_to_selection, selection_excess,
    selection_to_paths, union_selections, visible_selection, where_to_selection,
};
pub use project::{selected_type, selection_depth};
pub use synth::{Synthesizer, retrieve_type};
pub use value::{
    Direction, FieldPredicate, OneOrMany, OrderByEntry, OrderByTree, QuantifiedPredicate,
    Retrieve, ScalarPredicate, Selection, SelectionEntry, WhereTree,
};
