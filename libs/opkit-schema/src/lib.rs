//! Structural type algebra for OpKit schemas.
//!
//! A schema is a possibly cyclic graph of [`Type`] nodes: scalars, the
//! `Optional`/`Nullable`/`Array` wrappers, identity-free objects, entities
//! (the only legal retrieve roots and policy subjects) and untagged unions.
//! Cycles are expressed through deferred nodes ([`Type::defer`] for
//! user-declared recursion, [`Type::placeholder`] + [`Type::bind`] for
//! knot-tying inside derivations).
//!
//! The crate exposes exactly the collaborator surface the rest of OpKit
//! composes against: [`decode`] (validation + canonicalization of
//! `serde_json::Value`s), [`Type::concretise`], [`Type::view`] for kind
//! matching, [`Type::node_id`] as the memoization key of every recursive
//! derivation, and [`walk`] for cycle-safe traversals.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod caps;
pub mod decode;
pub mod error;
pub mod types;

pub use caps::{EntityCapabilities, FieldRule, PageRule};
pub use decode::{DecodeOptions, UnknownFields, decode, encode};
pub use error::{DecodeError, DecodeErrorKind, PathSegment, ValuePath};
pub use types::{
    EntityType, IntegerType, NodeId, ObjectType, ScalarType, Type, TypeView, UnionType,
    is_reserved_field, walk,
};
