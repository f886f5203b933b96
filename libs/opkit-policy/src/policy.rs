use std::collections::{BTreeMap, HashMap};

use opkit_retrieve::{FieldPredicate, Selection, WhereTree};
use opkit_schema::{NodeId, Type};

/// A flat `where` shape with no `AND`/`OR`/`NOT` composition, used for
/// policy restrictions and injected filters.
///
/// The shape is enforced structurally: a restriction is a plain field map,
/// so composition is unrepresentable rather than validated away.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Restriction {
    fields: BTreeMap<String, FieldPredicate>,
}

impl Restriction {
    /// Empty restriction (matches any `where`).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one field predicate.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, predicate: FieldPredicate) -> Self {
        self.fields.insert(name.into(), predicate);
        self
    }

    /// The field predicates.
    #[inline]
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldPredicate> {
        &self.fields
    }

    /// Returns `true` if the restriction has no predicates.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Lower into an equivalent [`WhereTree`].
    #[must_use]
    pub fn to_where(&self) -> WhereTree {
        WhereTree {
            fields: self.fields.clone(),
            ..WhereTree::default()
        }
    }
}

/// The maximal set of selection paths a policy authorizes for read.
#[derive(Clone, Debug, PartialEq)]
pub enum PolicySelection {
    /// Everything reachable on the entity.
    All,
    /// Only the paths covered by this selection.
    Fields(Selection),
}

/// One access rule on an entity.
///
/// `selection` bounds which fields are readable. `restriction` narrows when
/// the rule applies at all: only if the caller's `where` already constrains
/// the entity within this domain. `filter` is injected into the effective
/// `where` whenever the rule is applied, implementing row-level security.
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    /// Diagnostic label surfaced in violations.
    pub label: Option<String>,
    /// Readable paths.
    pub selection: PolicySelection,
    /// Applicability condition on the caller's `where`.
    pub restriction: Option<Restriction>,
    /// Row filter injected when the policy applies.
    pub filter: Option<Restriction>,
}

impl Policy {
    /// Policy authorizing every field.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            label: None,
            selection: PolicySelection::All,
            restriction: None,
            filter: None,
        }
    }

    /// Policy authorizing exactly the given selection.
    #[must_use]
    pub fn selecting(selection: Selection) -> Self {
        Self {
            label: None,
            selection: PolicySelection::Fields(selection),
            restriction: None,
            filter: None,
        }
    }

    /// Attach a diagnostic label.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Apply only when the caller's `where` sits within this restriction.
    #[must_use]
    pub fn when(mut self, restriction: Restriction) -> Self {
        self.restriction = Some(restriction);
        self
    }

    /// Inject this row filter whenever the policy applies.
    #[must_use]
    pub fn filter(mut self, filter: Restriction) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Declared access policies, grouped by owning entity.
///
/// Built through the immutable fluent API:
///
/// ```
/// use opkit_policy::{Policies, Policy};
/// use opkit_schema::Type;
///
/// let user = Type::entity("User", [("id", Type::string())]);
/// let policies = Policies::new()
///     .on(&user)
///     .allows(Policy::allow_all().label("admin"))
///     .done();
/// assert_eq!(policies.for_entity(&user).len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Policies {
    by_entity: HashMap<NodeId, Vec<Policy>>,
}

impl Policies {
    /// Empty policy set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start declaring policies for an entity.
    #[must_use]
    pub fn on(self, entity: &Type) -> PoliciesOn {
        PoliciesOn {
            policies: self,
            entity: entity.node_id(),
        }
    }

    /// The policies declared for an entity (empty when none were declared;
    /// the checker treats that as deny).
    #[must_use]
    pub fn for_entity(&self, entity: &Type) -> &[Policy] {
        self.by_entity
            .get(&entity.node_id())
            .map_or(&[], Vec::as_slice)
    }
}

/// Intermediate fluent state: policies being declared for one entity.
#[derive(Clone, Debug)]
pub struct PoliciesOn {
    policies: Policies,
    entity: NodeId,
}

impl PoliciesOn {
    /// Declare one policy for the current entity.
    #[must_use]
    pub fn allows(mut self, policy: Policy) -> Self {
        self.policies
            .by_entity
            .entry(self.entity)
            .or_default()
            .push(policy);
        self
    }

    /// Switch to declaring policies for another entity.
    #[must_use]
    pub fn on(self, entity: &Type) -> Self {
        Self {
            policies: self.policies,
            entity: entity.node_id(),
        }
    }

    /// Finish building.
    #[must_use]
    pub fn done(self) -> Policies {
        self.policies
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> Type {
        Type::entity("User", [("id", Type::string()), ("name", Type::string())])
    }

    fn post() -> Type {
        Type::entity("Post", [("title", Type::string())])
    }

    #[test]
    fn fluent_builder_groups_by_entity() {
        let user = user();
        let post = post();
        let policies = Policies::new()
            .on(&user)
            .allows(Policy::allow_all())
            .allows(Policy::selecting(Selection::default()))
            .on(&post)
            .allows(Policy::allow_all())
            .done();

        assert_eq!(policies.for_entity(&user).len(), 2);
        assert_eq!(policies.for_entity(&post).len(), 1);
    }

    #[test]
    fn undeclared_entity_has_no_policies() {
        let policies = Policies::new();
        assert!(policies.for_entity(&user()).is_empty());
    }

    #[test]
    fn restriction_lowers_to_where() {
        let restriction = Restriction::new()
            .field("id", FieldPredicate::equals(json!("1")));
        let tree = restriction.to_where();
        assert!(!tree.has_composition());
        assert!(tree.fields.contains_key("id"));
    }
}
