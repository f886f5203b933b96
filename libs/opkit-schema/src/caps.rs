use std::collections::BTreeSet;

/// Which fields of an entity participate in a retrieve operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldRule {
    /// Every non-reserved field participates.
    All,
    /// Only the named fields participate.
    Fields(BTreeSet<String>),
}

impl FieldRule {
    /// Restrict to an explicit field set.
    #[must_use]
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fields(names.into_iter().map(Into::into).collect())
    }

    /// Returns `true` if the named field participates under this rule.
    #[must_use]
    pub fn permits(&self, field: &str) -> bool {
        match self {
            Self::All => true,
            Self::Fields(set) => set.contains(field),
        }
    }
}

/// Pagination bound for `take`/`skip`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PageRule {
    /// Inclusive upper bound on the accepted value.
    pub max: Option<u32>,
}

impl PageRule {
    /// Unbounded pagination rule.
    #[must_use]
    pub fn unbounded() -> Self {
        Self { max: None }
    }

    /// Pagination rule with an inclusive maximum.
    #[must_use]
    pub fn up_to(max: u32) -> Self {
        Self { max: Some(max) }
    }
}

/// Per-entity retrieve capability declarations.
///
/// An absent operation means the entity does not support it (for
/// `where`/`orderBy`) or places no restriction of its own (for `select`,
/// which is permitted by default). `take`/`skip` may carry a `max` bound.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityCapabilities {
    /// Restriction on selectable fields; `None` = all fields selectable.
    pub select: Option<FieldRule>,
    /// Filterable fields; `None` = the entity cannot be filtered.
    pub filter: Option<FieldRule>,
    /// Sortable fields; `None` = the entity cannot be ordered.
    pub order_by: Option<FieldRule>,
    /// `take` support with an optional bound.
    pub take: Option<PageRule>,
    /// `skip` support with an optional bound.
    pub skip: Option<PageRule>,
}

impl EntityCapabilities {
    /// Declarations enabling every operation on every field, unbounded.
    #[must_use]
    pub fn full() -> Self {
        Self {
            select: Some(FieldRule::All),
            filter: Some(FieldRule::All),
            order_by: Some(FieldRule::All),
            take: Some(PageRule::unbounded()),
            skip: Some(PageRule::unbounded()),
        }
    }

    /// Returns `true` if the field may appear in a selection.
    #[must_use]
    pub fn selectable(&self, field: &str) -> bool {
        self.select.as_ref().is_none_or(|rule| rule.permits(field))
    }

    /// Returns `true` if the entity declares `where` support at all.
    #[must_use]
    pub fn supports_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Returns `true` if the field may appear in a `where`.
    #[must_use]
    pub fn filterable(&self, field: &str) -> bool {
        self.filter.as_ref().is_some_and(|rule| rule.permits(field))
    }

    /// Returns `true` if the entity declares `orderBy` support at all.
    #[must_use]
    pub fn supports_order_by(&self) -> bool {
        self.order_by.is_some()
    }

    /// Returns `true` if the field may appear in an `orderBy`.
    #[must_use]
    pub fn sortable(&self, field: &str) -> bool {
        self.order_by
            .as_ref()
            .is_some_and(|rule| rule.permits(field))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_permits_select_only() {
        let caps = EntityCapabilities::default();
        assert!(caps.selectable("anything"));
        assert!(!caps.supports_filter());
        assert!(!caps.filterable("anything"));
        assert!(!caps.supports_order_by());
    }

    #[test]
    fn field_rule_restricts() {
        let caps = EntityCapabilities {
            filter: Some(FieldRule::fields(["id", "name"])),
            ..EntityCapabilities::default()
        };
        assert!(caps.filterable("id"));
        assert!(!caps.filterable("email"));
    }

    #[test]
    fn full_enables_everything() {
        let caps = EntityCapabilities::full();
        assert!(caps.filterable("x"));
        assert!(caps.sortable("x"));
        assert_eq!(caps.take, Some(PageRule::unbounded()));
    }
}
