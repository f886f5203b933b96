use opkit_schema::PageRule;

/// Default `take` bound when a function enables `take` without one.
pub const DEFAULT_TAKE_MAX: u32 = 20;

/// Per-function declaration of which retrieve operations callers may use.
///
/// This is the function-level gate; per-field participation is governed by
/// each entity's own [`opkit_schema::EntityCapabilities`]. The two compose:
/// an operation is synthesized only when the function enables it and (for
/// `where`/`orderBy`) the entity declares support.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FunctionCapabilities {
    /// Structured field selection.
    pub select: bool,
    /// Row filtering (`where`).
    pub filter: bool,
    /// Sorting (`orderBy`).
    pub order_by: bool,
    /// Row limit, with an optional bound (default bound
    /// [`DEFAULT_TAKE_MAX`]).
    pub take: Option<PageRule>,
    /// Row offset, with an optional bound.
    pub skip: Option<PageRule>,
}

impl FunctionCapabilities {
    /// No operations enabled. Functions without this declaration do not
    /// accept a retrieve at all.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Every operation enabled, pagination unbounded. Used for nested
    /// selections, which are always fully capable once policy-checked.
    #[must_use]
    pub fn all() -> Self {
        Self {
            select: true,
            filter: true,
            order_by: true,
            take: Some(PageRule::unbounded()),
            skip: Some(PageRule::unbounded()),
        }
    }

    /// Selection only.
    #[must_use]
    pub fn select_only() -> Self {
        Self {
            select: true,
            ..Self::default()
        }
    }

    /// Returns `true` if no operation is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.select
            && !self.filter
            && !self.order_by
            && self.take.is_none()
            && self.skip.is_none()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        assert!(FunctionCapabilities::none().is_empty());
        assert!(!FunctionCapabilities::all().is_empty());
        assert!(!FunctionCapabilities::select_only().is_empty());
    }
}
