use std::collections::HashMap;

use opkit_schema::{
    EntityType, IntegerType, NodeId, ObjectType, Type, TypeView, is_reserved_field,
};
use serde_json::json;

use crate::caps::{DEFAULT_TAKE_MAX, FunctionCapabilities};

/// Derives, for an `(entity, capabilities)` pair, the structural type of
/// every legal retrieve request, so the general-purpose decoder validates
/// caller input with no retrieve-specific logic.
///
/// All sub-type builders are memoized per concrete schema node (keyed by
/// [`NodeId`]): a self-referential entity produces a single shared recursive
/// node instead of unrolling forever. The memo tables live in the
/// synthesizer, which is built once per module and dropped after the
/// function set is wired up.
pub struct Synthesizer {
    retrieve_types: HashMap<(NodeId, FunctionCapabilities), Type>,
    select_types: HashMap<(NodeId, FunctionCapabilities), Type>,
    where_types: HashMap<NodeId, Type>,
    order_by_types: HashMap<NodeId, Type>,
    order_by_objects: HashMap<NodeId, Type>,
    direction: Type,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synthesizer {
    /// Fresh synthesizer with empty memo tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            retrieve_types: HashMap::new(),
            select_types: HashMap::new(),
            where_types: HashMap::new(),
            order_by_types: HashMap::new(),
            order_by_objects: HashMap::new(),
            direction: Type::union(
                Some("SortDirection"),
                [("asc", Type::literal(json!("asc"))), ("desc", Type::literal(json!("desc")))],
            ),
        }
    }

    /// The retrieve type for `ty` under `caps`.
    ///
    /// Returns `None` when `caps` enables nothing or when `ty` does not
    /// unwrap (through `Optional`/`Nullable`/`Array`) to an entity — both
    /// mean "this function does not support retrieval", which callers branch
    /// on rather than fail.
    pub fn retrieve_type(&mut self, ty: &Type, caps: &FunctionCapabilities) -> Option<Type> {
        if caps.is_empty() {
            return None;
        }
        let root = ty.unwrapped();
        if !matches!(root.view(), TypeView::Entity(_)) {
            return None;
        }
        Some(self.entity_retrieve(&root, caps))
    }

    fn entity_retrieve(&mut self, entity_ty: &Type, caps: &FunctionCapabilities) -> Type {
        let key = (entity_ty.node_id(), caps.clone());
        if let Some(cached) = self.retrieve_types.get(&key) {
            return cached.clone();
        }
        let entity = expect_entity(entity_ty);

        let placeholder = Type::placeholder(format!("{}Retrieve", entity.name()));
        self.retrieve_types.insert(key, placeholder.clone());

        let mut fields: Vec<(String, Type)> = Vec::new();
        if caps.select {
            let select = self.select_type(entity_ty, &entity, caps);
            fields.push(("select".to_owned(), Type::optional(select)));
        }
        if caps.filter && entity.capabilities().supports_filter() {
            let filter = self.where_type(entity_ty, &entity);
            fields.push(("where".to_owned(), Type::optional(filter)));
        }
        if caps.order_by && entity.capabilities().supports_order_by() {
            let per_field = self.order_by_type(entity_ty, &entity);
            fields.push(("orderBy".to_owned(), Type::optional(one_or_many(&per_field))));
        }
        if let Some(rule) = caps.take {
            let max = rule
                .max
                .or(entity.capabilities().take.and_then(|r| r.max))
                .unwrap_or(DEFAULT_TAKE_MAX);
            fields.push((
                "take".to_owned(),
                Type::optional(Type::integer_with(IntegerType {
                    minimum: Some(0),
                    maximum: Some(i64::from(max)),
                    default: Some(i64::from(max)),
                })),
            ));
        }
        if let Some(rule) = caps.skip {
            let max = rule.max.or(entity.capabilities().skip.and_then(|r| r.max));
            fields.push((
                "skip".to_owned(),
                Type::optional(Type::integer_with(IntegerType {
                    minimum: Some(0),
                    maximum: max.map(i64::from),
                    default: Some(0),
                })),
            ));
        }

        placeholder.bind(Type::object(format!("{}Retrieve", entity.name()), fields));
        placeholder
    }

    fn select_type(
        &mut self,
        entity_ty: &Type,
        entity: &EntityType,
        caps: &FunctionCapabilities,
    ) -> Type {
        let key = (entity_ty.node_id(), caps.clone());
        if let Some(cached) = self.select_types.get(&key) {
            return cached.clone();
        }
        let placeholder = Type::placeholder(format!("{}Select", entity.name()));
        self.select_types.insert(key, placeholder.clone());

        let mut fields: Vec<(String, Type)> = Vec::new();
        for (name, field_ty) in entity.fields() {
            if !entity.capabilities().selectable(name) {
                continue;
            }
            let selectable = self.select_field(field_ty, caps);
            fields.push((name.clone(), Type::optional(selectable)));
        }

        placeholder.bind(Type::object(format!("{}Select", entity.name()), fields));
        placeholder
    }

    /// Select position for one field: scalars reduce to boolean, single
    /// entities recurse with the parent's capabilities, arrays of entities
    /// always get full nested capabilities, embedded objects recurse
    /// structurally under a `{select: ...}` wrapper.
    fn select_field(&mut self, field_ty: &Type, caps: &FunctionCapabilities) -> Type {
        let concrete = field_ty.concretise();
        match concrete.view() {
            TypeView::Optional(inner) | TypeView::Nullable(inner) => {
                let inner = inner.clone();
                self.select_field(&inner, caps)
            }
            TypeView::Array(element) => {
                let element = element.unwrapped();
                match element.view() {
                    TypeView::Entity(_) => {
                        let nested = self.entity_retrieve(&element, &FunctionCapabilities::all());
                        flag_or(nested)
                    }
                    TypeView::Object(object) => {
                        let object = object.clone();
                        let body = self.object_select(&element, &object, caps);
                        flag_or(select_wrapper(body))
                    }
                    _ => Type::boolean(),
                }
            }
            TypeView::Entity(_) => {
                let nested = self.entity_retrieve(&concrete, caps);
                flag_or(nested)
            }
            TypeView::Object(object) => {
                let object = object.clone();
                let body = self.object_select(&concrete, &object, caps);
                flag_or(select_wrapper(body))
            }
            TypeView::Scalar(_) | TypeView::Union(_) => Type::boolean(),
        }
    }

    fn object_select(
        &mut self,
        object_ty: &Type,
        object: &ObjectType,
        caps: &FunctionCapabilities,
    ) -> Type {
        let key = (object_ty.node_id(), caps.clone());
        if let Some(cached) = self.select_types.get(&key) {
            return cached.clone();
        }
        let name = object.name().unwrap_or("Object");
        let placeholder = Type::placeholder(format!("{name}Select"));
        self.select_types.insert(key, placeholder.clone());

        let mut fields: Vec<(String, Type)> = Vec::new();
        for (field_name, field_ty) in object.fields() {
            let selectable = self.select_field(field_ty, caps);
            fields.push((field_name.clone(), Type::optional(selectable)));
        }

        placeholder.bind(Type::anonymous_object(fields));
        placeholder
    }

    fn where_type(&mut self, entity_ty: &Type, entity: &EntityType) -> Type {
        let key = entity_ty.node_id();
        if let Some(cached) = self.where_types.get(&key) {
            return cached.clone();
        }
        let placeholder = Type::placeholder(format!("{}Where", entity.name()));
        self.where_types.insert(key, placeholder.clone());

        let mut fields: Vec<(String, Type)> = Vec::new();
        for (name, field_ty) in entity.fields() {
            if is_reserved_field(name) || !entity.capabilities().filterable(name) {
                continue;
            }
            if let Some(predicate) = self.where_field(field_ty) {
                fields.push((name.clone(), Type::optional(predicate)));
            }
        }
        fields.push(("AND".to_owned(), Type::optional(one_or_many(&placeholder))));
        fields.push(("OR".to_owned(), Type::optional(one_or_many(&placeholder))));
        fields.push(("NOT".to_owned(), Type::optional(one_or_many(&placeholder))));

        placeholder.bind(Type::object(format!("{}Where", entity.name()), fields));
        placeholder
    }

    /// Predicate type for one filterable field, or `None` for kinds that
    /// cannot be filtered (embedded objects, unions, arrays of scalars,
    /// entities that declare no `where` support).
    fn where_field(&mut self, field_ty: &Type) -> Option<Type> {
        let concrete = field_ty.concretise();
        match concrete.view() {
            TypeView::Optional(inner) | TypeView::Nullable(inner) => {
                let inner = inner.clone();
                self.where_field(&inner)
            }
            TypeView::Scalar(_) => Some(Type::anonymous_object([
                ("equals", Type::optional(concrete.clone())),
                ("in", Type::optional(Type::array(concrete.clone()))),
            ])),
            TypeView::Entity(entity) => {
                if entity.capabilities().supports_filter() {
                    let entity = entity.clone();
                    Some(self.where_type(&concrete, &entity))
                } else {
                    None
                }
            }
            TypeView::Array(element) => {
                let element = element.unwrapped();
                match element.view() {
                    TypeView::Entity(entity) if entity.capabilities().supports_filter() => {
                        let entity = entity.clone();
                        let nested = self.where_type(&element, &entity);
                        Some(Type::anonymous_object([
                            ("some", Type::optional(nested.clone())),
                            ("every", Type::optional(nested.clone())),
                            ("none", Type::optional(nested)),
                        ]))
                    }
                    _ => None,
                }
            }
            TypeView::Object(_) | TypeView::Union(_) => None,
        }
    }

    fn order_by_type(&mut self, entity_ty: &Type, entity: &EntityType) -> Type {
        let key = entity_ty.node_id();
        if let Some(cached) = self.order_by_types.get(&key) {
            return cached.clone();
        }
        let placeholder = Type::placeholder(format!("{}OrderBy", entity.name()));
        self.order_by_types.insert(key, placeholder.clone());

        let mut fields: Vec<(String, Type)> = Vec::new();
        for (name, field_ty) in entity.fields() {
            if is_reserved_field(name) || !entity.capabilities().sortable(name) {
                continue;
            }
            if let Some(entry) = self.order_by_field(field_ty) {
                fields.push((name.clone(), Type::optional(entry)));
            }
        }

        placeholder.bind(Type::object(format!("{}OrderBy", entity.name()), fields));
        placeholder
    }

    /// OrderBy position for one sortable field: scalars take a direction,
    /// arrays degrade to `{_count: direction}`, nested entities recurse
    /// (when they declare `orderBy` support), embedded objects recurse
    /// structurally.
    fn order_by_field(&mut self, field_ty: &Type) -> Option<Type> {
        let concrete = field_ty.concretise();
        match concrete.view() {
            TypeView::Optional(inner) | TypeView::Nullable(inner) => {
                let inner = inner.clone();
                self.order_by_field(&inner)
            }
            TypeView::Scalar(_) => Some(self.direction.clone()),
            TypeView::Array(_) => Some(Type::anonymous_object([(
                "_count",
                Type::optional(self.direction.clone()),
            )])),
            TypeView::Entity(entity) => {
                if entity.capabilities().supports_order_by() {
                    let entity = entity.clone();
                    Some(self.order_by_type(&concrete, &entity))
                } else {
                    None
                }
            }
            TypeView::Object(object) => {
                let object = object.clone();
                self.order_by_object(&concrete, &object)
            }
            TypeView::Union(_) => None,
        }
    }

    fn order_by_object(&mut self, object_ty: &Type, object: &ObjectType) -> Option<Type> {
        let key = object_ty.node_id();
        if let Some(cached) = self.order_by_objects.get(&key) {
            return Some(cached.clone());
        }
        let name = object.name().unwrap_or("Object");
        let placeholder = Type::placeholder(format!("{name}OrderBy"));
        self.order_by_objects.insert(key, placeholder.clone());

        let mut fields: Vec<(String, Type)> = Vec::new();
        for (field_name, field_ty) in object.fields() {
            if is_reserved_field(field_name) {
                continue;
            }
            if let Some(entry) = self.order_by_field(field_ty) {
                fields.push((field_name.clone(), Type::optional(entry)));
            }
        }

        placeholder.bind(Type::anonymous_object(fields));
        Some(placeholder)
    }
}

/// One-shot synthesis without keeping the memo tables around.
#[must_use]
pub fn retrieve_type(ty: &Type, caps: &FunctionCapabilities) -> Option<Type> {
    Synthesizer::new().retrieve_type(ty, caps)
}

fn expect_entity(ty: &Type) -> EntityType {
    match ty.view() {
        TypeView::Entity(entity) => entity.clone(),
        _ => unreachable!("retrieve synthesis on a non-entity node"),
    }
}

/// `true | false | <nested>` select position.
fn flag_or(nested: Type) -> Type {
    Type::union(None, [("flag", Type::boolean()), ("nested", nested)])
}

/// `{select?: <body>}` wrapper for embedded-object selections.
fn select_wrapper(body: Type) -> Type {
    Type::anonymous_object([("select", Type::optional(body))])
}

/// `<T> | [<T>]` position.
fn one_or_many(ty: &Type) -> Type {
    Type::union(None, [("one", ty.clone()), ("many", Type::array(ty.clone()))])
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use opkit_schema::{
        DecodeOptions, EntityCapabilities, FieldRule, PageRule, decode,
    };
    use serde_json::json;
    use std::sync::LazyLock;

    static USER: LazyLock<Type> = LazyLock::new(|| {
        Type::entity_with(
            "User",
            [
                ("id", Type::string()),
                ("name", Type::string()),
                ("age", Type::optional(Type::integer())),
                ("tags", Type::array(Type::string())),
                ("bestFriend", Type::optional(Type::defer(|| USER.clone()))),
                ("friends", Type::array(Type::defer(|| USER.clone()))),
                ("posts", Type::array(Type::defer(|| POST.clone()))),
            ],
            EntityCapabilities {
                select: None,
                filter: Some(FieldRule::fields(["id", "name", "posts", "bestFriend"])),
                order_by: Some(FieldRule::All),
                take: Some(PageRule::unbounded()),
                skip: Some(PageRule::unbounded()),
            },
        )
    });

    static POST: LazyLock<Type> = LazyLock::new(|| {
        Type::entity_with(
            "Post",
            [
                ("title", Type::string()),
                ("content", Type::string()),
                ("author", Type::defer(|| USER.clone())),
            ],
            EntityCapabilities {
                select: None,
                filter: Some(FieldRule::All),
                order_by: Some(FieldRule::All),
                take: Some(PageRule::unbounded()),
                skip: Some(PageRule::unbounded()),
            },
        )
    });

    fn strict() -> DecodeOptions {
        DecodeOptions::strict()
    }

    #[test]
    fn empty_capabilities_yield_nothing() {
        assert!(retrieve_type(&USER, &FunctionCapabilities::none()).is_none());
    }

    #[test]
    fn non_entity_root_yields_nothing() {
        assert!(retrieve_type(&Type::string(), &FunctionCapabilities::all()).is_none());
        let object = Type::anonymous_object([("x", Type::string())]);
        assert!(retrieve_type(&object, &FunctionCapabilities::all()).is_none());
    }

    #[test]
    fn root_unwraps_through_wrappers() {
        let wrapped = Type::optional(Type::array(USER.clone()));
        assert!(retrieve_type(&wrapped, &FunctionCapabilities::all()).is_some());
    }

    #[test]
    fn cyclic_entity_synthesis_terminates_and_shares_nodes() {
        let mut synth = Synthesizer::new();
        let caps = FunctionCapabilities::all();
        let first = synth.retrieve_type(&USER, &caps).unwrap();
        let second = synth.retrieve_type(&USER, &caps).unwrap();
        // Memoized: the cycle point resolves to a single shared node.
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn accepts_deeply_nested_selection_through_the_cycle() {
        let ty = retrieve_type(&USER, &FunctionCapabilities::all()).unwrap();
        let value = json!({
            "select": {
                "name": true,
                "friends": {
                    "select": {"friends": {"select": {"name": true}}},
                    "take": 5
                }
            }
        });
        assert!(decode(&ty, &value, &strict()).is_ok());
    }

    #[test]
    fn rejects_operations_the_function_does_not_enable() {
        let ty = retrieve_type(&USER, &FunctionCapabilities::select_only()).unwrap();
        let err = decode(&ty, &json!({"where": {"name": {"equals": "a"}}}), &strict());
        assert!(err.is_err());
        let err = decode(&ty, &json!({"take": 5}), &strict());
        assert!(err.is_err());
    }

    #[test]
    fn rejects_where_on_entity_without_filter_support() {
        let plain = Type::entity(
            "Plain",
            [("id", Type::string())],
        );
        let ty = retrieve_type(&plain, &FunctionCapabilities::all()).unwrap();
        assert!(decode(&ty, &json!({"select": {"id": true}}), &strict()).is_ok());
        assert!(decode(&ty, &json!({"where": {"id": {"equals": "x"}}}), &strict()).is_err());
    }

    #[test]
    fn rejects_non_filterable_field() {
        let ty = retrieve_type(&USER, &FunctionCapabilities::all()).unwrap();
        // `age` is not in User's filterable set.
        let err = decode(&ty, &json!({"where": {"age": {"equals": 3}}}), &strict());
        assert!(err.is_err());
        assert!(decode(&ty, &json!({"where": {"name": {"equals": "a"}}}), &strict()).is_ok());
    }

    #[test]
    fn where_supports_composition_and_quantifiers() {
        let ty = retrieve_type(&USER, &FunctionCapabilities::all()).unwrap();
        let value = json!({
            "where": {
                "AND": [
                    {"name": {"in": ["a", "b"]}},
                    {"posts": {"some": {"title": {"equals": "t"}}}}
                ],
                "NOT": {"bestFriend": {"id": {"equals": "u2"}}}
            }
        });
        assert!(decode(&ty, &value, &strict()).is_ok());
    }

    #[test]
    fn order_by_accepts_single_and_array_with_count() {
        let ty = retrieve_type(&USER, &FunctionCapabilities::all()).unwrap();
        assert!(decode(&ty, &json!({"orderBy": {"name": "asc"}}), &strict()).is_ok());
        let value = json!({
            "orderBy": [
                {"posts": {"_count": "desc"}},
                {"bestFriend": {"name": "asc"}}
            ]
        });
        assert!(decode(&ty, &value, &strict()).is_ok());
        assert!(decode(&ty, &json!({"orderBy": {"name": "upwards"}}), &strict()).is_err());
    }

    #[test]
    fn take_is_bounded_and_defaulted() {
        let caps = FunctionCapabilities {
            take: Some(PageRule::up_to(20)),
            skip: Some(PageRule::unbounded()),
            ..FunctionCapabilities::select_only()
        };
        let ty = retrieve_type(&USER, &caps).unwrap();

        let decoded = decode(&ty, &json!({}), &strict()).unwrap();
        assert_eq!(decoded, json!({"take": 20, "skip": 0}));

        assert!(decode(&ty, &json!({"take": 50}), &strict()).is_err());
        assert!(decode(&ty, &json!({"skip": -1}), &strict()).is_err());
    }

    #[test]
    fn nested_array_selection_is_fully_capable_even_when_parent_is_not() {
        // Function enables select only; nested array selections still accept
        // the full operation set.
        let ty = retrieve_type(&USER, &FunctionCapabilities::select_only()).unwrap();
        let value = json!({
            "select": {
                "posts": {
                    "select": {"title": true},
                    "where": {"title": {"equals": "t"}},
                    "take": 3
                }
            }
        });
        assert!(decode(&ty, &value, &strict()).is_ok());
    }

    #[test]
    fn scalar_select_positions_are_boolean() {
        let ty = retrieve_type(&USER, &FunctionCapabilities::select_only()).unwrap();
        assert!(decode(&ty, &json!({"select": {"name": false, "tags": true}}), &strict()).is_ok());
        assert!(decode(&ty, &json!({"select": {"name": {"select": {}}}}), &strict()).is_err());
    }
}
