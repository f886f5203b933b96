use std::collections::BTreeMap;

use opkit_schema::{Type, TypeView};

use crate::value::{Retrieve, Selection, SelectionEntry};

/// Project `ty` down to exactly the shape a retrieve's selection asks for.
///
/// With no selection, the projection keeps every non-entity field as-is and
/// makes entity fields optional with their default (non-entity) projection.
/// With a selection, the projection contains exactly the selected fields;
/// entity-typed fields come out optional either way, since omitting a
/// relation is always legal for a body.
///
/// The output-check middleware decodes function results against this type;
/// anything stricter would reject legal bodies, anything looser would leak
/// unselected data.
#[must_use]
pub fn selected_type(ty: &Type, retrieve: Option<&Retrieve>) -> Type {
    let selection = retrieve.and_then(|r| r.select.as_ref());
    project(ty, selection)
}

fn project(ty: &Type, selection: Option<&Selection>) -> Type {
    let concrete = ty.concretise();
    match concrete.view() {
        TypeView::Optional(inner) => Type::optional(project(inner, selection)),
        TypeView::Nullable(inner) => Type::nullable(project(inner, selection)),
        TypeView::Array(element) => Type::array(project(element, selection)),
        TypeView::Entity(entity) => project_fields(entity.fields(), selection),
        TypeView::Object(object) => project_fields(object.fields(), selection),
        TypeView::Scalar(_) | TypeView::Union(_) => concrete.clone(),
    }
}

fn project_fields(fields: &BTreeMap<String, Type>, selection: Option<&Selection>) -> Type {
    let mut out: Vec<(String, Type)> = Vec::new();
    match selection {
        None => {
            for (name, field_ty) in fields {
                if field_ty.is_entity() {
                    out.push((name.clone(), optionalize(map_entity(field_ty, &default_projection))));
                } else {
                    out.push((name.clone(), field_ty.clone()));
                }
            }
        }
        Some(selection) => {
            for (name, entry) in selection.selected() {
                let Some(field_ty) = fields.get(name) else {
                    continue;
                };
                let projected = match entry {
                    SelectionEntry::Flag(_) => {
                        if field_ty.is_entity() {
                            optionalize(map_entity(field_ty, &default_projection))
                        } else {
                            field_ty.clone()
                        }
                    }
                    SelectionEntry::Nested(nested) => {
                        let nested: &Retrieve = nested;
                        if field_ty.is_entity() {
                            optionalize(map_entity(field_ty, &|entity| {
                                selected_type(entity, Some(nested))
                            }))
                        } else {
                            project(field_ty, nested.select.as_ref())
                        }
                    }
                };
                out.push((name.clone(), projected));
            }
        }
    }
    Type::anonymous_object(out)
}

/// Rebuild the wrapper chain of `ty`, replacing the entity at its core with
/// `f(entity)`.
fn map_entity(ty: &Type, f: &dyn Fn(&Type) -> Type) -> Type {
    let concrete = ty.concretise();
    match concrete.view() {
        TypeView::Optional(inner) => Type::optional(map_entity(inner, f)),
        TypeView::Nullable(inner) => Type::nullable(map_entity(inner, f)),
        TypeView::Array(element) => Type::array(map_entity(element, f)),
        TypeView::Entity(_) => f(&concrete),
        _ => concrete.clone(),
    }
}

/// The default projection of an entity: its non-entity fields, as-is.
/// Entity fields are left out entirely, which keeps the projection finite
/// for self-referential schemas.
fn default_projection(entity_ty: &Type) -> Type {
    let TypeView::Entity(entity) = entity_ty.view() else {
        return entity_ty.clone();
    };
    let fields: Vec<(String, Type)> = entity
        .fields()
        .iter()
        .filter(|(_, fty)| !fty.is_entity())
        .map(|(name, fty)| (name.clone(), fty.clone()))
        .collect();
    Type::anonymous_object(fields)
}

fn optionalize(ty: Type) -> Type {
    if matches!(ty.view(), TypeView::Optional(_)) {
        ty
    } else {
        Type::optional(ty)
    }
}

/// Maximum entity-to-entity nesting depth of a retrieve's selection.
///
/// Depth 1 for no or empty selection; selecting into an entity field adds a
/// hop; embedded objects are transparent. Used by the max-depth middleware
/// to bound adversarially deep requests before any real work happens.
#[must_use]
pub fn selection_depth(ty: &Type, retrieve: &Retrieve) -> usize {
    let root = ty.unwrapped();
    depth_of(&root, retrieve.select.as_ref())
}

fn depth_of(ty: &Type, selection: Option<&Selection>) -> usize {
    let Some(selection) = selection else {
        return 1;
    };
    let fields = match ty.view() {
        TypeView::Entity(e) => e.fields().clone(),
        TypeView::Object(o) => o.fields().clone(),
        _ => return 1,
    };
    let mut depth = 1;
    for (name, entry) in selection.selected() {
        let Some(field_ty) = fields.get(name) else {
            continue;
        };
        let inner = field_ty.unwrapped();
        match inner.view() {
            TypeView::Entity(_) => {
                let sub = match entry {
                    SelectionEntry::Flag(_) => 1,
                    SelectionEntry::Nested(nested) => depth_of(&inner, nested.select.as_ref()),
                };
                depth = depth.max(1 + sub);
            }
            TypeView::Object(_) => {
                if let SelectionEntry::Nested(nested) = entry {
                    // Object nesting stays on the current entity level.
                    depth = depth.max(depth_of(&inner, nested.select.as_ref()));
                }
            }
            _ => {}
        }
    }
    depth
}
