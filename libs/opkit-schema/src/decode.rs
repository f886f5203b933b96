use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{DecodeError, DecodeErrorKind, ValuePath};
use crate::types::{ScalarType, Type, TypeView};

/// How to treat object fields the schema does not declare.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownFields {
    /// Fail the decode (strict input validation).
    #[default]
    Reject,
    /// Silently drop them (output trimming).
    Strip,
}

/// Decode behavior knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Unknown object field handling.
    pub unknown_fields: UnknownFields,
}

impl DecodeOptions {
    /// Strict options: unknown fields rejected.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            unknown_fields: UnknownFields::Reject,
        }
    }

    /// Lenient options: unknown fields stripped.
    #[must_use]
    pub fn stripping() -> Self {
        Self {
            unknown_fields: UnknownFields::Strip,
        }
    }
}

/// Validate `value` against `ty` and return its canonical form.
///
/// Canonicalization: unknown fields are rejected or stripped per `options`,
/// `null` against an `Optional` field is dropped, absent integer fields with
/// a declared default are filled in, and object keys come out sorted.
///
/// # Errors
///
/// Returns a path-tracked [`DecodeError`] on the first mismatch.
pub fn decode(ty: &Type, value: &Value, options: &DecodeOptions) -> Result<Value, DecodeError> {
    decode_at(ty, value, &ValuePath::root(), options)
}

/// Encode a decoded value back to its wire form.
///
/// The value domain is canonical JSON already, so encoding is the identity.
#[must_use]
pub fn encode(value: &Value) -> Value {
    value.clone()
}

fn decode_at(
    ty: &Type,
    value: &Value,
    path: &ValuePath,
    options: &DecodeOptions,
) -> Result<Value, DecodeError> {
    let ty = ty.concretise();
    match ty.view() {
        TypeView::Scalar(scalar) => decode_scalar(scalar, value, path),
        TypeView::Optional(inner) => {
            if value.is_null() {
                Ok(Value::Null)
            } else {
                decode_at(inner, value, path, options)
            }
        }
        TypeView::Nullable(inner) => {
            if value.is_null() {
                Ok(Value::Null)
            } else {
                decode_at(inner, value, path, options)
            }
        }
        TypeView::Array(element) => {
            let Value::Array(items) = value else {
                return Err(mismatch(path, "array", value));
            };
            let mut out = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                out.push(decode_at(element, item, &path.index(idx), options)?);
            }
            Ok(Value::Array(out))
        }
        TypeView::Object(object) => decode_fields(object.fields(), value, path, options),
        TypeView::Entity(entity) => decode_fields(entity.fields(), value, path, options),
        TypeView::Union(union) => {
            let mut tried = Vec::with_capacity(union.variants().len());
            for (name, variant) in union.variants() {
                if let Ok(decoded) = decode_at(variant, value, path, options) {
                    return Ok(decoded);
                }
                tried.push(name.clone());
            }
            Err(DecodeError::new(
                path.clone(),
                DecodeErrorKind::NoVariantMatched { tried },
            ))
        }
    }
}

fn decode_fields(
    fields: &BTreeMap<String, Type>,
    value: &Value,
    path: &ValuePath,
    options: &DecodeOptions,
) -> Result<Value, DecodeError> {
    let Value::Object(map) = value else {
        return Err(mismatch(path, "object", value));
    };

    let mut out = Map::new();
    for (name, field_ty) in fields {
        let field_path = path.field(name.clone());
        let concrete = field_ty.concretise();
        match map.get(name) {
            None => match absent_field_value(&concrete) {
                AbsentField::Default(v) => {
                    out.insert(name.clone(), v);
                }
                AbsentField::Skip => {}
                AbsentField::Required => {
                    return Err(DecodeError::new(
                        path.clone(),
                        DecodeErrorKind::MissingField {
                            field: name.clone(),
                        },
                    ));
                }
            },
            Some(v) if v.is_null() && matches!(concrete.view(), TypeView::Optional(_)) => {
                // Explicit null on an optional field is treated as absent.
            }
            Some(v) => {
                out.insert(name.clone(), decode_at(&concrete, v, &field_path, options)?);
            }
        }
    }

    for key in map.keys() {
        if !fields.contains_key(key) {
            match options.unknown_fields {
                UnknownFields::Reject => {
                    return Err(DecodeError::new(
                        path.clone(),
                        DecodeErrorKind::UnknownField { field: key.clone() },
                    ));
                }
                UnknownFields::Strip => {}
            }
        }
    }

    Ok(Value::Object(out))
}

enum AbsentField {
    Default(Value),
    Skip,
    Required,
}

/// Decide what an absent object field decodes to: a declared integer default
/// (looked up through one `Optional` wrapper), nothing for optional fields,
/// or a `MissingField` error otherwise.
fn absent_field_value(ty: &Type) -> AbsentField {
    let (inner, optional) = match ty.view() {
        TypeView::Optional(t) => (t.concretise(), true),
        _ => (ty.clone(), false),
    };
    if let TypeView::Scalar(ScalarType::Integer(int)) = inner.view() {
        if let Some(default) = int.default {
            return AbsentField::Default(Value::from(default));
        }
    }
    if optional {
        AbsentField::Skip
    } else {
        AbsentField::Required
    }
}

fn decode_scalar(
    scalar: &ScalarType,
    value: &Value,
    path: &ValuePath,
) -> Result<Value, DecodeError> {
    match scalar {
        ScalarType::String => match value {
            Value::String(_) => Ok(value.clone()),
            other => Err(mismatch(path, "string", other)),
        },
        ScalarType::Integer(int) => {
            let Some(n) = value.as_i64() else {
                return Err(mismatch(path, "integer", value));
            };
            let below = int.minimum.is_some_and(|min| n < min);
            let above = int.maximum.is_some_and(|max| n > max);
            if below || above {
                return Err(DecodeError::new(
                    path.clone(),
                    DecodeErrorKind::OutOfBounds {
                        value: n,
                        minimum: int.minimum,
                        maximum: int.maximum,
                    },
                ));
            }
            Ok(value.clone())
        }
        ScalarType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            other => Err(mismatch(path, "number", other)),
        },
        ScalarType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            other => Err(mismatch(path, "boolean", other)),
        },
        ScalarType::Literal(expected) => {
            if value == expected {
                Ok(value.clone())
            } else {
                Err(DecodeError::new(
                    path.clone(),
                    DecodeErrorKind::LiteralMismatch {
                        expected: expected.clone(),
                    },
                ))
            }
        }
    }
}

fn mismatch(path: &ValuePath, expected: &str, actual: &Value) -> DecodeError {
    DecodeError::new(
        path.clone(),
        DecodeErrorKind::TypeMismatch {
            expected: expected.to_owned(),
            actual: json_kind(actual).to_owned(),
        },
    )
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::types::IntegerType;
    use serde_json::json;

    fn user() -> Type {
        Type::entity(
            "User",
            [
                ("id", Type::string()),
                ("age", Type::optional(Type::integer())),
                ("nickname", Type::nullable(Type::string())),
            ],
        )
    }

    #[test]
    fn decodes_valid_object() {
        let decoded = decode(
            &user(),
            &json!({"id": "u1", "age": 33, "nickname": null}),
            &DecodeOptions::strict(),
        )
        .unwrap();
        assert_eq!(decoded, json!({"id": "u1", "age": 33, "nickname": null}));
    }

    #[test]
    fn missing_required_field_fails() {
        let err = decode(
            &user(),
            &json!({"age": 33, "nickname": null}),
            &DecodeOptions::strict(),
        )
        .unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::MissingField { ref field } if field == "id"));
    }

    #[test]
    fn optional_field_may_be_absent_or_null() {
        let decoded = decode(
            &user(),
            &json!({"id": "u1", "age": null, "nickname": null}),
            &DecodeOptions::strict(),
        )
        .unwrap();
        // Explicit null on an optional field is stripped.
        assert_eq!(decoded, json!({"id": "u1", "nickname": null}));
    }

    #[test]
    fn unknown_field_rejected_then_stripped() {
        let value = json!({"id": "u1", "nickname": null, "extra": 1});
        let err = decode(&user(), &value, &DecodeOptions::strict()).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::UnknownField { ref field } if field == "extra"));

        let decoded = decode(&user(), &value, &DecodeOptions::stripping()).unwrap();
        assert_eq!(decoded, json!({"id": "u1", "nickname": null}));
    }

    #[test]
    fn integer_bounds_and_default() {
        let ty = Type::anonymous_object([(
            "take",
            Type::optional(Type::integer_with(IntegerType {
                minimum: Some(0),
                maximum: Some(20),
                default: Some(20),
            })),
        )]);

        let decoded = decode(&ty, &json!({}), &DecodeOptions::strict()).unwrap();
        assert_eq!(decoded, json!({"take": 20}));

        let err = decode(&ty, &json!({"take": 50}), &DecodeOptions::strict()).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::OutOfBounds { value: 50, .. }));
        assert_eq!(err.path.to_string(), "$.take");
    }

    #[test]
    fn union_tries_variants_in_order() {
        let ty = Type::union(
            None,
            [
                ("all", Type::literal(json!(true))),
                ("flag", Type::boolean()),
            ],
        );
        assert_eq!(decode(&ty, &json!(true), &DecodeOptions::strict()).unwrap(), json!(true));
        assert_eq!(decode(&ty, &json!(false), &DecodeOptions::strict()).unwrap(), json!(false));
        let err = decode(&ty, &json!("nope"), &DecodeOptions::strict()).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::NoVariantMatched { .. }));
    }

    #[test]
    fn array_errors_carry_index_path() {
        let ty = Type::array(Type::string());
        let err = decode(&ty, &json!(["a", 1]), &DecodeOptions::strict()).unwrap_err();
        assert_eq!(err.path.to_string(), "$[1]");
    }

    #[test]
    fn literal_mismatch() {
        let ty = Type::literal(json!("asc"));
        assert!(decode(&ty, &json!("asc"), &DecodeOptions::strict()).is_ok());
        assert!(decode(&ty, &json!("desc"), &DecodeOptions::strict()).is_err());
    }

    #[test]
    fn encode_is_identity_on_decoded_values() {
        let decoded = decode(
            &user(),
            &json!({"id": "u1", "nickname": "kit"}),
            &DecodeOptions::strict(),
        )
        .unwrap();
        assert_eq!(encode(&decoded), decoded);
    }
}
