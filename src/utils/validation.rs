use serde::Serialize;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// A single field-level validation failure, flattened for API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate<T: Validate>(val: &T) -> Result<(), Vec<FieldError>> {
    val.validate().map_err(|e| flatten(&e))
}

/// Flattens nested validator errors into `parent.child` / `list[0].child` paths.
pub fn flatten(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut out = Vec::new();
    collect("", errors, &mut out);
    out.sort_by(|a, b| a.field.cmp(&b.field));
    out
}

fn collect(prefix: &str, errors: &ValidationErrors, out: &mut Vec<FieldError>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            ValidationErrorsKind::Field(errs) => {
                for err in errs {
                    let message = err
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("failed '{}' check", err.code));
                    out.push(FieldError::new(path.clone(), message));
                }
            }
            ValidationErrorsKind::Struct(inner) => collect(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    collect(&format!("{}[{}]", path, index), inner, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[derive(Validate)]
    struct Line {
        #[validate(range(min = 1, message = "must be at least 1"))]
        quantity: i64,
    }

    #[derive(Validate)]
    struct Order {
        #[validate(length(min = 1, message = "is required"))]
        order_id: String,
        #[validate(nested)]
        items: Vec<Line>,
    }

    #[test]
    fn nested_paths_are_flattened() {
        let order = Order {
            order_id: String::new(),
            items: vec![Line { quantity: 2 }, Line { quantity: 0 }],
        };
        let errors = validate(&order).unwrap_err();
        assert_eq!(
            errors,
            vec![
                FieldError::new("items[1].quantity", "must be at least 1"),
                FieldError::new("order_id", "is required"),
            ]
        );
    }
}
