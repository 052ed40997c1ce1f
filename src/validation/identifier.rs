use crate::api::middleware::AppError;

/// Accept `[A-Za-z_][A-Za-z0-9_$]*` and reject everything else.
///
/// Catalog names are embedded into introspection SQL verbatim, so there is no
/// escaping path: a name either matches or the whole introspection fails.
pub fn validate_identifier(value: &str) -> Result<&str, AppError> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    };

    if valid {
        Ok(value)
    } else {
        Err(AppError::InvalidIdentifier(value.to_string()))
    }
}
