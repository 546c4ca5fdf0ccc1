//! Identifier validation shared by nodes, graphs, workflows, runs, and steps.
//!
//! An identifier is lowercase alphanumeric plus `-`/`_`, length 1-32, with no
//! leading or trailing separator (spec.md §3 "Identifier").

use thiserror::Error;

const MAX_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("identifier cannot be empty")]
    Empty,
    #[error("identifier '{0}' exceeds max length {MAX_LEN}")]
    TooLong(String),
    #[error("identifier '{0}' contains invalid characters (only lowercase alphanumeric, '-', '_' allowed)")]
    InvalidChars(String),
    #[error("identifier '{0}' cannot start or end with '-' or '_'")]
    LeadingTrailingSeparator(String),
}

/// Validates an identifier per spec.md §3. Does not check uniqueness —
/// that is a session-level concern (see `nerve::session`).
pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::Empty);
    }
    if id.chars().count() > MAX_LEN {
        return Err(ValidationError::TooLong(id.to_string()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidChars(id.to_string()));
    }
    let first = id.chars().next().unwrap();
    let last = id.chars().last().unwrap();
    if first == '-' || first == '_' || last == '-' || last == '_' {
        return Err(ValidationError::LeadingTrailingSeparator(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        for id in ["a", "node-1", "my_node", "a1-b2_c3", &"x".repeat(32)] {
            assert!(validate_id(id).is_ok(), "expected valid: {id}");
        }
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validate_id(""), Err(ValidationError::Empty));
    }

    #[test]
    fn rejects_too_long() {
        let id = "x".repeat(33);
        assert!(matches!(validate_id(&id), Err(ValidationError::TooLong(_))));
    }

    #[test]
    fn rejects_uppercase_and_symbols() {
        assert!(matches!(validate_id("Node1"), Err(ValidationError::InvalidChars(_))));
        assert!(matches!(validate_id("node.1"), Err(ValidationError::InvalidChars(_))));
        assert!(matches!(validate_id("node 1"), Err(ValidationError::InvalidChars(_))));
    }

    #[test]
    fn rejects_leading_trailing_separator() {
        assert!(matches!(
            validate_id("-node"),
            Err(ValidationError::LeadingTrailingSeparator(_))
        ));
        assert!(matches!(
            validate_id("node_"),
            Err(ValidationError::LeadingTrailingSeparator(_))
        ));
    }
}
