use crate::config::Backend;
use crate::entity::Entity;
use crate::errors::Result;
use crate::mapping::EntityType;
use serde::Serialize;

/// Result of a successful upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// Nothing to persist; no query was issued.
    NoOp,
    Inserted { id: i64 },
    /// Zero rows is still a success.
    Updated { rows: usize },
}

impl UpsertOutcome {
    pub fn inserted_id(&self) -> Option<i64> {
        match self {
            UpsertOutcome::Inserted { id } => Some(*id),
            _ => None,
        }
    }
}

/// Capability interface shared by the relational and legacy representations.
///
/// Both implementations must answer the query methods identically for the
/// same underlying data.
pub trait EntityStore: Send + Sync {
    fn backend(&self) -> Backend;

    fn load(&self, entity_type: EntityType, id: i64) -> Result<Option<Entity>>;

    /// Persists the entity, assigning an ID when it has none, and clears its
    /// tracked changes on success.
    fn save(&self, entity: &mut Entity) -> Result<UpsertOutcome>;

    /// Returns whether anything was removed.
    fn delete(&self, entity_type: EntityType, id: i64) -> Result<bool>;

    fn order_count(&self, status: &str) -> Result<i64>;

    /// Pending orders last modified strictly before `before` (unix seconds), ascending.
    fn unpaid_orders(&self, before: i64) -> Result<Vec<i64>>;

    fn search_orders(&self, term: &str) -> Result<Vec<i64>>;
}

/// Numeric search terms always match as a literal order ID.
pub(crate) fn numeric_term(term: &str) -> Option<i64> {
    let term = term.trim();
    if !term.is_empty() && term.chars().all(|c| c.is_ascii_digit()) {
        term.parse().ok()
    } else {
        None
    }
}

/// Escapes `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_terms() {
        assert_eq!(numeric_term("123"), Some(123));
        assert_eq!(numeric_term(" 42 "), Some(42));
        assert_eq!(numeric_term("12a"), None);
        assert_eq!(numeric_term("-5"), None);
        assert_eq!(numeric_term(""), None);
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(like_pattern("search"), "%search%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn outcome_ids() {
        assert_eq!(UpsertOutcome::Inserted { id: 5 }.inserted_id(), Some(5));
        assert_eq!(UpsertOutcome::Updated { rows: 0 }.inserted_id(), None);
    }
}
