const DENIED_FIELDS: &[&str] = &["email", "userId"];
const DENIED_SUFFIXES: &[&str] = &["_state"];

/// Always-on exclusion of PII and internal columns from API output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicy {
    denied_fields: Vec<String>,
    denied_suffixes: Vec<String>,
}

impl Default for FieldPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl FieldPolicy {
    pub fn standard() -> Self {
        let mut denied_fields = DENIED_FIELDS
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        denied_fields.sort();

        Self {
            denied_fields,
            denied_suffixes: DENIED_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Exact, case-sensitive match on names; suffix match on `_state`.
    pub fn allowed(&self, column: &str) -> bool {
        if self
            .denied_fields
            .binary_search_by(|f| f.as_str().cmp(column))
            .is_ok()
        {
            return false;
        }
        !self
            .denied_suffixes
            .iter()
            .any(|suffix| column.ends_with(suffix.as_str()))
    }

    pub fn apply_to_field_list(&self, fields: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            if self.allowed(field.as_str()) {
                out.push(field.clone());
            }
        }
        out
    }
}
