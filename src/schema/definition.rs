use serde::{Deserialize, Serialize};

/// Static description of one module: its fields and their constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub key: String,
    pub label: String,
    pub order: u32,
    #[serde(default)]
    pub description: Option<String>,
    pub fields: Vec<FieldDefinition>,
}

/// A single field within a module definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Default guidance handed to the refine prompt for this field.
    #[serde(default)]
    pub focus: Option<String>,
}

/// Why a field value fails its definition at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldViolation {
    Missing,
    TooLong { max: usize, actual: usize },
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => f.write_str("is required"),
            Self::TooLong { max, actual } => {
                write!(f, "is {actual} characters long (maximum {max})")
            }
        }
    }
}

impl ModuleDefinition {
    pub fn field(&self, key: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.required)
    }
}

impl FieldDefinition {
    /// Publish-time check. Only required fields are checked; a required
    /// field must be present, not blank, and within `max_length` characters.
    pub fn violation(&self, value: Option<&str>) -> Option<FieldViolation> {
        if !self.required {
            return None;
        }
        let value = value.map(str::trim).unwrap_or_default();
        if value.is_empty() {
            return Some(FieldViolation::Missing);
        }
        let actual = value.chars().count();
        match self.max_length {
            Some(max) if actual > max => Some(FieldViolation::TooLong { max, actual }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(required: bool, max: Option<usize>) -> FieldDefinition {
        FieldDefinition {
            key: "climate".to_string(),
            label: "Climate".to_string(),
            required,
            min_length: None,
            max_length: max,
            focus: None,
        }
    }

    #[test]
    fn optional_field_never_violates() {
        assert_eq!(field(false, Some(2)).violation(None), None);
        assert_eq!(field(false, Some(2)).violation(Some("toolong")), None);
    }

    #[test]
    fn required_missing_or_blank() {
        assert_eq!(field(true, None).violation(None), Some(FieldViolation::Missing));
        assert_eq!(field(true, None).violation(Some("   ")), Some(FieldViolation::Missing));
        assert_eq!(field(true, None).violation(Some("arid")), None);
    }

    #[test]
    fn required_too_long() {
        assert_eq!(
            field(true, Some(3)).violation(Some("arid")),
            Some(FieldViolation::TooLong { max: 3, actual: 4 })
        );
        assert_eq!(field(true, Some(4)).violation(Some("arid")), None);
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        assert_eq!(field(true, Some(3)).violation(Some("äöü")), None);
    }
}
