//! Package requirement model and pip-style name normalization.

use serde::{Deserialize, Serialize};

/// One requested package: name, optional version constraint, optionality.
///
/// Required failures block environment readiness; optional failures only warn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequirement {
    pub name: String,
    /// Pip constraint suffix such as `==4.43.0` or `>=2.0`; empty = unconstrained.
    #[serde(default)]
    pub version_constraint: String,
    #[serde(default)]
    pub optional: bool,
}

impl PackageRequirement {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version_constraint: String::new(),
            optional: false,
        }
    }

    pub fn optional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version_constraint: String::new(),
            optional: true,
        }
    }

    pub fn pinned(name: &str, constraint: &str) -> Self {
        Self {
            name: name.to_string(),
            version_constraint: constraint.to_string(),
            optional: false,
        }
    }

    /// Normalized form used as the registry key.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// The string handed to pip, e.g. `transformers==4.43.0`.
    pub fn spec_string(&self) -> String {
        if self.version_constraint.is_empty() {
            self.name.clone()
        } else {
            format!("{}{}", self.name, self.version_constraint)
        }
    }
}

/// Normalize a package name the way pip metadata does: case-fold and unify
/// `-`, `_` and `.` separators, so `Foo-Bar`, `foo_bar` and `foo.bar` all
/// resolve to the same tracked package.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '.' { '-' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_variants() {
        assert_eq!(normalize_name("Foo-Bar"), "foo-bar");
        assert_eq!(normalize_name("foo_bar"), "foo-bar");
        assert_eq!(normalize_name("foo.bar"), "foo-bar");
        assert_eq!(normalize_name("  Flash_Attn "), "flash-attn");
    }

    #[test]
    fn test_spec_string() {
        let req = PackageRequirement::pinned("transformers", "==4.43.0");
        assert_eq!(req.spec_string(), "transformers==4.43.0");
        assert_eq!(PackageRequirement::required("torch").spec_string(), "torch");
    }

    #[test]
    fn test_optional_flag() {
        assert!(PackageRequirement::optional("flash-attn").optional);
        assert!(!PackageRequirement::required("torch").optional);
    }
}
