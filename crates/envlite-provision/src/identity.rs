//! Environment identity: deterministic names from provider/model/strategy.
//!
//! The identity doubles as registry key and on-disk directory name, so it
//! must be filesystem-safe and stable across runs.

use sha2::{Digest, Sha256};

/// How environments are shared between providers and models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingStrategy {
    /// One shared environment for everything.
    Single,
    /// One environment per provider family (default).
    PerFamily,
    /// One environment per model.
    PerModel,
}

impl NamingStrategy {
    /// `ENVLITE_NAMING_STRATEGY`: `single` | `family` | `per-model`.
    pub fn from_env() -> Self {
        match envlite_core::config::env_optional("ENVLITE_NAMING_STRATEGY").as_deref() {
            Some("single") => Self::Single,
            Some("per-model") | Some("per_model") => Self::PerModel,
            Some("family") | None => Self::PerFamily,
            Some(other) => {
                tracing::warn!(value = other, "Unknown ENVLITE_NAMING_STRATEGY, using per-family");
                Self::PerFamily
            }
        }
    }
}

const SHARED_NAME: &str = "shared";
const MAX_SLUG_LEN: usize = 40;

/// Filesystem-safe slug for a model name.
///
/// Lowercased, non-alphanumerics collapsed to `-`; pathological names fall
/// back to a short content hash so the result stays deterministic.
pub fn model_slug(model: &str) -> String {
    let mut slug = String::with_capacity(model.len());
    let mut last_dash = true;
    for c in model.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() || slug.len() > MAX_SLUG_LEN {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        return hex::encode(hasher.finalize())[..8].to_string();
    }
    slug
}

/// Identity before the backend suffix is applied.
///
/// Same inputs + strategy always yield the same string.
pub fn base_identity(family: &str, model: Option<&str>, strategy: NamingStrategy) -> String {
    match strategy {
        NamingStrategy::Single => SHARED_NAME.to_string(),
        NamingStrategy::PerFamily => family.to_string(),
        NamingStrategy::PerModel => match model {
            Some(model) => format!("{}-{}", family, model_slug(model)),
            None => family.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_deterministic() {
        let a = base_identity("phi", Some("phi-3.5"), NamingStrategy::PerModel);
        let b = base_identity("phi", Some("phi-3.5"), NamingStrategy::PerModel);
        assert_eq!(a, b);
    }

    #[test]
    fn test_strategies() {
        assert_eq!(base_identity("phi", Some("phi-3.5"), NamingStrategy::Single), "shared");
        assert_eq!(base_identity("phi", Some("phi-3.5"), NamingStrategy::PerFamily), "phi");
        assert_eq!(
            base_identity("phi", Some("phi-3.5"), NamingStrategy::PerModel),
            "phi-phi-3-5"
        );
        assert_eq!(base_identity("phi", None, NamingStrategy::PerModel), "phi");
    }

    #[test]
    fn test_model_slug() {
        assert_eq!(model_slug("Phi-3.5-mini"), "phi-3-5-mini");
        assert_eq!(model_slug("meta/Llama_3:8b"), "meta-llama-3-8b");
        // Pathological names hash deterministically
        let long = "x".repeat(120);
        let slug = model_slug(&long);
        assert_eq!(slug.len(), 8);
        assert_eq!(slug, model_slug(&long));
        assert_eq!(model_slug("///"), model_slug("///"));
    }
}
