//! Provider family catalog.
//!
//! Providers map onto known families by name-fragment; each family
//! contributes baseline + family-specific + hardware-specific package
//! requirements. This is a fixed table, not dependency resolution.

use envlite_core::requirements::{normalize_name, PackageRequirement};

use crate::gpu::GpuBackend;

#[derive(Debug, Clone)]
pub struct ProviderFamily {
    /// Family key, also the per-family identity base.
    pub key: String,
    /// Whether this family runs models locally and needs the tensor runtime.
    pub hardware_sensitive: bool,
}

struct FamilySpec {
    key: &'static str,
    fragments: &'static [&'static str],
    hardware_sensitive: bool,
    /// Family-specific requirements as (name, constraint, optional).
    extras: &'static [(&'static str, &'static str, bool)],
}

// Fragment matching is first-hit, so more specific families come first
// (e.g. "azure" before the bare "openai" fragments would if both listed it).
const FAMILIES: &[FamilySpec] = &[
    FamilySpec {
        key: "phi",
        fragments: &["phi"],
        hardware_sensitive: true,
        // transformers 4.44+ changed the phi-3 rope-scaling config; pin until rebaselined.
        extras: &[("transformers", "==4.43.0", false), ("einops", "", false)],
    },
    FamilySpec {
        key: "llama",
        fragments: &["llama", "meta"],
        hardware_sensitive: true,
        extras: &[
            ("transformers", "", false),
            ("sentencepiece", "", false),
        ],
    },
    FamilySpec {
        key: "mistral",
        fragments: &["mistral", "mixtral"],
        hardware_sensitive: true,
        extras: &[
            ("transformers", "", false),
            ("sentencepiece", "", false),
            ("protobuf", "", false),
        ],
    },
    FamilySpec {
        key: "gemma",
        fragments: &["gemma"],
        hardware_sensitive: true,
        extras: &[
            ("transformers", "", false),
            ("sentencepiece", "", false),
        ],
    },
    FamilySpec {
        key: "huggingface",
        fragments: &["huggingface", "hf"],
        hardware_sensitive: true,
        extras: &[
            ("transformers", "", false),
            ("tokenizers", "", false),
            ("huggingface-hub", "", false),
        ],
    },
    FamilySpec {
        key: "openai",
        fragments: &["azure", "openai", "gpt"],
        hardware_sensitive: false,
        extras: &[("openai", "", false), ("tiktoken", "", false)],
    },
    FamilySpec {
        key: "google",
        fragments: &["google", "gemini"],
        hardware_sensitive: false,
        extras: &[("google-generativeai", "", false)],
    },
    FamilySpec {
        key: "cohere",
        fragments: &["cohere", "command-r"],
        hardware_sensitive: false,
        extras: &[("cohere", "", false)],
    },
];

/// Baseline for every family that runs models locally.
const LOCAL_BASELINE: &[(&str, &str, bool)] = &[
    ("torch", "", false),
    ("numpy", "", false),
    ("safetensors", "", false),
    ("accelerate", "", false),
];

/// Match a provider name onto its family.
///
/// Unknown providers get a local-model family of their own: the baseline
/// stack under a normalized key, so provisioning still works for providers
/// added upstream before this table learns about them.
pub fn resolve_family(provider: &str) -> ProviderFamily {
    let needle = provider.trim().to_lowercase();
    for spec in FAMILIES {
        if spec.fragments.iter().any(|f| needle.contains(f)) {
            return ProviderFamily {
                key: spec.key.to_string(),
                hardware_sensitive: spec.hardware_sensitive,
            };
        }
    }
    tracing::debug!(provider, "No family match, treating as local-model provider");
    ProviderFamily {
        key: normalize_name(&needle),
        hardware_sensitive: true,
    }
}

/// Full requirement set for a family on the given backend.
pub fn requirements_for(family: &ProviderFamily, backend: GpuBackend) -> Vec<PackageRequirement> {
    let mut reqs: Vec<PackageRequirement> = Vec::new();
    let mut push = |name: &str, constraint: &str, optional: bool| {
        if reqs.iter().any(|r: &PackageRequirement| r.normalized_name() == normalize_name(name)) {
            return;
        }
        reqs.push(PackageRequirement {
            name: name.to_string(),
            version_constraint: constraint.to_string(),
            optional,
        });
    };

    if family.hardware_sensitive {
        for &(name, constraint, optional) in LOCAL_BASELINE {
            push(name, constraint, optional);
        }
    }

    if let Some(spec) = FAMILIES.iter().find(|s| s.key == family.key) {
        for &(name, constraint, optional) in spec.extras {
            push(name, constraint, optional);
        }
    } else if family.hardware_sensitive {
        // Unknown local family still gets a tokenizer-capable stack.
        push("transformers", "", false);
    }

    if family.hardware_sensitive {
        match backend {
            GpuBackend::Cuda => {
                push("bitsandbytes", "", true);
                push("flash-attn", "", true);
            }
            GpuBackend::Rocm => {
                push("bitsandbytes", "", true);
            }
            GpuBackend::Vulkan | GpuBackend::Cpu => {}
        }
    }

    reqs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_matching() {
        assert_eq!(resolve_family("phi").key, "phi");
        assert_eq!(resolve_family("Phi-3.5-vision").key, "phi");
        assert_eq!(resolve_family("meta-llama").key, "llama");
        assert_eq!(resolve_family("Azure OpenAI").key, "openai");
        assert_eq!(resolve_family("google-gemini-pro").key, "google");
        assert!(!resolve_family("openai").hardware_sensitive);
        assert!(resolve_family("mixtral-8x7b").hardware_sensitive);
    }

    #[test]
    fn test_unknown_provider_gets_local_stack() {
        let family = resolve_family("Some_New.Provider");
        assert!(family.hardware_sensitive);
        assert_eq!(family.key, "some-new-provider");
        let reqs = requirements_for(&family, GpuBackend::Cpu);
        assert!(reqs.iter().any(|r| r.name == "torch" && !r.optional));
    }

    #[test]
    fn test_phi_pins_transformers() {
        let family = resolve_family("phi");
        let reqs = requirements_for(&family, GpuBackend::Cuda);
        let transformers = reqs.iter().find(|r| r.name == "transformers").unwrap();
        assert_eq!(transformers.version_constraint, "==4.43.0");
        assert!(!transformers.optional);
        assert!(reqs.iter().any(|r| r.name == "torch"));
    }

    #[test]
    fn test_cuda_additions_are_optional() {
        let family = resolve_family("llama");
        let cuda = requirements_for(&family, GpuBackend::Cuda);
        let flash = cuda.iter().find(|r| r.name == "flash-attn").unwrap();
        assert!(flash.optional);

        let cpu = requirements_for(&family, GpuBackend::Cpu);
        assert!(!cpu.iter().any(|r| r.name == "flash-attn"));
    }

    #[test]
    fn test_api_families_skip_torch() {
        let family = resolve_family("cohere");
        let reqs = requirements_for(&family, GpuBackend::Cuda);
        assert!(!reqs.iter().any(|r| r.name == "torch"));
        assert!(reqs.iter().any(|r| r.name == "cohere"));
    }
}
