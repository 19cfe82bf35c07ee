use std::env;

/// Rate/quota ceilings for one provider. 0 = unbounded on that dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderLimits {
    /// Requests per minute
    pub rpm: u64,
    /// Tokens per minute
    pub tpm: u64,
    /// Requests per day
    pub rpd: u64,
    /// Tokens per day
    pub tpd: u64,
}

/// Immutable, compiled-in description of one backend provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: &'static str,
    pub display_name: &'static str,
    pub model_id: &'static str,
    /// Env var holding the API key; presence makes the provider available
    pub credential_key: &'static str,
    /// OpenAI-compatible API base (".../chat/completions" is appended)
    pub base_url: &'static str,
    pub limits: ProviderLimits,
    pub description: &'static str,
}

/// The deployed provider set, free-tier ceilings as published by each vendor.
static BUILTIN_PROVIDERS: &[ProviderDescriptor] = &[
    ProviderDescriptor {
        id: "gemini",
        display_name: "Gemini Flash",
        model_id: "gemini-2.0-flash",
        credential_key: "GEMINI_API_KEY",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
        limits: ProviderLimits {
            rpm: 10,
            tpm: 250_000,
            rpd: 250,
            tpd: 0,
        },
        description: "Google Gemini 2.0 Flash via the OpenAI-compatible endpoint",
    },
    ProviderDescriptor {
        id: "mistral",
        display_name: "Mistral Small",
        model_id: "mistral-small-latest",
        credential_key: "MISTRAL_API_KEY",
        base_url: "https://api.mistral.ai/v1",
        limits: ProviderLimits {
            rpm: 30,
            tpm: 500_000,
            rpd: 1_000,
            tpd: 0,
        },
        description: "Mistral Small on La Plateforme",
    },
    ProviderDescriptor {
        id: "groq-70b",
        display_name: "Llama 3.3 70B (Groq)",
        model_id: "llama-3.3-70b-versatile",
        credential_key: "GROQ_API_KEY",
        base_url: "https://api.groq.com/openai/v1",
        limits: ProviderLimits {
            rpm: 30,
            tpm: 12_000,
            rpd: 1_000,
            tpd: 100_000,
        },
        description: "Llama 3.3 70B served by Groq",
    },
    ProviderDescriptor {
        id: "groq-8b",
        display_name: "Llama 3.1 8B (Groq)",
        model_id: "llama-3.1-8b-instant",
        credential_key: "GROQ_API_KEY",
        base_url: "https://api.groq.com/openai/v1",
        limits: ProviderLimits {
            rpm: 30,
            tpm: 6_000,
            rpd: 14_400,
            tpd: 500_000,
        },
        description: "Llama 3.1 8B served by Groq, last-resort fallback",
    },
];

/// Static provider lookup. No mutable state; availability is derived from
/// credential presence on every call, never cached.
pub struct ProviderCatalog {
    providers: Vec<ProviderDescriptor>,
}

impl ProviderCatalog {
    pub fn builtin() -> Self {
        Self::new(BUILTIN_PROVIDERS.to_vec())
    }

    pub fn new(providers: Vec<ProviderDescriptor>) -> Self {
        let mut seen = std::collections::HashSet::new();
        for p in &providers {
            assert!(seen.insert(p.id), "duplicate provider id: {}", p.id);
        }
        Self { providers }
    }

    /// Look up a descriptor. An unknown id is a programming error, not a
    /// runtime condition — every id reaching this point came from the
    /// catalog itself or from validated settings.
    pub fn get(&self, id: &str) -> &ProviderDescriptor {
        self.providers
            .iter()
            .find(|p| p.id == id)
            .unwrap_or_else(|| panic!("unknown provider id: {id}"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.iter().any(|p| p.id == id)
    }

    pub fn all(&self) -> &[ProviderDescriptor] {
        &self.providers
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id.to_string()).collect()
    }

    /// A provider is available iff its credential env var is set and non-empty.
    pub fn is_available(&self, id: &str) -> bool {
        let desc = self.get(id);
        env::var(desc.credential_key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn available_ids(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| self.is_available(p.id))
            .map(|p| p.id.to_string())
            .collect()
    }
}
