//! Model router: capability-table driven selection with an ordered fallback
//! chain. Pure selection — the chain is advisory state consumed by the
//! answer generator.

use medpipe_core::{Error, Mode, Modality, ModelRoute, ModelSpec, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelTable {
    pub models: Vec<ModelSpec>,
    /// Try-order for assisted reasoning.
    pub default_chain: Vec<String>,
    /// Try-order for web-grounded answers; falls back to `default_chain`
    /// when empty.
    #[serde(default)]
    pub web_chain: Vec<String>,
}

impl ModelTable {
    /// Built-in table; the curated OpenRouter set the product ships with.
    pub fn builtin() -> Self {
        let models = vec![
            ModelSpec {
                id: "moonshotai/kimi-vl-a3b-thinking:free".to_string(),
                supports_vision: true,
                is_free_tier: true,
                context_window: 131_072,
            },
            ModelSpec {
                id: "openrouter/auto".to_string(),
                supports_vision: false,
                is_free_tier: false,
                context_window: 128_000,
            },
            ModelSpec {
                id: "qwen/qwen2.5-vl-32b-instruct:free".to_string(),
                supports_vision: true,
                is_free_tier: true,
                context_window: 32_768,
            },
            ModelSpec {
                id: "deepseek/deepseek-chat-v3-0324:free".to_string(),
                supports_vision: false,
                is_free_tier: true,
                context_window: 163_840,
            },
        ];
        Self {
            models,
            default_chain: vec![
                "openrouter/auto".to_string(),
                "qwen/qwen2.5-vl-32b-instruct:free".to_string(),
                "deepseek/deepseek-chat-v3-0324:free".to_string(),
                "moonshotai/kimi-vl-a3b-thinking:free".to_string(),
            ],
            web_chain: vec![
                "deepseek/deepseek-chat-v3-0324:free".to_string(),
                "openrouter/auto".to_string(),
                "qwen/qwen2.5-vl-32b-instruct:free".to_string(),
            ],
        }
    }

    /// Builtin table, or the one at `MEDPIPE_MODELS_JSON` when set.
    pub fn from_env() -> Result<Self> {
        let Some(path) = std::env::var("MEDPIPE_MODELS_JSON")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        else {
            return Ok(Self::builtin());
        };
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::NotConfigured(format!("MEDPIPE_MODELS_JSON unreadable: {e}")))?;
        let table: ModelTable = serde_json::from_slice(&bytes)
            .map_err(|e| Error::NotConfigured(format!("MEDPIPE_MODELS_JSON invalid: {e}")))?;
        if table.models.is_empty() || table.default_chain.is_empty() {
            return Err(Error::NotConfigured(
                "MEDPIPE_MODELS_JSON must list models and a default_chain".to_string(),
            ));
        }
        Ok(table)
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.id.as_str()).collect()
    }

    fn is_compatible(&self, id: &str, modality: Modality) -> bool {
        match self.get(id) {
            Some(m) => modality == Modality::Text || m.supports_vision,
            None => false,
        }
    }

    /// Select a primary model and ordered fallback chain.
    ///
    /// The requested model is honored when it exists in the table and matches
    /// the modality; otherwise the mode's chain supplies the primary.
    pub fn route(
        &self,
        mode: Mode,
        modality: Modality,
        requested: Option<&str>,
    ) -> Result<ModelRoute> {
        let chain = if mode == Mode::WebGrounded && !self.web_chain.is_empty() {
            &self.web_chain
        } else {
            &self.default_chain
        };
        let mut eligible: Vec<&str> = Vec::new();
        for id in chain {
            if self.is_compatible(id, modality) && !eligible.contains(&id.as_str()) {
                eligible.push(id);
            }
        }

        let (primary, reason) = match requested {
            Some(req) if self.is_compatible(req, modality) => {
                (req.to_string(), format!("requested model {req}"))
            }
            Some(req) => {
                let Some(first) = eligible.first() else {
                    return Err(Error::NotConfigured(format!(
                        "no configured model supports {modality:?}"
                    )));
                };
                (
                    first.to_string(),
                    format!("requested model {req} unavailable for {modality:?}; using chain"),
                )
            }
            None => {
                let Some(first) = eligible.first() else {
                    return Err(Error::NotConfigured(format!(
                        "no configured model supports {modality:?}"
                    )));
                };
                (first.to_string(), format!("first {mode:?} chain model"))
            }
        };

        let fallbacks: Vec<String> = eligible
            .iter()
            .filter(|id| **id != primary)
            .map(|id| id.to_string())
            .collect();

        Ok(ModelRoute {
            primary,
            fallbacks,
            reason,
        })
    }
}
