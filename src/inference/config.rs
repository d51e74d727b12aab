//! Model configuration.
//!
//! The `models` section of `aigis.yaml` declares every model the registry
//! knows about, which provider speaks to it, and the aliases users may type.
//! When the section is absent the built-in table (LM Studio Qwen / GPT-OSS and
//! DeepSeek) is used.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::errors::InferenceError;

/// Default LM Studio endpoint when `LM_STUDIO_ENDPOINT` is unset.
pub const DEFAULT_LM_STUDIO_ENDPOINT: &str = "http://0.0.0.0:1234/v1";

/// DeepSeek's OpenAI-compatible endpoint.
pub const DEEPSEEK_ENDPOINT: &str = "https://api.deepseek.com/v1";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which wire protocol a model is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// OpenAI Chat Completions with SSE streaming (LM Studio, DeepSeek, vLLM).
    OpenaiCompatible,
    /// `generateContent`-style JSON API.
    Vertex,
    /// Plain JSON POST returning `{text, tool_calls}`.
    Custom,
}

/// A single model's configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub provider: Provider,
    /// Identifier sent on the wire. Defaults to the registry key.
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// When `true`, an empty `api_key` makes the model unavailable.
    #[serde(default)]
    pub api_key_required: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    /// Check whether this model can be called right now.
    ///
    /// Returns the reason it cannot when unavailable. Connectivity is not
    /// probed: an endpoint that is configured but down surfaces as a model
    /// error at call time.
    pub fn availability(&self) -> Result<(), String> {
        if !self.enabled {
            return Err("disabled in configuration".into());
        }
        let has_url = non_empty(&self.base_url);
        let has_key = non_empty(&self.api_key);
        match self.provider {
            Provider::OpenaiCompatible | Provider::Custom if !has_url => {
                Err("base_url is not set".into())
            }
            Provider::OpenaiCompatible | Provider::Custom if self.api_key_required && !has_key => {
                Err("api_key is not set".into())
            }
            Provider::Vertex if !has_url => Err("base_url is not set".into()),
            Provider::Vertex if !has_key => Err("api_key is not set".into()),
            _ => Ok(()),
        }
    }

    /// Resolve the wire model identifier.
    pub fn wire_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.model_name.as_deref().unwrap_or(key)
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// The `models` section of the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Model used when a thread has not selected one.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelsConfig {
    /// The model table of the original deployment: two LM Studio models and
    /// DeepSeek. Endpoints and keys come from the environment.
    pub fn builtin() -> Self {
        let lm_studio = std::env::var("LM_STUDIO_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_LM_STUDIO_ENDPOINT.to_string());
        let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();

        let local = |wire: &str, aliases: &[&str]| ModelConfig {
            provider: Provider::OpenaiCompatible,
            model_name: Some(wire.to_string()),
            base_url: Some(lm_studio.clone()),
            api_key: None,
            api_key_required: false,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            enabled: true,
        };

        let mut models = BTreeMap::new();
        models.insert("qwen3-8b".to_string(), local("qwen/qwen3-8b", &["qwen"]));
        models.insert(
            "gpt-oss-20b".to_string(),
            local("openai/gpt-oss-20b", &["gpt_oss", "gpt-oss"]),
        );
        models.insert(
            "deepseek-chat".to_string(),
            ModelConfig {
                provider: Provider::OpenaiCompatible,
                model_name: None,
                base_url: Some(DEEPSEEK_ENDPOINT.to_string()),
                api_key: deepseek_key,
                api_key_required: true,
                aliases: vec!["deepseek".to_string()],
                temperature: 0.0,
                max_tokens: default_max_tokens(),
                enabled: true,
            },
        );

        Self {
            default_model: None,
            models,
        }
    }

    /// Check for aliases that collide with each other or with model names.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for key in self.models.keys() {
            seen.insert(key.as_str(), key.as_str());
        }
        for (key, model) in &self.models {
            for alias in &model.aliases {
                if let Some(owner) = seen.insert(alias.as_str(), key.as_str()) {
                    if owner != key {
                        return Err(InferenceError::ConfigError {
                            reason: format!(
                                "alias '{alias}' of '{key}' is already used by '{owner}'"
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        match std::env::var(var_name) {
            Ok(v) if !v.is_empty() => v,
            _ => expand_tilde(default),
        }
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__AIGIS_TEST_NONEXISTENT_VAR__");
        let result = interpolate_env_vars("${__AIGIS_TEST_NONEXISTENT_VAR__:-http://localhost:1234/v1}");
        assert_eq!(result, "http://localhost:1234/v1");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__AIGIS_TEST_INFERENCE_VAR__", "http://lmstudio:1234/v1");
        let result = interpolate_env_vars("${__AIGIS_TEST_INFERENCE_VAR__:-http://fallback/v1}");
        assert_eq!(result, "http://lmstudio:1234/v1");
        std::env::remove_var("__AIGIS_TEST_INFERENCE_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/aigis");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/aigis"));
    }

    #[test]
    fn test_builtin_table_has_original_aliases() {
        let config = ModelsConfig::builtin();
        assert_eq!(config.models["qwen3-8b"].aliases, vec!["qwen"]);
        assert!(config.models["gpt-oss-20b"].aliases.contains(&"gpt_oss".to_string()));
        assert_eq!(config.models["deepseek-chat"].aliases, vec!["deepseek"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_availability_rules() {
        let yaml = r#"
            models:
              local:
                provider: openai_compatible
                base_url: "http://localhost:1234/v1"
              keyed:
                provider: openai_compatible
                base_url: "https://api.example.com/v1"
                api_key: ""
                api_key_required: true
              vertex:
                provider: vertex
                base_url: "https://vertex.example.com/v1"
              custom:
                provider: custom
        "#;
        let config: ModelsConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.models["local"].availability().is_ok());
        assert_eq!(
            config.models["keyed"].availability().unwrap_err(),
            "api_key is not set"
        );
        assert!(config.models["vertex"].availability().is_err());
        assert_eq!(
            config.models["custom"].availability().unwrap_err(),
            "base_url is not set"
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_alias() {
        let yaml = r#"
            models:
              a: { provider: custom, base_url: "http://a", aliases: [shared] }
              b: { provider: custom, base_url: "http://b", aliases: [shared] }
        "#;
        let config: ModelsConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wire_name_defaults_to_key() {
        let config = ModelsConfig::builtin();
        assert_eq!(config.models["deepseek-chat"].wire_name("deepseek-chat"), "deepseek-chat");
        assert_eq!(config.models["qwen3-8b"].wire_name("qwen3-8b"), "qwen/qwen3-8b");
    }
}
