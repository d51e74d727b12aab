//! Model Registry.
//!
//! Maps canonical model names and their aliases to a [`Generator`]. Built once
//! at startup from configuration and shared read-only (`Arc<ModelRegistry>`).
//! Availability is decided at build time from configuration alone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use super::client::OpenAiClient;
use super::config::{ModelsConfig, Provider};
use super::custom::CustomClient;
use super::errors::InferenceError;
use super::generator::Generator;
use super::vertex::VertexClient;

/// Public description of a registered model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub provider: &'static str,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    pub aliases: Vec<String>,
}

struct Entry {
    descriptor: ModelDescriptor,
    generator: Option<Arc<dyn Generator>>,
}

/// Immutable table of models known to the process.
pub struct ModelRegistry {
    entries: BTreeMap<String, Entry>,
    /// Lower-cased name or alias → canonical name.
    lookup: HashMap<String, String>,
    default_model: Option<String>,
}

fn provider_label(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenaiCompatible => "openai_compatible",
        Provider::Vertex => "vertex",
        Provider::Custom => "custom",
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl ModelRegistry {
    /// Build the registry from the `models` configuration section.
    ///
    /// A model whose client cannot be constructed is registered as
    /// unavailable rather than failing startup.
    pub fn from_config(config: &ModelsConfig) -> Result<Self, InferenceError> {
        config.validate()?;
        let mut builder = ModelRegistryBuilder::default();

        for (key, model) in &config.models {
            let aliases: Vec<&str> = model.aliases.iter().map(String::as_str).collect();
            let label = provider_label(model.provider);

            if let Err(reason) = model.availability() {
                tracing::info!(model = %key, reason = %reason, "model registered as unavailable");
                builder = builder.unavailable(key, label, &aliases, &reason);
                continue;
            }

            let client: Result<Arc<dyn Generator>, InferenceError> = match model.provider {
                Provider::OpenaiCompatible => {
                    OpenAiClient::new(key, model).map(|c| Arc::new(c) as Arc<dyn Generator>)
                }
                Provider::Vertex => {
                    VertexClient::new(key, model).map(|c| Arc::new(c) as Arc<dyn Generator>)
                }
                Provider::Custom => {
                    CustomClient::new(key, model).map(|c| Arc::new(c) as Arc<dyn Generator>)
                }
            };

            builder = match client {
                Ok(generator) => builder.model_with_provider(key, label, &aliases, generator),
                Err(e) => {
                    tracing::warn!(model = %key, error = %e, "failed to build model client");
                    builder.unavailable(key, label, &aliases, &e.to_string())
                }
            };
        }

        if let Some(ref default) = config.default_model {
            builder = builder.default_model(default);
        }
        builder.build()
    }

    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    /// Resolve a name or alias to the canonical model name.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        self.lookup
            .get(&normalize(name))
            .and_then(|canonical| self.entries.get_key_value(canonical))
            .map(|(k, _)| k.as_str())
    }

    /// Look up a model by name or alias.
    pub fn resolve(&self, name: &str) -> Result<&ModelDescriptor, InferenceError> {
        self.canonical_name(name)
            .and_then(|c| self.entries.get(c))
            .map(|e| &e.descriptor)
            .ok_or_else(|| InferenceError::UnknownModel {
                name: name.to_string(),
            })
    }

    /// Fetch the generator for a model, failing when it is unavailable.
    pub fn generator(&self, name: &str) -> Result<(String, Arc<dyn Generator>), InferenceError> {
        let descriptor = self.resolve(name)?;
        let entry = &self.entries[&descriptor.name];
        match entry.generator {
            Some(ref generator) if descriptor.available => {
                Ok((descriptor.name.clone(), Arc::clone(generator)))
            }
            _ => Err(InferenceError::ModelUnavailable {
                name: descriptor.name.clone(),
                reason: descriptor
                    .unavailable_reason
                    .clone()
                    .unwrap_or_else(|| "no client configured".into()),
            }),
        }
    }

    /// The model a thread should use: its own selection, else the default.
    pub fn select<'a>(&'a self, thread_model: Option<&'a str>) -> Option<&'a str> {
        thread_model.or(self.default_model.as_deref())
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    /// Canonical name → availability, for the model picker.
    pub fn availability(&self) -> BTreeMap<String, bool> {
        self.entries
            .iter()
            .map(|(name, e)| (name.clone(), e.descriptor.available))
            .collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.entries.values().map(|e| &e.descriptor)
    }
}

/// Builder for [`ModelRegistry`].
#[derive(Default)]
pub struct ModelRegistryBuilder {
    entries: Vec<Entry>,
    default_model: Option<String>,
}

impl ModelRegistryBuilder {
    /// Register an injected generator (scripted replies, test doubles).
    /// It is listed under the `scripted` provider.
    pub fn model(self, name: &str, aliases: &[&str], generator: Arc<dyn Generator>) -> Self {
        self.model_with_provider(name, "scripted", aliases, generator)
    }

    /// Register an available model under an explicit provider label.
    pub fn model_with_provider(
        mut self,
        name: &str,
        provider: &'static str,
        aliases: &[&str],
        generator: Arc<dyn Generator>,
    ) -> Self {
        self.entries.push(Entry {
            descriptor: ModelDescriptor {
                name: name.to_string(),
                provider,
                available: true,
                unavailable_reason: None,
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
            },
            generator: Some(generator),
        });
        self
    }

    /// Register a model that is known but cannot be called.
    pub fn unavailable(
        mut self,
        name: &str,
        provider: &'static str,
        aliases: &[&str],
        reason: &str,
    ) -> Self {
        self.entries.push(Entry {
            descriptor: ModelDescriptor {
                name: name.to_string(),
                provider,
                available: false,
                unavailable_reason: Some(reason.to_string()),
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
            },
            generator: None,
        });
        self
    }

    pub fn default_model(mut self, name: &str) -> Self {
        self.default_model = Some(name.to_string());
        self
    }

    pub fn build(self) -> Result<ModelRegistry, InferenceError> {
        let mut entries = BTreeMap::new();
        let mut lookup = HashMap::new();

        for entry in self.entries {
            let name = entry.descriptor.name.clone();
            for key in std::iter::once(&name).chain(entry.descriptor.aliases.iter()) {
                if let Some(previous) = lookup.insert(normalize(key), name.clone()) {
                    if previous != name {
                        return Err(InferenceError::ConfigError {
                            reason: format!("'{key}' refers to both '{previous}' and '{name}'"),
                        });
                    }
                }
            }
            entries.insert(name, entry);
        }

        let mut registry = ModelRegistry {
            entries,
            lookup,
            default_model: None,
        };

        if let Some(default) = self.default_model {
            let canonical = registry
                .canonical_name(&default)
                .map(String::from)
                .ok_or_else(|| InferenceError::ConfigError {
                    reason: format!("default model '{default}' is not registered"),
                })?;
            registry.default_model = Some(canonical);
        }

        Ok(registry)
    }
}
