//! Provider kinds, their defaults and endpoint URLs.
//!
//! This module handles differences between `OpenAI`-compatible API providers:
//! default base URLs and URL patterns.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-08-01-preview";

/// Supported provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// `OpenAI` (api.openai.com)
    OpenAI,
    /// Azure `OpenAI` Service
    #[serde(alias = "azure_openai")]
    Azure,
    /// `OpenRouter` (openrouter.ai)
    OpenRouter,
    /// Together AI (together.ai, together.xyz)
    Together,
    /// Groq (groq.com)
    Groq,
    /// `DeepSeek` (deepseek.com)
    DeepSeek,
    /// Generic OpenAI-compatible provider
    Generic,
    /// Deterministic offline provider
    Mock,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Azure => "azure",
            Self::OpenRouter => "openrouter",
            Self::Together => "together",
            Self::Groq => "groq",
            Self::DeepSeek => "deepseek",
            Self::Generic => "generic",
            Self::Mock => "mock",
        }
    }

    /// Base URL (including the version segment) used when none is configured.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Together => "https://api.together.xyz/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::Generic => "http://localhost:11434/v1",
            Self::Azure | Self::Mock => "",
        }
    }

    /// Build the chat completions URL for this provider.
    ///
    /// Azure routes by deployment instead of by model.
    #[must_use]
    pub fn build_chat_url(
        self,
        base_url: &str,
        deployment_name: Option<&str>,
        api_version: Option<&str>,
    ) -> String {
        self.build_url(base_url, "chat/completions", deployment_name, api_version)
    }

    /// Build the embeddings URL for this provider.
    #[must_use]
    pub fn build_embeddings_url(
        self,
        base_url: &str,
        deployment_name: Option<&str>,
        api_version: Option<&str>,
    ) -> String {
        self.build_url(base_url, "embeddings", deployment_name, api_version)
    }

    fn build_url(
        self,
        base_url: &str,
        endpoint: &str,
        deployment_name: Option<&str>,
        api_version: Option<&str>,
    ) -> String {
        let base = base_url.trim_end_matches('/');

        match self {
            Self::Azure => {
                let deployment = deployment_name.unwrap_or_default();
                let version = api_version.unwrap_or(DEFAULT_AZURE_API_VERSION);
                format!("{base}/openai/deployments/{deployment}/{endpoint}?api-version={version}")
            }
            _ => format!("{base}/{endpoint}"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "azure" | "azure_openai" => Ok(Self::Azure),
            "openrouter" => Ok(Self::OpenRouter),
            "together" => Ok(Self::Together),
            "groq" => Ok(Self::Groq),
            "deepseek" => Ok(Self::DeepSeek),
            "generic" => Ok(Self::Generic),
            "mock" => Ok(Self::Mock),
            other => Err(CoreError::Config(format!("unsupported LLM provider: {other}"))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_openai() {
        let url = ProviderKind::OpenAI.build_chat_url("https://api.openai.com/v1/", None, None);
        assert_eq!(url, "https://api.openai.com/v1/chat/completions");
        let url = ProviderKind::OpenAI.build_embeddings_url("https://api.openai.com/v1", None, None);
        assert_eq!(url, "https://api.openai.com/v1/embeddings");
    }

    #[test]
    fn test_build_url_azure() {
        let url = ProviderKind::Azure.build_chat_url(
            "https://my-resource.openai.azure.com",
            Some("gpt-4"),
            None,
        );
        assert_eq!(
            url,
            "https://my-resource.openai.azure.com/openai/deployments/gpt-4/chat/completions?api-version=2024-08-01-preview"
        );
    }

    #[test]
    fn test_parse_kinds() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAI);
        assert_eq!("mock".parse::<ProviderKind>().unwrap(), ProviderKind::Mock);
        assert!("bedrock".parse::<ProviderKind>().is_err());
    }
}
