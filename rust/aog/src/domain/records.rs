//! Persistent rows: services, service providers, and models.
//!
//! These mirror the datastore tables. Dispatch reads them; the admin API and
//! plugin discovery write them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::HybridPolicy;

/// Whether a provider's inference runs locally or in a cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceSource {
    /// Locally installed engine.
    Local,
    /// Remote cloud API.
    Remote,
}

impl ServiceSource {
    /// The stable column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    /// Parse a column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// How a provider was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderScope {
    /// Shipped with the gateway.
    Builtin,
    /// Discovered from a plugin manifest.
    Plugin,
}

impl ProviderScope {
    /// The stable column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Plugin => "plugin",
        }
    }

    /// Parse a column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "builtin" => Some(Self::Builtin),
            "plugin" => Some(Self::Plugin),
            _ => None,
        }
    }
}

/// Download state of a model row. Dispatch considers only `Downloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// Pull in progress.
    Downloading,
    /// Ready to serve.
    Downloaded,
    /// Pull failed.
    Failed,
}

impl ModelStatus {
    /// The stable column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        }
    }

    /// Parse a column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "downloading" => Some(Self::Downloading),
            "downloaded" => Some(Self::Downloaded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An installed service and its routing preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service name (chat, embed, ...).
    pub name: String,
    /// Local/remote preference applied when the caller does not specify one.
    pub hybrid_policy: HybridPolicy,
    /// Preferred remote provider name.
    pub remote_provider: Option<String>,
    /// Preferred local provider name.
    pub local_provider: Option<String>,
    /// Row status; 1 = healthy.
    pub status: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// A fresh healthy record.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            hybrid_policy: HybridPolicy::Default,
            remote_provider: None,
            local_provider: None,
            status: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A registered provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProviderRecord {
    /// Unique provider name.
    pub provider_name: String,
    /// Service this provider serves.
    pub service_name: String,
    /// Where the provider's inference runs.
    pub service_source: ServiceSource,
    /// API flavor of the provider.
    pub flavor: String,
    /// Authentication style (`none`, `apikey`, ...).
    pub auth_type: String,
    /// Credential forwarded to the provider verbatim.
    pub auth_key: String,
    /// Backend URL.
    pub url: String,
    /// Registration scope.
    pub scope: ProviderScope,
    /// Extra provider properties as a JSON object string.
    pub properties: String,
    /// Row status; 1 = healthy.
    pub status: i64,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl ServiceProviderRecord {
    /// A minimal healthy record; the builder methods fill the rest.
    pub fn new(
        provider_name: impl Into<String>,
        service_name: impl Into<String>,
        source: ServiceSource,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            service_name: service_name.into(),
            service_source: source,
            flavor: String::new(),
            auth_type: "none".to_string(),
            auth_key: String::new(),
            url: String::new(),
            scope: ProviderScope::Builtin,
            properties: "{}".to_string(),
            status: 1,
            updated_at: Utc::now(),
        }
    }

    /// Set the flavor.
    #[must_use]
    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = flavor.into();
        self
    }

    /// Set the registration scope.
    #[must_use]
    pub fn with_scope(mut self, scope: ProviderScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the backend URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// A model known to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Model name as the provider knows it.
    pub model_name: String,
    /// Owning provider.
    pub provider_name: String,
    /// Service the model serves.
    pub service_name: String,
    /// Where the model runs.
    pub service_source: ServiceSource,
    /// Download state.
    pub status: ModelStatus,
    /// Preferred default for its service.
    pub is_default: bool,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl ModelRecord {
    /// A downloaded, non-default record.
    pub fn downloaded(
        model_name: impl Into<String>,
        provider_name: impl Into<String>,
        service_name: impl Into<String>,
        source: ServiceSource,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            provider_name: provider_name.into(),
            service_name: service_name.into(),
            service_source: source,
            status: ModelStatus::Downloaded,
            is_default: false,
            updated_at: Utc::now(),
        }
    }
}
