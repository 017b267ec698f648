//! Plugin manifest types.
//!
//! A plugin manifest (`plugin.yaml` or `plugin.json` at the plugin root)
//! describes the provider a plugin implements, the services it serves, and
//! the platform executables the gateway may spawn. Manifests are loaded from
//! disk during discovery and validated before the provider is registered.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read manifest at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Neither `plugin.yaml` nor `plugin.json` exists in the plugin directory.
    #[error("no plugin.yaml or plugin.json found in {0}")]
    NotFound(String),

    /// The manifest could not be parsed.
    #[error("failed to parse manifest at {path}: {message}")]
    Parse { path: String, message: String },

    /// The manifest is structurally valid but violates a constraint.
    #[error("invalid manifest for provider '{provider}': {message}")]
    Invalid { provider: String, message: String },
}

/// A plugin manifest loaded from `plugin.yaml` or `plugin.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Provider identity and location.
    pub provider: ProviderSection,
    /// Services this provider serves.
    pub services: Vec<ServiceSection>,
    /// Platform-specific executables, keyed by `{os}_{arch}` (e.g. `linux_amd64`).
    #[serde(default)]
    pub platforms: HashMap<String, PlatformSection>,
}

/// Provider identity within a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    /// Unique provider name (e.g. `local_ollama`).
    pub name: String,
    /// Plugin version string.
    pub version: String,
    /// Whether the provider runs a local engine or fronts a remote API.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Host of the engine the plugin drives, for local providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_host: Option<String>,
}

/// Where a provider's inference actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Locally installed inference engine.
    Local,
    /// Remote cloud API.
    Remote,
}

/// One service entry within a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Service name (chat, embed, text-to-image, ...).
    pub service_name: String,
    /// Task type hint forwarded to the plugin.
    #[serde(default)]
    pub task_type: String,
    /// Protocol the plugin speaks to its backend.
    #[serde(default)]
    pub protocol: WireProtocol,
    /// Protocol the gateway exposes for this service.
    #[serde(default)]
    pub expose_protocol: WireProtocol,
    /// Backend endpoint (URL or engine-relative path).
    #[serde(default)]
    pub endpoint: String,
    /// Authentication style expected by the backend (`none`, `apikey`, ...).
    #[serde(default)]
    pub auth_type: String,
    /// Model used when the caller does not name one.
    #[serde(default)]
    pub default_model: String,
    /// Models the service declares support for.
    #[serde(default)]
    pub support_models: Vec<String>,
    /// Declared invocation capabilities.
    #[serde(default)]
    pub capabilities: ServiceCapabilities,
    /// Invocation timeout in seconds; 0 means use the gateway default.
    #[serde(default)]
    pub timeout_s: u64,
}

/// Declared invocation capabilities of a service.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ServiceCapabilities {
    /// The service can emit server-streamed chunks.
    #[serde(default)]
    pub support_streaming: bool,
    /// The service can drive a bidirectional message exchange.
    #[serde(default)]
    pub support_bidirectional: bool,
}

/// Wire protocols a manifest may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Plain request/response HTTP.
    #[default]
    Http,
    /// gRPC-style framed RPC.
    Grpc,
    /// WebSocket.
    Websocket,
}

/// Platform entry: the executable to spawn for one `{os}_{arch}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    /// Executable path relative to the plugin root.
    pub executable: String,
    /// Additional files the executable needs.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginManifest {
    /// Load a manifest from a plugin directory.
    ///
    /// Looks for `plugin.yaml` first, then `plugin.json`. The loaded manifest
    /// is validated before being returned.
    pub fn load(plugin_dir: &Path) -> Result<Self, ManifestError> {
        let yaml = plugin_dir.join("plugin.yaml");
        let json = plugin_dir.join("plugin.json");

        let manifest = if yaml.exists() {
            let text = std::fs::read_to_string(&yaml).map_err(|source| ManifestError::Io {
                path: yaml.display().to_string(),
                source,
            })?;
            serde_yaml::from_str::<Self>(&text).map_err(|e| ManifestError::Parse {
                path: yaml.display().to_string(),
                message: e.to_string(),
            })?
        } else if json.exists() {
            let text = std::fs::read_to_string(&json).map_err(|source| ManifestError::Io {
                path: json.display().to_string(),
                source,
            })?;
            serde_json::from_str::<Self>(&text).map_err(|e| ManifestError::Parse {
                path: json.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            return Err(ManifestError::NotFound(plugin_dir.display().to_string()));
        };

        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest's structural constraints.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let provider = &self.provider.name;
        if provider.is_empty() {
            return Err(ManifestError::Invalid {
                provider: "<unnamed>".to_string(),
                message: "provider.name must not be empty".to_string(),
            });
        }
        if self.provider.version.is_empty() {
            return Err(ManifestError::Invalid {
                provider: provider.clone(),
                message: "provider.version must not be empty".to_string(),
            });
        }
        if self.services.is_empty() {
            return Err(ManifestError::Invalid {
                provider: provider.clone(),
                message: "at least one service entry is required".to_string(),
            });
        }
        for service in &self.services {
            if service.service_name.is_empty() {
                return Err(ManifestError::Invalid {
                    provider: provider.clone(),
                    message: "service_name must not be empty".to_string(),
                });
            }
        }
        if !self.platforms.contains_key(&current_platform_key()) {
            return Err(ManifestError::Invalid {
                provider: provider.clone(),
                message: format!("no platform entry for {}", current_platform_key()),
            });
        }
        Ok(())
    }

    /// The service entry for a service name, if declared.
    pub fn service(&self, service_name: &str) -> Option<&ServiceSection> {
        self.services.iter().find(|s| s.service_name == service_name)
    }

    /// The executable declared for the current platform.
    pub fn executable(&self) -> Option<&str> {
        self.platforms
            .get(&current_platform_key())
            .map(|p| p.executable.as_str())
    }
}

/// The `{os}_{arch}` key for the running platform.
///
/// Keys follow the widely used `goos_goarch` convention so manifests stay
/// portable across gateway implementations: `linux_amd64`, `darwin_arm64`, ...
pub fn current_platform_key() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{os}_{arch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> String {
        format!(
            r#"
provider:
  name: local_openvino
  version: 0.1.0
  type: local
  engine_host: 127.0.0.1:16666
services:
  - service_name: text-to-image
    task_type: generation
    protocol: http
    expose_protocol: http
    endpoint: /v1/images
    auth_type: none
    default_model: stable-diffusion-v1.5
    support_models: [stable-diffusion-v1.5]
    capabilities:
      support_streaming: true
      support_bidirectional: false
    timeout_s: 120
  - service_name: speech-to-text
    expose_protocol: websocket
    capabilities:
      support_streaming: true
      support_bidirectional: true
platforms:
  {platform}:
    executable: bin/openvino-plugin
    dependencies: [models/]
"#,
            platform = current_platform_key()
        )
    }

    #[test]
    fn test_load_yaml_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plugin.yaml"), sample_yaml()).unwrap();

        let manifest = PluginManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.provider.name, "local_openvino");
        assert_eq!(manifest.provider.kind, ProviderKind::Local);
        assert_eq!(manifest.services.len(), 2);
        assert_eq!(manifest.executable(), Some("bin/openvino-plugin"));

        let stt = manifest.service("speech-to-text").unwrap();
        assert_eq!(stt.expose_protocol, WireProtocol::Websocket);
        assert!(stt.capabilities.support_bidirectional);
    }

    #[test]
    fn test_load_json_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "provider": {"name": "remote_cloud", "version": "1.0.0", "type": "remote"},
            "services": [{"service_name": "chat", "capabilities": {"support_streaming": true}}],
            "platforms": {current_platform_key(): {"executable": "bin/cloud-plugin"}}
        });
        std::fs::write(dir.path().join("plugin.json"), json.to_string()).unwrap();

        let manifest = PluginManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.provider.kind, ProviderKind::Remote);
        assert!(manifest.service("chat").unwrap().capabilities.support_streaming);
    }

    #[test]
    fn test_missing_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PluginManifest::load(dir.path()),
            Err(ManifestError::NotFound(_))
        ));
    }

    #[test]
    fn test_rejects_empty_services() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "provider": {"name": "p", "version": "1", "type": "local"},
            "services": [],
            "platforms": {current_platform_key(): {"executable": "bin/x"}}
        });
        std::fs::write(dir.path().join("plugin.json"), json.to_string()).unwrap();
        assert!(matches!(
            PluginManifest::load(dir.path()),
            Err(ManifestError::Invalid { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_platform() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "provider": {"name": "p", "version": "1", "type": "local"},
            "services": [{"service_name": "chat"}],
            "platforms": {"plan9_mips": {"executable": "bin/x"}}
        });
        std::fs::write(dir.path().join("plugin.json"), json.to_string()).unwrap();
        assert!(matches!(
            PluginManifest::load(dir.path()),
            Err(ManifestError::Invalid { .. })
        ));
    }

    #[test]
    fn test_platform_key_shape() {
        let key = current_platform_key();
        assert!(key.contains('_'));
        assert!(!key.contains("x86_64"), "arch must be mapped to amd64");
    }
}
