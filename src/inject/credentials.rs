//! Credential providers
//!
//! Identity material is never baked into a service definition. Each
//! `x-credentials` entry becomes a provider that runs at every start
//! attempt, so material refreshed on the host reaches restarted processes.

use super::Injection;
use crate::compose::config::CredentialConfig;
use crate::error::{Result, TandemError};
use crate::service::binding::resolve_source;
use crate::service::{MountBinding, MountSource};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Contributes secret material to one start attempt
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Provider kind, for logs
    fn kind(&self) -> &'static str;

    /// Add environment variables or mounts to `injection`
    async fn provide(&self, service: &str, injection: &mut Injection) -> Result<()>;
}

/// Build the provider for one manifest entry
pub fn provider_for(
    service: &str,
    config: &CredentialConfig,
    working_dir: &Path,
) -> Result<Box<dyn CredentialProvider>> {
    match config {
        CredentialConfig::Mount {
            source,
            target,
            read_only,
        } => {
            if !target.starts_with('/') {
                return Err(TandemError::InvalidBinding {
                    service: service.to_string(),
                    kind: "credential mount",
                    value: target.clone(),
                    reason: "container path must be absolute".to_string(),
                });
            }
            let source = resolve_source(source, working_dir).map_err(|reason| {
                TandemError::InvalidBinding {
                    service: service.to_string(),
                    kind: "credential mount",
                    value: source.clone(),
                    reason,
                }
            })?;
            Ok(Box::new(MountCredential {
                mount: MountBinding {
                    source,
                    target: target.clone(),
                    read_only: read_only.unwrap_or(false),
                },
            }))
        }
        CredentialConfig::Env { name, from } => Ok(Box::new(EnvCredential {
            name: name.clone(),
            from: from.clone().unwrap_or_else(|| name.clone()),
        })),
        CredentialConfig::Remote {
            name,
            url,
            headers,
            json_field,
        } => Ok(Box::new(RemoteCredential::new(
            name,
            url,
            headers
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            json_field.clone(),
        )?)),
    }
}

/// Binds a host credential directory into the process
#[derive(Debug, Clone)]
pub struct MountCredential {
    pub mount: MountBinding,
}

#[async_trait]
impl CredentialProvider for MountCredential {
    fn kind(&self) -> &'static str {
        "mount"
    }

    async fn provide(&self, service: &str, injection: &mut Injection) -> Result<()> {
        if let MountSource::HostPath(path) = &self.mount.source {
            if !path.exists() {
                tracing::warn!(
                    "Service {}: credential source {} does not exist, not mounting",
                    service,
                    path.display()
                );
                return Ok(());
            }
        }
        injection.mounts.retain(|m| m.target != self.mount.target);
        injection.mounts.push(self.mount.clone());
        Ok(())
    }
}

/// Copies a variable from the orchestrator's environment
#[derive(Debug, Clone)]
pub struct EnvCredential {
    /// Variable name inside the process
    pub name: String,
    /// Variable read from the orchestrator's environment
    pub from: String,
}

#[async_trait]
impl CredentialProvider for EnvCredential {
    fn kind(&self) -> &'static str {
        "env"
    }

    async fn provide(&self, service: &str, injection: &mut Injection) -> Result<()> {
        match std::env::var(&self.from) {
            Ok(value) => {
                injection.env.insert(self.name.clone(), value);
            }
            Err(_) => tracing::warn!(
                "Service {}: credential variable {} is not set, skipping",
                service,
                self.from
            ),
        }
        Ok(())
    }
}

/// Fetches a secret over HTTP
pub struct RemoteCredential {
    name: String,
    url: String,
    headers: BTreeMap<String, String>,
    json_field: Option<String>,
    client: reqwest::Client,
}

impl RemoteCredential {
    pub fn new(
        name: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        json_field: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TandemError::Runtime(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            headers,
            json_field,
            client,
        })
    }

    async fn fetch(&self) -> std::result::Result<String, String> {
        let mut request = self.client.get(&self.url);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("{} returned {}", self.url, status));
        }

        match &self.json_field {
            None => {
                let body = response.text().await.map_err(|e| e.to_string())?;
                Ok(body.trim().to_string())
            }
            Some(field) => {
                let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
                match body.get(field) {
                    Some(serde_json::Value::String(s)) => Ok(s.clone()),
                    Some(serde_json::Value::Null) | None => {
                        Err(format!("response has no field '{}'", field))
                    }
                    Some(other) => Ok(other.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for RemoteCredential {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn provide(&self, service: &str, injection: &mut Injection) -> Result<()> {
        let secret = self.fetch().await.map_err(|message| TandemError::Credential {
            service: service.to_string(),
            message,
        })?;
        tracing::debug!("Service {}: fetched {} from {}", service, self.name, self.url);
        injection.env.insert(self.name.clone(), secret);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the URL
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/token", addr)
    }

    #[tokio::test]
    async fn test_mount_credential_skips_missing_source() {
        let temp = tempdir().unwrap();
        let config = CredentialConfig::Mount {
            source: "./gcloud".to_string(),
            target: "/root/.config/gcloud".to_string(),
            read_only: None,
        };
        let provider = provider_for("ga4_server", &config, temp.path()).unwrap();

        let mut injection = Injection::default();
        provider.provide("ga4_server", &mut injection).await.unwrap();
        assert!(injection.mounts.is_empty());

        std::fs::create_dir(temp.path().join("gcloud")).unwrap();
        provider.provide("ga4_server", &mut injection).await.unwrap();
        assert_eq!(injection.mounts.len(), 1);
        assert!(!injection.mounts[0].read_only);
        assert_eq!(
            injection.mounts[0].source,
            MountSource::HostPath(temp.path().join("gcloud"))
        );
    }

    #[tokio::test]
    async fn test_mount_credential_read_only_when_asked() {
        let temp = tempdir().unwrap();
        let config = CredentialConfig::Mount {
            source: temp.path().display().to_string(),
            target: "/secrets".to_string(),
            read_only: Some(true),
        };
        let provider = provider_for("ga4_server", &config, Path::new("/")).unwrap();

        let mut injection = Injection::default();
        provider.provide("ga4_server", &mut injection).await.unwrap();
        assert!(injection.mounts[0].read_only);
    }

    #[test]
    fn test_mount_credential_needs_absolute_target() {
        let config = CredentialConfig::Mount {
            source: "/etc/creds".to_string(),
            target: "creds".to_string(),
            read_only: None,
        };
        assert!(provider_for("a", &config, Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_env_credential() {
        std::env::set_var("TANDEM_TEST_CREDENTIAL_TOKEN", "s3cret");
        let config = CredentialConfig::Env {
            name: "API_TOKEN".to_string(),
            from: Some("TANDEM_TEST_CREDENTIAL_TOKEN".to_string()),
        };
        let provider = provider_for("a", &config, Path::new("/")).unwrap();
        let mut injection = Injection::default();
        provider.provide("a", &mut injection).await.unwrap();
        assert_eq!(injection.env["API_TOKEN"], "s3cret");

        let missing = EnvCredential {
            name: "OTHER".to_string(),
            from: "TANDEM_TEST_CREDENTIAL_UNSET".to_string(),
        };
        missing.provide("a", &mut injection).await.unwrap();
        assert!(!injection.env.contains_key("OTHER"));
    }

    #[tokio::test]
    async fn test_remote_credential_reads_json_field() {
        let url = serve_once("200 OK", r#"{"access_token":"ya29.token","expires_in":3599}"#).await;
        let provider =
            RemoteCredential::new("ACCESS_TOKEN", &url, BTreeMap::new(), Some("access_token".to_string()))
                .unwrap();
        let mut injection = Injection::default();
        provider.provide("ga4_server", &mut injection).await.unwrap();
        assert_eq!(injection.env["ACCESS_TOKEN"], "ya29.token");
    }

    #[tokio::test]
    async fn test_remote_credential_failure_is_an_error() {
        let url = serve_once("500 Internal Server Error", "{}").await;
        let provider = RemoteCredential::new("ACCESS_TOKEN", &url, BTreeMap::new(), None).unwrap();
        let mut injection = Injection::default();
        let err = provider.provide("ga4_server", &mut injection).await.unwrap_err();
        assert!(matches!(err, TandemError::Credential { ref service, .. } if service == "ga4_server"));
        assert!(injection.env.is_empty());
    }
}
