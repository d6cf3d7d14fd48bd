use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::OciImageManifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};

use super::{ArtifactUpload, Registry};
use crate::config::TransportSettings;
use crate::credentials::Credentials;
use crate::error::RegistryError;
use crate::reference::ArtifactReference;

/// Registry client backed by `oci-distribution`.
pub struct OciRegistry {
    settings: TransportSettings,
}

impl OciRegistry {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }

    fn client_for(&self, reference: &ArtifactReference) -> Result<Client, RegistryError> {
        let protocol = match reference.scheme.as_deref() {
            Some("https") => ClientProtocol::Https,
            Some("http") if !self.settings.allow_plain_http => {
                return Err(RegistryError::InvalidReference {
                    reference: reference.to_string(),
                    message: "plain http requires --allow-plain-http".to_string(),
                })
            }
            _ if self.settings.allow_plain_http => {
                ClientProtocol::HttpsExcept(vec![reference.host().to_string()])
            }
            _ => ClientProtocol::Https,
        };

        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Ok(Client::new(config))
    }
}

fn to_oci_auth(auth: Option<&Credentials>) -> RegistryAuth {
    match auth {
        Some(creds) => RegistryAuth::Basic(creds.username.clone(), creds.password.clone()),
        None => RegistryAuth::Anonymous,
    }
}

fn classify(reference: &ArtifactReference, err: OciDistributionError) -> RegistryError {
    let message = err.to_string();
    match err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => RegistryError::Auth {
            reference: reference.to_string(),
            operation: "push",
            message,
        },
        _ => RegistryError::Transport {
            reference: reference.to_string(),
            operation: "push",
            message,
        },
    }
}

#[async_trait]
impl Registry for OciRegistry {
    fn name(&self) -> &str {
        "oci"
    }

    async fn push(
        &self,
        reference: &ArtifactReference,
        upload: &ArtifactUpload,
        auth: Option<&Credentials>,
    ) -> Result<String, RegistryError> {
        let client = self.client_for(reference)?;
        let oci_ref = reference
            .registry_path()
            .parse::<Reference>()
            .map_err(|e| RegistryError::InvalidReference {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;

        let manifest: OciImageManifest =
            serde_json::from_slice(&upload.manifest).map_err(|e| RegistryError::Transport {
                reference: reference.to_string(),
                operation: "manifest decode",
                message: e.to_string(),
            })?;

        let config = Config::new(
            upload.config.data.clone(),
            upload.config.media_type.clone(),
            None,
        );
        let layers: Vec<ImageLayer> = upload
            .layers
            .iter()
            .map(|layer| ImageLayer::new(layer.data.clone(), layer.media_type.clone(), None))
            .collect();

        log::info!(
            "Pushing {} ({} layers) to {}",
            upload.manifest_digest,
            layers.len(),
            reference
        );

        let response = client
            .push(&oci_ref, &layers, config, &to_oci_auth(auth), Some(manifest))
            .await
            .map_err(|e| classify(reference, e))?;

        log::debug!("Manifest available at {}", response.manifest_url);
        Ok(upload.manifest_digest.clone())
    }
}
