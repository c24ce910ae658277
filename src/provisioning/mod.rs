//! One-shot bootstrap of the device trust material.
//!
//! A fresh gateway creates its own key, asks the issuer to sign a request for
//! its identity and keeps the returned certificates. The credential set on disk
//! is the only record of success.

use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::models::DeviceIdentity;

pub mod csr;
pub mod issuer;
pub mod store;

pub use csr::{CsrFactory, RsaCsrFactory};
pub use issuer::{CertificateIssuer, HttpIssuer, IssuedCertificates, ProvisionRequest};
pub use store::{CredentialStore, Credentials};

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Unable to seed random generator: {0}")]
    CryptoInit(String),
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
    #[error("Unable to build certificate request: {0}")]
    Csr(String),
    #[error("Issuer unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Issuer refused the request with status {0}")]
    IssuerStatus(u16, String),
    #[error("Issuer response is unusable: {0}")]
    InvalidResponse(String),
    #[error("Unable to store credentials: {0}")]
    Storage(#[from] std::io::Error),
    #[error("Key worker failed: {0}")]
    Worker(String),
    #[error("Device is already provisioned")]
    AlreadyProvisioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProvisioningPhase {
    Unprovisioned,
    KeyGenerated,
    CsrBuilt,
    CsrSubmitted,
    Provisioned,
    Failed,
}

pub struct ProvisioningManager<F: CsrFactory + Clone + 'static, I: CertificateIssuer> {
    store: CredentialStore,
    factory: F,
    issuer: I,
    phase: ProvisioningPhase,
}

impl<F: CsrFactory + Clone + 'static, I: CertificateIssuer> ProvisioningManager<F, I> {
    pub fn new(store: CredentialStore, factory: F, issuer: I) -> Self {
        let phase = if store.is_complete() {
            ProvisioningPhase::Provisioned
        } else {
            ProvisioningPhase::Unprovisioned
        };
        return ProvisioningManager { store, factory, issuer, phase };
    }

    pub fn is_provisioned(&self) -> bool {
        self.store.is_complete()
    }

    pub fn phase(&self) -> ProvisioningPhase {
        self.phase
    }

    /// Runs the whole bootstrap. Existing credentials are never touched.
    pub async fn perform_provisioning(&mut self, issuer_url: &str, identity: &DeviceIdentity) -> Result<(), ProvisioningError> {
        if self.is_provisioned() {
            warn!("Credentials present, refusing to provision again");
            return Err(ProvisioningError::AlreadyProvisioned);
        }

        info!("Starting automatic provisioning of {identity} against {issuer_url}");
        self.phase = ProvisioningPhase::Unprovisioned;

        match self.run(issuer_url, identity).await {
            Ok(()) => {
                info!("Provisioning complete");
                self.phase = ProvisioningPhase::Provisioned;
                return Ok(());
            }
            Err(e) => {
                error!("Provisioning failed after {:?}: {e}", self.phase);
                self.phase = ProvisioningPhase::Failed;
                return Err(e);
            }
        }
    }

    async fn run(&mut self, issuer_url: &str, identity: &DeviceIdentity) -> Result<(), ProvisioningError> {
        self.store.discard_staged()?;

        /* RSA generation takes seconds, keep it off the runtime workers */
        info!("Generating RSA key pair, this may take a while");
        let factory = self.factory.clone();
        let private_key = tokio::task::spawn_blocking(move || factory.generate_key())
            .await
            .map_err(|e| ProvisioningError::Worker(e.to_string()))??;
        self.phase = ProvisioningPhase::KeyGenerated;

        let csr = self.factory.build_csr(&private_key, identity)?;
        self.phase = ProvisioningPhase::CsrBuilt;

        let request = ProvisionRequest { serial_number: identity.to_string(), csr };
        let issued = self.issuer.submit(issuer_url, &request).await?;
        self.phase = ProvisioningPhase::CsrSubmitted;

        self.store.commit(&Credentials {
            ca_certificate: issued.ca_certificate,
            certificate: issued.certificate,
            private_key,
        })?;
        return Ok(());
    }
}
