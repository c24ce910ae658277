use rand::rngs::{OsRng, StdRng};
use rand::SeedableRng;
use rcgen::{CertificateParams, CertificateSigningRequest, DistinguishedName, DnType, KeyPair};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

use crate::models::DeviceIdentity;
use crate::provisioning::ProvisioningError;

pub const RSA_BITS: usize = 2048;
pub const ORGANIZATION: &str = "EnergyMe IoT";

/// Produces the key pair and the signing request of the gateway
pub trait CsrFactory: Send + Sync {
    /// PKCS#8 PEM private key
    fn generate_key(&self) -> Result<String, ProvisioningError>;
    /// PEM signing request for `identity`, signed with `private_key`
    fn build_csr(&self, private_key: &str, identity: &DeviceIdentity) -> Result<String, ProvisioningError>;
}

#[derive(Clone, Default)]
pub struct RsaCsrFactory;

impl CsrFactory for RsaCsrFactory {
    fn generate_key(&self) -> Result<String, ProvisioningError> {
        /* the generator is seeded from the OS entropy pool which mixes in the hardware RNG */
        let mut rng = StdRng::from_rng(OsRng).map_err(|e| ProvisioningError::CryptoInit(e.to_string()))?;

        let key = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| ProvisioningError::KeyGeneration(e.to_string()))?;
        let pem = key.to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ProvisioningError::KeyGeneration(e.to_string()))?;
        return Ok(pem.as_str().to_owned());
    }

    fn build_csr(&self, private_key: &str, identity: &DeviceIdentity) -> Result<String, ProvisioningError> {
        let csr = signing_request(private_key, identity)?;
        csr.pem().map_err(|e| ProvisioningError::Csr(e.to_string()))
    }
}

fn signing_request(private_key: &str, identity: &DeviceIdentity) -> Result<CertificateSigningRequest, ProvisioningError> {
    let key_pair = KeyPair::from_pem(private_key).map_err(|e| ProvisioningError::Csr(e.to_string()))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| ProvisioningError::Csr(e.to_string()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity.as_str());
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;

    params.serialize_request(&key_pair).map_err(|e| ProvisioningError::Csr(e.to_string()))
}
