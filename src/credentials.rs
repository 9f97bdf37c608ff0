use mockall::automock;
use thiserror::Error;

/// Key and certificate material the RPC listener presents.
#[derive(Debug, Clone)]
pub struct Credential {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to generate a certificate")]
    Generate(#[from] rcgen::Error),

    #[error("Credential provider failed: {0}")]
    Provider(String),
}

/// Source of this instance's key/certificate material, keyed by the
/// instance identity. Verification of peer certificates happens elsewhere.
#[automock]
pub trait CredentialProvider: Send + Sync {
    fn acquire(&self, identity: &str) -> Result<Credential, CredentialError>;
}

/// Generates a fresh self-signed certificate for the instance identity.
pub struct SelfSignedProvider;

impl CredentialProvider for SelfSignedProvider {
    fn acquire(&self, identity: &str) -> Result<Credential, CredentialError> {
        let certified =
            rcgen::generate_simple_self_signed(vec![identity.to_string(), "localhost".to_string()])?;
        log::debug!("Generated a self-signed certificate for '{}'", identity);
        Ok(Credential {
            certificate_pem: certified.cert.pem(),
            private_key_pem: certified.key_pair.serialize_pem(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn self_signed_credential_is_pem() {
        let credential = SelfSignedProvider.acquire("MYHOST-1A2B3C").unwrap();
        assert!(credential.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert!(credential.private_key_pem.contains("PRIVATE KEY"));
    }
}
