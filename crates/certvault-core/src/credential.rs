use std::fmt;

use zeroize::Zeroizing;

use crate::certificate::Certificate;
use crate::error::{RepositoryError, RepositoryResult};

/// PKCS#8 DER private key. Wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(Zeroizing<Vec<u8>>);

impl PrivateKey {
    pub fn from_pkcs8_der(der: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(der.into()))
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.0
    }

    /// Fails with `KeyMismatch` unless this key's public half is the one in
    /// `certificate`. Keys that cannot be loaded are `InvalidPrivateKey`.
    pub fn ensure_matches(&self, certificate: &Certificate) -> RepositoryResult<()> {
        let pair = rcgen::KeyPair::try_from(self.pkcs8_der())
            .map_err(|e| RepositoryError::InvalidPrivateKey(e.to_string()))?;
        if pair.public_key_raw() != certificate.public_key_bits()?.as_slice() {
            return Err(RepositoryError::KeyMismatch(certificate.serial_number()?));
        }
        Ok(())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// One store entry: chain leaf-first, with the leaf's key when requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    pub serial_number: String,
    pub chain: Vec<Certificate>,
    pub private_key: Option<PrivateKey>,
}

impl CredentialEntry {
    pub fn leaf(&self) -> Option<&Certificate> {
        self.chain.first()
    }
}

/// Signing material handed to an external signer. Never persisted.
#[derive(Debug, Clone)]
pub struct IssuerData {
    pub private_key: PrivateKey,
    pub subject_name: String,
    pub subject_der: Vec<u8>,
    pub public_key: Vec<u8>,
    pub serial_number: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Certificate, PrivateKey) {
        let params = rcgen::CertificateParams::new(vec!["key.test".to_string()]).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = Certificate::from_der(params.self_signed(&key).unwrap().der().to_vec()).unwrap();
        (cert, PrivateKey::from_pkcs8_der(key.serialize_der()))
    }

    #[test]
    fn key_matches_its_own_certificate_only() {
        let (cert, key) = pair();
        let (other_cert, other_key) = pair();
        key.ensure_matches(&cert).unwrap();
        other_key.ensure_matches(&other_cert).unwrap();
        assert!(matches!(
            key.ensure_matches(&other_cert),
            Err(RepositoryError::KeyMismatch(_))
        ));
    }

    #[test]
    fn non_pkcs8_key_is_invalid() {
        let (cert, _) = pair();
        let garbage = PrivateKey::from_pkcs8_der(vec![0x30, 0x01, 0x02]);
        assert!(matches!(
            garbage.ensure_matches(&cert),
            Err(RepositoryError::InvalidPrivateKey(_))
        ));
    }

    #[test]
    fn debug_does_not_leak_key_bytes() {
        let key = PrivateKey::from_pkcs8_der(vec![0xde, 0xad, 0xbe, 0xef]);
        let out = format!("{:?}", key);
        assert!(out.contains("redacted"));
        assert!(!out.contains("222"));
        assert!(!out.contains("deadbeef"));
    }
}
