//! X.509 certificate handling: the DER wrapper stored in the vault, the
//! fields other components read from it, and CA / end-entity classification.

use std::fmt;

use serde::{Deserialize, Serialize};
use x509_parser::oid_registry::OID_X509_EXT_BASIC_CONSTRAINTS;
use x509_parser::prelude::{FromDer, ParsedExtension, X509Certificate};

use crate::crypto::fingerprint;
use crate::error::{RepositoryError, RepositoryResult};

/// One DER-encoded X.509 certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// Wraps DER bytes after checking they decode as a certificate.
    pub fn from_der(der: impl Into<Vec<u8>>) -> RepositoryResult<Self> {
        let cert = Self(der.into());
        cert.parsed()?;
        Ok(cert)
    }

    /// Wraps bytes read back from a store without re-validating them.
    pub(crate) fn from_stored(der: Vec<u8>) -> Self {
        Self(der)
    }

    pub fn der(&self) -> &[u8] {
        &self.0
    }

    /// Hex SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }

    /// Serial number in decimal, the key every store entry is filed under.
    pub fn serial_number(&self) -> RepositoryResult<String> {
        Ok(self.parsed()?.tbs_certificate.serial.to_string())
    }

    /// Subject distinguished name as an RFC 4514 style string plus its raw DER.
    pub fn subject(&self) -> RepositoryResult<(String, Vec<u8>)> {
        let cert = self.parsed()?;
        Ok((cert.subject().to_string(), cert.subject().as_raw().to_vec()))
    }

    /// SubjectPublicKeyInfo DER.
    pub fn public_key(&self) -> RepositoryResult<Vec<u8>> {
        Ok(self.parsed()?.public_key().raw.to_vec())
    }

    /// The raw subjectPublicKey bits, without the algorithm identifier.
    pub fn public_key_bits(&self) -> RepositoryResult<Vec<u8>> {
        Ok(self
            .parsed()?
            .public_key()
            .subject_public_key
            .data
            .to_vec())
    }

    fn parsed(&self) -> RepositoryResult<X509Certificate<'_>> {
        let (_, cert) = X509Certificate::from_der(&self.0)
            .map_err(|e| RepositoryError::InvalidCertificate(e.to_string()))?;
        Ok(cert)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Certificate")
            .field(&self.fingerprint())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndeterminateReason {
    MissingBasicConstraints,
    MalformedBasicConstraints,
    Unparseable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateKind {
    Ca,
    EndEntity,
    /// The basic-constraints extension could not be read. The caller decides;
    /// nothing destructive should follow from this outcome on its own.
    Indeterminate(IndeterminateReason),
}

impl CertificateKind {
    pub fn is_end_entity(&self) -> bool {
        matches!(self, CertificateKind::EndEntity)
    }
}

/// Classifies a certificate by its basic-constraints `cA` flag.
pub fn classify(certificate: &Certificate) -> CertificateKind {
    let cert = match certificate.parsed() {
        Ok(cert) => cert,
        Err(_) => return CertificateKind::Indeterminate(IndeterminateReason::Unparseable),
    };
    let ext = match cert
        .tbs_certificate
        .get_extension_unique(&OID_X509_EXT_BASIC_CONSTRAINTS)
    {
        Ok(Some(ext)) => ext,
        Ok(None) => {
            return CertificateKind::Indeterminate(IndeterminateReason::MissingBasicConstraints)
        }
        // duplicated extension
        Err(_) => {
            return CertificateKind::Indeterminate(IndeterminateReason::MalformedBasicConstraints)
        }
    };
    match ext.parsed_extension() {
        ParsedExtension::BasicConstraints(bc) if bc.ca => CertificateKind::Ca,
        ParsedExtension::BasicConstraints(_) => CertificateKind::EndEntity,
        _ => CertificateKind::Indeterminate(IndeterminateReason::MalformedBasicConstraints),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, CustomExtension, IsCa, KeyPair, SerialNumber};

    fn make(is_ca: IsCa, serial: u64) -> Certificate {
        let mut params = CertificateParams::new(vec!["node.example".to_string()]).unwrap();
        params.is_ca = is_ca;
        params.serial_number = Some(SerialNumber::from(serial));
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Certificate::from_der(cert.der().to_vec()).unwrap()
    }

    #[test]
    fn ca_flag_true_is_ca() {
        let cert = make(IsCa::Ca(BasicConstraints::Unconstrained), 1);
        assert_eq!(classify(&cert), CertificateKind::Ca);
    }

    #[test]
    fn ca_flag_false_is_end_entity() {
        let cert = make(IsCa::ExplicitNoCa, 2);
        assert_eq!(classify(&cert), CertificateKind::EndEntity);
        assert!(classify(&cert).is_end_entity());
    }

    #[test]
    fn missing_extension_is_indeterminate() {
        let cert = make(IsCa::NoCa, 3);
        assert_eq!(
            classify(&cert),
            CertificateKind::Indeterminate(IndeterminateReason::MissingBasicConstraints)
        );
    }

    #[test]
    fn malformed_extension_is_indeterminate() {
        let mut params = CertificateParams::new(vec!["node.example".to_string()]).unwrap();
        params.is_ca = IsCa::NoCa;
        // an OCTET STRING where a SEQUENCE is required
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            &[2, 5, 29, 19],
            vec![0x04, 0x01, 0xff],
        )];
        let key = KeyPair::generate().unwrap();
        let der = params.self_signed(&key).unwrap().der().to_vec();
        let cert = Certificate::from_stored(der);
        // x509-parser reports the bad contents per extension; a stricter parser
        // may reject the whole certificate instead. Neither may read as end-entity.
        assert!(matches!(
            classify(&cert),
            CertificateKind::Indeterminate(
                IndeterminateReason::MalformedBasicConstraints | IndeterminateReason::Unparseable
            )
        ));
    }

    #[test]
    fn garbage_is_unparseable() {
        let cert = Certificate::from_stored(vec![0x30, 0x03, 0x01, 0x01, 0x00]);
        assert_eq!(
            classify(&cert),
            CertificateKind::Indeterminate(IndeterminateReason::Unparseable)
        );
        assert!(Certificate::from_der(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn serial_number_is_decimal() {
        let cert = make(IsCa::ExplicitNoCa, 1001);
        assert_eq!(cert.serial_number().unwrap(), "1001");
        let (subject, raw) = cert.subject().unwrap();
        assert!(!subject.is_empty() || !raw.is_empty());
        assert!(!cert.public_key().unwrap().is_empty());
    }
}
