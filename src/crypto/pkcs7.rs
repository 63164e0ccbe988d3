//! PKCS#7 signed-data for artifacts the server issues and accepts.

use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::X509;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum Pkcs7Error {
    #[error("PKCS#7 verification failed: {0}")]
    Verification(String),

    #[error("openssl: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// Produces DER-encoded PKCS#7 signed-data.
pub struct Pkcs7Signer {
    cert: X509,
    key: PKey<Private>,
    chain: Vec<X509>,
}

impl Pkcs7Signer {
    pub fn new(cert: X509, key: PKey<Private>) -> Self {
        Self {
            cert,
            key,
            chain: Vec::new(),
        }
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, Pkcs7Error> {
        Ok(Self::new(
            X509::from_pem(cert_pem)?,
            PKey::private_key_from_pem(key_pem)?,
        ))
    }

    /// Extra certificates embedded next to the signer certificate.
    pub fn with_chain(mut self, chain: Vec<X509>) -> Self {
        self.chain = chain;
        self
    }

    pub fn sign(&self, content: &[u8], detached: bool) -> Result<Vec<u8>, Pkcs7Error> {
        let mut certs = Stack::new()?;
        for cert in &self.chain {
            certs.push(cert.clone())?;
        }
        let mut flags = Pkcs7Flags::BINARY;
        if detached {
            flags |= Pkcs7Flags::DETACHED;
        }
        let p7 = Pkcs7::sign(&self.cert, &self.key, &certs, content, flags)?;
        Ok(p7.to_der()?)
    }
}

/// Outcome of a successful verification.
#[derive(Debug)]
pub struct VerifiedContent {
    pub content: Vec<u8>,
    pub signers: Vec<X509>,
    /// False when the signer was accepted through the single-signer fallback.
    pub chain_verified: bool,
}

/// Verifies signed-data against a fixed set of trusted certificates.
pub struct Pkcs7Verifier {
    store: X509Store,
    allow_single_signer_fallback: bool,
}

impl Pkcs7Verifier {
    pub fn new(trusted: &[X509]) -> Result<Self, Pkcs7Error> {
        let mut builder = X509StoreBuilder::new()?;
        for cert in trusted {
            builder.add_cert(cert.clone())?;
        }
        Ok(Self {
            store: builder.build(),
            allow_single_signer_fallback: true,
        })
    }

    /// When strict chain validation fails and exactly one signer is present,
    /// accept a valid signature from that signer anyway. On by default.
    pub fn with_single_signer_fallback(mut self, allow: bool) -> Self {
        self.allow_single_signer_fallback = allow;
        self
    }

    pub fn verify(&self, der: &[u8], detached: Option<&[u8]>) -> Result<VerifiedContent, Pkcs7Error> {
        let p7 = Pkcs7::from_der(der)?;
        let extra = Stack::<X509>::new()?;
        let signers: Vec<X509> = p7
            .signers(&extra, Pkcs7Flags::empty())?
            .iter()
            .map(|c| c.to_owned())
            .collect();

        let mut content = Vec::new();
        let strict = p7.verify(&extra, &self.store, detached, Some(&mut content), Pkcs7Flags::BINARY);
        let strict_err = match strict {
            Ok(()) => {
                return Ok(VerifiedContent {
                    content,
                    signers,
                    chain_verified: true,
                })
            }
            Err(e) => e,
        };

        if !self.allow_single_signer_fallback || signers.len() != 1 {
            return Err(Pkcs7Error::Verification(strict_err.to_string()));
        }

        content.clear();
        p7.verify(
            &extra,
            &self.store,
            detached,
            Some(&mut content),
            Pkcs7Flags::BINARY | Pkcs7Flags::NOVERIFY,
        )
        .map_err(|e| Pkcs7Error::Verification(e.to_string()))?;
        warn!(
            "PKCS#7 chain validation failed ({}); accepted the single signer without it",
            strict_err
        );
        Ok(VerifiedContent {
            content,
            signers,
            chain_verified: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    fn self_signed(cn: &str) -> (X509, PKey<Private>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name_builder = X509NameBuilder::new().unwrap();
        name_builder.append_entry_by_text("CN", cn).unwrap();
        let name = name_builder.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (builder.build(), key)
    }

    #[test]
    fn attached_signature_verifies_against_trusted_cert() {
        let (cert, key) = self_signed("trust-registry-test");
        let der = Pkcs7Signer::new(cert.clone(), key)
            .sign(b"artifact", false)
            .unwrap();

        let verified = Pkcs7Verifier::new(&[cert]).unwrap().verify(&der, None).unwrap();
        assert_eq!(verified.content, b"artifact");
        assert_eq!(verified.signers.len(), 1);
        assert!(verified.chain_verified);
    }

    #[test]
    fn untrusted_single_signer_uses_fallback() {
        let (cert, key) = self_signed("untrusted");
        let der = Pkcs7Signer::new(cert, key).sign(b"data", true).unwrap();

        let verified = Pkcs7Verifier::new(&[])
            .unwrap()
            .verify(&der, Some(b"data"))
            .unwrap();
        assert!(!verified.chain_verified);
        assert_eq!(verified.content, b"data");
    }

    #[test]
    fn fallback_can_be_disabled() {
        let (cert, key) = self_signed("untrusted");
        let der = Pkcs7Signer::new(cert, key).sign(b"data", true).unwrap();

        let verifier = Pkcs7Verifier::new(&[])
            .unwrap()
            .with_single_signer_fallback(false);
        assert!(matches!(
            verifier.verify(&der, Some(b"data")),
            Err(Pkcs7Error::Verification(_))
        ));
    }

    #[test]
    fn tampered_detached_content_fails_even_with_fallback() {
        let (cert, key) = self_signed("untrusted");
        let der = Pkcs7Signer::new(cert, key).sign(b"data", true).unwrap();

        let verifier = Pkcs7Verifier::new(&[]).unwrap();
        assert!(verifier.verify(&der, Some(b"dat4")).is_err());
    }

    #[test]
    fn pem_round_trip_builds_signer() {
        let (cert, key) = self_signed("pem");
        let signer = Pkcs7Signer::from_pem(
            &cert.to_pem().unwrap(),
            &key.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap()
        .with_chain(vec![cert.clone()]);
        let der = signer.sign(b"x", false).unwrap();
        assert!(Pkcs7Verifier::new(&[cert]).unwrap().verify(&der, None).is_ok());
    }
}
