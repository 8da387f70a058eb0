//! Bootstrap & mTLS enrollment (C10): CSR + bootstrap token in, signed
//! client certificate chain out; plus renewal reusing the existing key.

use crate::error::{Error, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509NameBuilder, X509Req, X509};
use serde::{Deserialize, Serialize};

const CLIENT_CERT_VALIDITY_DAYS: u32 = 90;

#[derive(Debug, Deserialize)]
pub struct BootstrapRequest {
    pub csr_pem: String,
    pub bootstrap_token: String,
    pub hostname: String,
}

#[derive(Debug, Serialize)]
pub struct BootstrapResponse {
    pub cert_pem: String,
    pub ca_pem: String,
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    pub csr_pem: String,
}

/// Holds the server's signing CA and exposes the enrollment/renewal
/// operations. `expected_tokens` models the bootstrap-token store; the
/// core treats token persistence as out of scope and accepts any
/// membership check the caller wires in.
pub struct CertificateAuthority {
    ca_cert: X509,
    ca_key: PKey<Private>,
}

impl CertificateAuthority {
    pub fn new(ca_cert: X509, ca_key: PKey<Private>) -> Self {
        CertificateAuthority { ca_cert, ca_key }
    }

    pub fn ca_pem(&self) -> Result<String> {
        let bytes = self.ca_cert.to_pem().map_err(openssl_err)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Validate `req.bootstrap_token` against `valid_tokens`, verify the
    /// CSR's self-signature, and sign a client-auth certificate from it.
    pub fn enroll(&self, req: &BootstrapRequest, valid_tokens: &[String]) -> Result<BootstrapResponse> {
        if !valid_tokens.iter().any(|t| t == &req.bootstrap_token) {
            return Err(Error::PermissionDenied);
        }
        let csr = X509Req::from_pem(req.csr_pem.as_bytes()).map_err(openssl_err)?;
        let pubkey = csr.public_key().map_err(openssl_err)?;
        if !csr.verify(&pubkey).map_err(openssl_err)? {
            return Err(Error::Invalid("CSR signature verification failed".into()));
        }
        let cert = self.sign_from_csr(&csr, &req.hostname)?;
        let cert_pem = String::from_utf8_lossy(&cert.to_pem().map_err(openssl_err)?).into_owned();
        Ok(BootstrapResponse {
            cert_pem,
            ca_pem: self.ca_pem()?,
        })
    }

    /// Re-sign a certificate for an already-enrolled agent's existing
    /// keypair. The caller is responsible for authenticating the request
    /// via the existing client certificate (mTLS) before calling this.
    pub fn renew(&self, req: &RenewRequest, hostname: &str) -> Result<BootstrapResponse> {
        let csr = X509Req::from_pem(req.csr_pem.as_bytes()).map_err(openssl_err)?;
        let pubkey = csr.public_key().map_err(openssl_err)?;
        if !csr.verify(&pubkey).map_err(openssl_err)? {
            return Err(Error::Invalid("CSR signature verification failed".into()));
        }
        let cert = self.sign_from_csr(&csr, hostname)?;
        let cert_pem = String::from_utf8_lossy(&cert.to_pem().map_err(openssl_err)?).into_owned();
        Ok(BootstrapResponse {
            cert_pem,
            ca_pem: self.ca_pem()?,
        })
    }

    fn sign_from_csr(&self, csr: &X509Req, hostname: &str) -> Result<X509> {
        let mut builder = X509::builder().map_err(openssl_err)?;
        builder.set_version(2).map_err(openssl_err)?;

        let mut serial = BigNum::new().map_err(openssl_err)?;
        serial
            .rand(159, MsbOption::MAYBE_ZERO, false)
            .map_err(openssl_err)?;
        let asn1_serial = serial.to_asn1_integer().map_err(openssl_err)?;
        builder
            .set_serial_number(&asn1_serial)
            .map_err(openssl_err)?;

        let mut name_builder = X509NameBuilder::new().map_err(openssl_err)?;
        name_builder
            .append_entry_by_text("CN", hostname)
            .map_err(openssl_err)?;
        let name = name_builder.build();
        builder.set_subject_name(&name).map_err(openssl_err)?;
        builder
            .set_issuer_name(self.ca_cert.subject_name())
            .map_err(openssl_err)?;

        let pubkey = csr.public_key().map_err(openssl_err)?;
        builder.set_pubkey(&pubkey).map_err(openssl_err)?;

        let not_before = Asn1Time::days_from_now(0).map_err(openssl_err)?;
        let not_after = Asn1Time::days_from_now(CLIENT_CERT_VALIDITY_DAYS).map_err(openssl_err)?;
        builder.set_not_before(&not_before).map_err(openssl_err)?;
        builder.set_not_after(&not_after).map_err(openssl_err)?;

        builder
            .append_extension(BasicConstraints::new().build().map_err(openssl_err)?)
            .map_err(openssl_err)?;
        builder
            .append_extension(
                KeyUsage::new()
                    .digital_signature()
                    .key_encipherment()
                    .build()
                    .map_err(openssl_err)?,
            )
            .map_err(openssl_err)?;
        builder
            .append_extension(
                ExtendedKeyUsage::new()
                    .client_auth()
                    .build()
                    .map_err(openssl_err)?,
            )
            .map_err(openssl_err)?;

        builder
            .sign(&self.ca_key, MessageDigest::sha256())
            .map_err(openssl_err)?;
        Ok(builder.build())
    }
}

fn openssl_err(e: openssl::error::ErrorStack) -> Error {
    Error::Unknown(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    fn make_ca() -> CertificateAuthority {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let mut builder = X509::builder().unwrap();
        let mut name_builder = X509NameBuilder::new().unwrap();
        name_builder.append_entry_by_text("CN", "test-ca").unwrap();
        let name = name_builder.build();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
            .unwrap();
        let mut serial = BigNum::new().unwrap();
        serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        CertificateAuthority::new(builder.build(), key)
    }

    fn make_csr(hostname: &str) -> (String, PKey<Private>) {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let mut builder = X509Req::builder().unwrap();
        let mut name_builder = X509NameBuilder::new().unwrap();
        name_builder.append_entry_by_text("CN", hostname).unwrap();
        builder.set_subject_name(&name_builder.build()).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let pem = String::from_utf8(builder.build().to_pem().unwrap()).unwrap();
        (pem, key)
    }

    #[test]
    fn enroll_rejects_unknown_token() {
        let ca = make_ca();
        let (csr_pem, _key) = make_csr("agent-1");
        let req = BootstrapRequest {
            csr_pem,
            bootstrap_token: "bad-token".into(),
            hostname: "agent-1".into(),
        };
        let err = ca.enroll(&req, &["good-token".to_string()]);
        assert!(matches!(err, Err(Error::PermissionDenied)));
    }

    #[test]
    fn enroll_signs_valid_csr() {
        let ca = make_ca();
        let (csr_pem, _key) = make_csr("agent-1");
        let req = BootstrapRequest {
            csr_pem,
            bootstrap_token: "good-token".into(),
            hostname: "agent-1".into(),
        };
        let resp = ca.enroll(&req, &["good-token".to_string()]).unwrap();
        assert!(resp.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(resp.ca_pem.contains("BEGIN CERTIFICATE"));
    }
}
