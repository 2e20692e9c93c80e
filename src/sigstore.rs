//! Sigstore bundle parsing and signature verification
//!
//! Release artifacts are attested by GitHub Actions with keyless Sigstore
//! bundles. This module verifies one bundle against one artifact digest:
//! 1. Recognise the bundle generation (v0.1, v0.2, v0.3)
//! 2. Locate the Fulcio leaf certificate for that generation
//! 3. Chain the leaf to a configured Fulcio authority, checking every
//!    certificate was valid when the bundle entered the transparency log
//! 4. Verify the DSSE signature with the certificate's P-256 key
//! 5. Check the in-toto statement names the expected subject digest
//! 6. Extract the signer identity claims from the certificate extensions
//!
//! Whether that identity is acceptable is decided by [`crate::policy`].

use base64::Engine;
use serde::{Deserialize, Serialize};
use x509_cert::Certificate;

/// Fulcio OIDC issuer, legacy raw-string encoding (1.3.6.1.4.1.57264.1.1)
const OID_ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";
/// Fulcio OIDC issuer, DER UTF8String encoding (1.3.6.1.4.1.57264.1.8)
const OID_ISSUER: &str = "1.3.6.1.4.1.57264.1.8";
/// Build Signer URI (1.3.6.1.4.1.57264.1.9)
const OID_BUILD_SIGNER_URI: &str = "1.3.6.1.4.1.57264.1.9";
/// Runner Environment (1.3.6.1.4.1.57264.1.11)
const OID_RUNNER_ENVIRONMENT: &str = "1.3.6.1.4.1.57264.1.11";
/// Source Repository URI (1.3.6.1.4.1.57264.1.12)
const OID_SOURCE_REPOSITORY_URI: &str = "1.3.6.1.4.1.57264.1.12";

const OID_BASIC_CONSTRAINTS: &str = "2.5.29.19";
const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";

/// Fulcio issues through one intermediate; allow a little slack
const MAX_CHAIN_DEPTH: usize = 4;

const IN_TOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

/// Sigstore bundle as served by the GitHub attestations API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub media_type: String,
    pub verification_material: VerificationMaterial,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsse_envelope: Option<DsseEnvelope>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMaterial {
    /// v0.3 bundles carry the leaf certificate directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<RawBytes>,
    /// v0.1 and v0.2 bundles carry a chain, leaf first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x509_certificate_chain: Option<CertificateChain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tlog_entries: Vec<TlogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBytes {
    pub raw_bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateChain {
    pub certificates: Vec<RawBytes>,
}

/// Rekor entry; only the integration time is used
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlogEntry {
    /// Unix seconds, encoded as a decimal string
    pub integrated_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsseEnvelope {
    pub payload: String,
    pub payload_type: String,
    pub signatures: Vec<DsseSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsseSignature {
    pub sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyid: Option<String>,
}

/// Bundle format generation, taken from the media type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleVersion {
    V0_1,
    V0_2,
    V0_3,
}

impl BundleVersion {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            "application/vnd.dev.sigstore.bundle+json;version=0.1" => Some(Self::V0_1),
            "application/vnd.dev.sigstore.bundle+json;version=0.2" => Some(Self::V0_2),
            "application/vnd.dev.sigstore.bundle+json;version=0.3"
            | "application/vnd.dev.sigstore.bundle.v0.3+json" => Some(Self::V0_3),
            _ => None,
        }
    }
}

impl Bundle {
    pub fn version(&self) -> Result<BundleVersion, String> {
        BundleVersion::from_media_type(&self.media_type)
            .ok_or_else(|| format!("unsupported bundle media type: {}", self.media_type))
    }

    /// DER bytes of the signing (leaf) certificate
    pub fn leaf_certificate(&self) -> Result<Vec<u8>, String> {
        let material = &self.verification_material;
        let raw = match self.version()? {
            BundleVersion::V0_3 => material.certificate.as_ref(),
            BundleVersion::V0_1 | BundleVersion::V0_2 => material
                .x509_certificate_chain
                .as_ref()
                .and_then(|chain| chain.certificates.first()),
        }
        .ok_or("no signing certificate in bundle")?;

        decode_certificate(raw)
    }

    /// DER bytes of the certificates that follow the leaf in a v0.1/v0.2 chain
    pub fn intermediate_certificates(&self) -> Result<Vec<Vec<u8>>, String> {
        match (self.version()?, &self.verification_material.x509_certificate_chain) {
            (BundleVersion::V0_1 | BundleVersion::V0_2, Some(chain)) => {
                chain.certificates.iter().skip(1).map(decode_certificate).collect()
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Unix time at which the bundle was recorded in the transparency log
    pub fn signing_time(&self) -> Result<u64, String> {
        let entry = self
            .verification_material
            .tlog_entries
            .first()
            .ok_or("no transparency log entry in bundle")?;
        entry
            .integrated_time
            .parse()
            .map_err(|e| format!("invalid integratedTime {:?}: {}", entry.integrated_time, e))
    }
}

fn decode_certificate(raw: &RawBytes) -> Result<Vec<u8>, String> {
    base64::engine::general_purpose::STANDARD
        .decode(&raw.raw_bytes)
        .map_err(|e| format!("failed to decode certificate: {}", e))
}

fn parse_certificate(der: &[u8]) -> Result<Certificate, String> {
    use der::Decode;

    Certificate::from_der(der).map_err(|e| format!("failed to parse certificate: {}", e))
}

/// Signer identity claims carried by a Fulcio certificate.
///
/// Absent claims stay `None`; policy checks treat absence as failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub issuer: Option<String>,
    pub source_repository: Option<String>,
    pub runner_environment: Option<String>,
    pub build_signer_uri: Option<String>,
}

impl CertificateIdentity {
    /// Extract identity claims from a DER-encoded certificate
    pub fn from_der(cert_der: &[u8]) -> Result<Self, String> {
        Ok(Self::from_certificate(&parse_certificate(cert_der)?))
    }

    fn from_certificate(cert: &Certificate) -> Self {
        let mut identity = Self::default();
        let mut legacy_issuer = None;

        if let Some(extensions) = &cert.tbs_certificate.extensions {
            for ext in extensions.iter() {
                let value = ext.extn_value.as_bytes();
                match ext.extn_id.to_string().as_str() {
                    OID_ISSUER => identity.issuer = Some(utf8_extension(value)),
                    OID_ISSUER_V1 => legacy_issuer = Some(String::from_utf8_lossy(value).into_owned()),
                    OID_BUILD_SIGNER_URI => identity.build_signer_uri = Some(utf8_extension(value)),
                    OID_RUNNER_ENVIRONMENT => identity.runner_environment = Some(utf8_extension(value)),
                    OID_SOURCE_REPOSITORY_URI => identity.source_repository = Some(utf8_extension(value)),
                    _ => {}
                }
            }
        }

        if identity.issuer.is_none() {
            identity.issuer = legacy_issuer;
        }
        identity
    }
}

/// Decode a Fulcio v2 extension value (DER UTF8String), tolerating raw strings
fn utf8_extension(value: &[u8]) -> String {
    use der::asn1::Utf8StringRef;
    use der::Decode;

    match Utf8StringRef::from_der(value) {
        Ok(s) => s.as_str().to_string(),
        Err(_) => String::from_utf8_lossy(value).into_owned(),
    }
}

/// Certificate authorities a Fulcio leaf must chain to.
///
/// Loaded from a PEM bundle holding the Fulcio intermediate and root, as
/// published in the Sigstore trusted root. Every certificate in the bundle
/// is trusted as an issuer.
#[derive(Debug, Clone)]
pub struct TrustRoot {
    authorities: Vec<Certificate>,
}

impl TrustRoot {
    pub fn from_pem(pem: &[u8]) -> Result<Self, String> {
        let authorities =
            Certificate::load_pem_chain(pem).map_err(|e| format!("failed to parse trust root: {}", e))?;
        if authorities.is_empty() {
            return Err("trust root contains no certificates".to_string());
        }
        Ok(Self { authorities })
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    /// Walk from `leaf` through `intermediates` up to a trusted authority.
    ///
    /// Every certificate on the path, the authority included, must have been
    /// valid at `signed_at` (Unix seconds). Issuers must be CA certificates.
    pub fn verify_chain(
        &self,
        leaf: &Certificate,
        intermediates: &[Certificate],
        signed_at: u64,
    ) -> Result<(), String> {
        let mut current = leaf;
        for _ in 0..MAX_CHAIN_DEPTH {
            check_validity(current, signed_at)?;
            if let Some(authority) = self.authorities.iter().find(|ca| issued_by(current, ca)) {
                return check_validity(authority, signed_at);
            }
            current = intermediates
                .iter()
                .find(|ca| issued_by(current, ca))
                .ok_or("certificate does not chain to a trusted Fulcio authority")?;
        }
        Err("certificate chain too long".to_string())
    }
}

fn issued_by(cert: &Certificate, issuer: &Certificate) -> bool {
    cert.tbs_certificate.issuer == issuer.tbs_certificate.subject
        && is_ca(issuer)
        && verify_certificate_signature(cert, issuer).is_ok()
}

fn is_ca(cert: &Certificate) -> bool {
    use der::Decode;
    use x509_cert::ext::pkix::BasicConstraints;

    cert.tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id.to_string() == OID_BASIC_CONSTRAINTS)
        .and_then(|ext| BasicConstraints::from_der(ext.extn_value.as_bytes()).ok())
        .is_some_and(|constraints| constraints.ca)
}

fn check_validity(cert: &Certificate, signed_at: u64) -> Result<(), String> {
    let validity = &cert.tbs_certificate.validity;
    let not_before = validity.not_before.to_unix_duration().as_secs();
    let not_after = validity.not_after.to_unix_duration().as_secs();
    if signed_at < not_before || signed_at > not_after {
        return Err(format!(
            "certificate not valid at signing time {} (valid from {} to {})",
            signed_at, not_before, not_after
        ));
    }
    Ok(())
}

/// Check `cert` was signed by `issuer`'s key (ECDSA P-256 or P-384)
fn verify_certificate_signature(cert: &Certificate, issuer: &Certificate) -> Result<(), String> {
    use der::Encode;
    use p256::ecdsa::signature::Verifier as _;
    use p384::ecdsa::signature::Verifier as _;

    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| format!("failed to encode certificate: {}", e))?;
    let key = issuer.tbs_certificate.subject_public_key_info.subject_public_key.raw_bytes();
    let signature = cert.signature.raw_bytes();

    match cert.signature_algorithm.oid.to_string().as_str() {
        OID_ECDSA_WITH_SHA256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(key)
                .map_err(|e| format!("invalid issuer key: {}", e))?;
            let signature = p256::ecdsa::Signature::from_der(signature)
                .map_err(|e| format!("invalid certificate signature: {}", e))?;
            key.verify(&tbs, &signature).map_err(|e| e.to_string())
        }
        OID_ECDSA_WITH_SHA384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(key)
                .map_err(|e| format!("invalid issuer key: {}", e))?;
            let signature = p384::ecdsa::Signature::from_der(signature)
                .map_err(|e| format!("invalid certificate signature: {}", e))?;
            key.verify(&tbs, &signature).map_err(|e| e.to_string())
        }
        other => Err(format!("unsupported certificate signature algorithm: {}", other)),
    }
}

/// Cryptographic verification of one bundle against one subject digest.
///
/// On success returns the signer identity so the caller can apply its trust
/// policy; on failure returns a reason fit for operator diagnostics.
pub trait BundleVerifier: Send + Sync {
    fn verify(&self, subject_digest: &str, bundle: &Bundle) -> Result<CertificateIdentity, String>;
}

/// In-process DSSE verifier for keyless GitHub Actions bundles
#[derive(Debug, Clone)]
pub struct DsseVerifier {
    trust_root: TrustRoot,
}

impl DsseVerifier {
    pub fn new(trust_root: TrustRoot) -> Self {
        Self { trust_root }
    }
}

impl BundleVerifier for DsseVerifier {
    fn verify(&self, subject_digest: &str, bundle: &Bundle) -> Result<CertificateIdentity, String> {
        let cert = parse_certificate(&bundle.leaf_certificate()?)?;
        let intermediates = bundle
            .intermediate_certificates()?
            .iter()
            .map(|der| parse_certificate(der))
            .collect::<Result<Vec<_>, _>>()?;

        let signed_at = bundle.signing_time()?;
        self.trust_root.verify_chain(&cert, &intermediates, signed_at)?;

        let envelope = bundle.dsse_envelope.as_ref().ok_or("no dsseEnvelope in bundle")?;
        let payload = verify_dsse_signature(&cert, envelope)?;
        verify_subject(&payload, subject_digest)?;

        Ok(CertificateIdentity::from_certificate(&cert))
    }
}

/// Compute DSSE Pre-Authentication Encoding (PAE)
///
/// PAE(type, body) = "DSSEv1" + SP + LEN(type) + SP + type + SP + LEN(body) + SP + body
pub fn compute_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let type_bytes = payload_type.as_bytes();
    let type_len = type_bytes.len().to_string();
    let body_len = payload.len().to_string();

    let mut pae = Vec::new();
    pae.extend_from_slice(b"DSSEv1");
    pae.push(0x20);
    pae.extend_from_slice(type_len.as_bytes());
    pae.push(0x20);
    pae.extend_from_slice(type_bytes);
    pae.push(0x20);
    pae.extend_from_slice(body_len.as_bytes());
    pae.push(0x20);
    pae.extend_from_slice(payload);

    pae
}

/// Verify the envelope signature and return the decoded payload
fn verify_dsse_signature(cert: &x509_cert::Certificate, envelope: &DsseEnvelope) -> Result<Vec<u8>, String> {
    use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};

    if envelope.payload_type != IN_TOTO_PAYLOAD_TYPE {
        return Err(format!("unexpected payload type: {}", envelope.payload_type));
    }

    // Fulcio issues P-256 keys for GitHub Actions workloads
    let pubkey_bytes = cert
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();
    let verifying_key = VerifyingKey::from_sec1_bytes(pubkey_bytes)
        .map_err(|e| format!("invalid public key: {}", e))?;

    let payload = base64::engine::general_purpose::STANDARD
        .decode(&envelope.payload)
        .map_err(|e| format!("failed to decode payload: {}", e))?;

    let signature_b64 = envelope
        .signatures
        .first()
        .map(|s| s.sig.as_str())
        .ok_or("no signature in envelope")?;
    let signature_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|e| format!("failed to decode signature: {}", e))?;

    // DER (starts with SEQUENCE) or raw r||s
    let signature = if signature_bytes.first() == Some(&0x30) {
        Signature::from_der(&signature_bytes).map_err(|e| format!("invalid DER signature: {}", e))?
    } else {
        Signature::from_slice(&signature_bytes).map_err(|e| format!("invalid raw signature: {}", e))?
    };

    let pae = compute_pae(&envelope.payload_type, &payload);
    verifying_key
        .verify(&pae, &signature)
        .map_err(|e| format!("DSSE signature verification failed: {}", e))?;

    Ok(payload)
}

/// In-toto statement from the decoded payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InTotoStatement {
    #[serde(rename = "_type")]
    type_: String,
    subject: Vec<Subject>,
}

#[derive(Debug, Deserialize)]
struct Subject {
    #[allow(dead_code)]
    name: String,
    digest: std::collections::HashMap<String, String>,
}

fn verify_subject(payload: &[u8], subject_digest: &str) -> Result<(), String> {
    let statement: InTotoStatement = serde_json::from_slice(payload)
        .map_err(|e| format!("failed to parse statement: {}", e))?;

    if !statement.type_.starts_with("https://in-toto.io/Statement/") {
        return Err(format!("unexpected statement type: {}", statement.type_));
    }

    let matched = statement
        .subject
        .iter()
        .any(|s| s.digest.get("sha256").map(String::as_str) == Some(subject_digest));
    if !matched {
        return Err(format!("statement does not cover sha256:{}", subject_digest));
    }

    Ok(())
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use der::Encode;
    use p256::ecdsa::{signature::Signer, Signature, SigningKey};
    use p256::pkcs8::DecodePrivateKey;

    const FULCIO_ARC: [u64; 8] = [1, 3, 6, 1, 4, 1, 57264, 1];

    fn utf8_der(value: &str) -> Vec<u8> {
        der::asn1::Utf8StringRef::new(value).unwrap().to_der().unwrap()
    }

    fn fulcio_oid(last: u64) -> Vec<u64> {
        let mut oid = FULCIO_ARC.to_vec();
        oid.push(last);
        oid
    }

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    /// Certificate authority standing in for the Fulcio intermediate
    pub(crate) struct TestAuthority {
        issuer: rcgen::Issuer<'static, rcgen::KeyPair>,
        pem: String,
    }

    impl TestAuthority {
        pub(crate) fn new() -> Self {
            let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
            let mut params = rcgen::CertificateParams::default();
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            params.distinguished_name = rcgen::DistinguishedName::new();
            params.distinguished_name.push(rcgen::DnType::OrganizationName, "sigstore.dev");
            params.distinguished_name.push(rcgen::DnType::CommonName, "sigstore-intermediate");
            let cert = params.self_signed(&key).unwrap();
            Self { pem: cert.pem(), issuer: rcgen::Issuer::new(params, key) }
        }

        pub(crate) fn pem(&self) -> &str {
            &self.pem
        }

        pub(crate) fn trust_root(&self) -> TrustRoot {
            TrustRoot::from_pem(self.pem.as_bytes()).unwrap()
        }

        pub(crate) fn verifier(&self) -> DsseVerifier {
            DsseVerifier::new(self.trust_root())
        }

        /// Issue a leaf carrying Fulcio-style identity extensions
        pub(crate) fn issue(&self, issuer: &str, repository: &str, runner: Option<&str>) -> (Vec<u8>, SigningKey) {
            let leaf = Leaf::new(issuer, repository, runner);
            (leaf.issued_by(&self.issuer), leaf.signing_key)
        }
    }

    pub(crate) struct Leaf {
        params: rcgen::CertificateParams,
        key_pair: rcgen::KeyPair,
        signing_key: SigningKey,
    }

    impl Leaf {
        fn new(issuer: &str, repository: &str, runner: Option<&str>) -> Self {
            let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
            let signing_key = SigningKey::from_pkcs8_der(&key_pair.serialize_der()).unwrap();

            let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
            params
                .custom_extensions
                .push(rcgen::CustomExtension::from_oid_content(&fulcio_oid(8), utf8_der(issuer)));
            params
                .custom_extensions
                .push(rcgen::CustomExtension::from_oid_content(&fulcio_oid(12), utf8_der(repository)));
            if let Some(runner) = runner {
                params
                    .custom_extensions
                    .push(rcgen::CustomExtension::from_oid_content(&fulcio_oid(11), utf8_der(runner)));
            }
            Self { params, key_pair, signing_key }
        }

        fn issued_by(&self, issuer: &rcgen::Issuer<'_, rcgen::KeyPair>) -> Vec<u8> {
            self.params.signed_by(&self.key_pair, issuer).unwrap().der().to_vec()
        }

        fn self_signed(&self) -> Vec<u8> {
            self.params.self_signed(&self.key_pair).unwrap().der().to_vec()
        }
    }

    /// Mint a self-signed certificate with the same identity claims a Fulcio leaf carries
    pub(crate) fn self_signed_certificate(
        issuer: &str,
        repository: &str,
        runner: Option<&str>,
    ) -> (Vec<u8>, SigningKey) {
        let leaf = Leaf::new(issuer, repository, runner);
        (leaf.self_signed(), leaf.signing_key)
    }

    fn statement_for(digest: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "_type": "https://in-toto.io/Statement/v1",
            "subject": [{ "name": "artifact", "digest": { "sha256": digest } }],
            "predicateType": "https://slsa.dev/provenance/v1",
            "predicate": {},
        }))
        .unwrap()
    }

    /// Build a signed v0.3 bundle over an in-toto statement for `digest`
    pub(crate) fn signed_bundle(cert_der: &[u8], key: &SigningKey, digest: &str) -> Bundle {
        signed_bundle_at(cert_der, key, digest, now())
    }

    fn signed_bundle_at(cert_der: &[u8], key: &SigningKey, digest: &str, integrated_time: u64) -> Bundle {
        let b64 = base64::engine::general_purpose::STANDARD;
        let payload = statement_for(digest);
        let signature: Signature = key.sign(&compute_pae(IN_TOTO_PAYLOAD_TYPE, &payload));

        Bundle {
            media_type: "application/vnd.dev.sigstore.bundle.v0.3+json".to_string(),
            verification_material: VerificationMaterial {
                certificate: Some(RawBytes { raw_bytes: b64.encode(cert_der) }),
                x509_certificate_chain: None,
                tlog_entries: vec![TlogEntry { integrated_time: integrated_time.to_string() }],
            },
            dsse_envelope: Some(DsseEnvelope {
                payload: b64.encode(&payload),
                payload_type: IN_TOTO_PAYLOAD_TYPE.to_string(),
                signatures: vec![DsseSignature {
                    sig: b64.encode(signature.to_der().as_bytes()),
                    keyid: None,
                }],
            }),
        }
    }

    /// Rewrite a v0.3 bundle as v0.2 with `chain` (leaf first)
    fn as_chain_bundle(mut bundle: Bundle, chain: &[&[u8]]) -> Bundle {
        let b64 = base64::engine::general_purpose::STANDARD;
        bundle.media_type = "application/vnd.dev.sigstore.bundle+json;version=0.2".to_string();
        bundle.verification_material.certificate = None;
        bundle.verification_material.x509_certificate_chain = Some(CertificateChain {
            certificates: chain.iter().map(|der| RawBytes { raw_bytes: b64.encode(der) }).collect(),
        });
        bundle
    }

    const ISSUER: &str = "https://token.actions.githubusercontent.com";
    const REPO: &str = "https://github.com/tinfoilsh/tf-core";

    #[test]
    fn test_pae_encoding() {
        // Test vector from DSSE spec
        let payload_type = "http://example.com/HelloWorld";
        let payload = b"hello world";
        let pae = compute_pae(payload_type, payload);

        let expected = b"DSSEv1 29 http://example.com/HelloWorld 11 hello world";
        assert_eq!(pae, expected);
    }

    #[test]
    fn test_bundle_versions() {
        assert_eq!(
            BundleVersion::from_media_type("application/vnd.dev.sigstore.bundle+json;version=0.1"),
            Some(BundleVersion::V0_1)
        );
        assert_eq!(
            BundleVersion::from_media_type("application/vnd.dev.sigstore.bundle+json;version=0.2"),
            Some(BundleVersion::V0_2)
        );
        assert_eq!(
            BundleVersion::from_media_type("application/vnd.dev.sigstore.bundle.v0.3+json"),
            Some(BundleVersion::V0_3)
        );
        assert_eq!(BundleVersion::from_media_type("application/json"), None);
    }

    #[test]
    fn test_identity_extraction() {
        let (cert_der, _) = self_signed_certificate(ISSUER, REPO, Some("github-hosted"));
        let identity = CertificateIdentity::from_der(&cert_der).unwrap();

        assert_eq!(identity.issuer.as_deref(), Some(ISSUER));
        assert_eq!(identity.source_repository.as_deref(), Some(REPO));
        assert_eq!(identity.runner_environment.as_deref(), Some("github-hosted"));
        assert_eq!(identity.build_signer_uri, None);
    }

    #[test]
    fn test_missing_runner_extension_stays_absent() {
        let (cert_der, _) = self_signed_certificate(ISSUER, REPO, None);
        let identity = CertificateIdentity::from_der(&cert_der).unwrap();
        assert_eq!(identity.runner_environment, None);
    }

    #[test]
    fn test_trust_root_rejects_empty_pem() {
        assert!(TrustRoot::from_pem(b"").is_err());
        assert_eq!(TestAuthority::new().trust_root().len(), 1);
    }

    #[test]
    fn test_verify_valid_bundle() {
        let authority = TestAuthority::new();
        let digest = "ab".repeat(32);
        let (cert_der, key) = authority.issue(ISSUER, REPO, Some("github-hosted"));
        let bundle = signed_bundle(&cert_der, &key, &digest);

        let identity = authority.verifier().verify(&digest, &bundle).unwrap();
        assert_eq!(identity.source_repository.as_deref(), Some(REPO));
    }

    #[test]
    fn test_verify_legacy_chain_bundle() {
        let authority = TestAuthority::new();
        let digest = "cd".repeat(32);
        let (cert_der, key) = authority.issue(ISSUER, REPO, Some("github-hosted"));
        let bundle = as_chain_bundle(signed_bundle(&cert_der, &key, &digest), &[&cert_der]);

        assert!(authority.verifier().verify(&digest, &bundle).is_ok());
    }

    #[test]
    fn test_verify_rejects_self_signed_leaf() {
        let authority = TestAuthority::new();
        let digest = "77".repeat(32);
        let (cert_der, key) = self_signed_certificate(ISSUER, REPO, Some("github-hosted"));
        let bundle = signed_bundle(&cert_der, &key, &digest);

        let err = authority.verifier().verify(&digest, &bundle).unwrap_err();
        assert!(err.contains("does not chain to a trusted Fulcio authority"), "{err}");
    }

    #[test]
    fn test_verify_rejects_authority_with_same_name() {
        let trusted = TestAuthority::new();
        let impostor = TestAuthority::new();
        let digest = "77".repeat(32);
        let (cert_der, key) = impostor.issue(ISSUER, REPO, Some("github-hosted"));
        let bundle = signed_bundle(&cert_der, &key, &digest);

        let err = trusted.verifier().verify(&digest, &bundle).unwrap_err();
        assert!(err.contains("does not chain"), "{err}");
    }

    #[test]
    fn test_verify_rejects_leaf_acting_as_issuer() {
        let authority = TestAuthority::new();
        let digest = "77".repeat(32);

        // A genuine leaf for some other repository, used to sign a forged one
        let genuine = Leaf::new(ISSUER, "https://github.com/attacker/repo", Some("github-hosted"));
        let genuine_der = genuine.issued_by(&authority.issuer);
        let genuine_issuer = rcgen::Issuer::new(genuine.params, genuine.key_pair);

        let forged = Leaf::new(ISSUER, REPO, Some("github-hosted"));
        let forged_der = forged.issued_by(&genuine_issuer);
        let bundle = as_chain_bundle(
            signed_bundle(&forged_der, &forged.signing_key, &digest),
            &[&forged_der, &genuine_der],
        );

        let err = authority.verifier().verify(&digest, &bundle).unwrap_err();
        assert!(err.contains("does not chain"), "{err}");
    }

    #[test]
    fn test_verify_checks_validity_at_signing_time() {
        let authority = TestAuthority::new();
        let digest = "ab".repeat(32);
        let mut leaf = Leaf::new(ISSUER, REPO, Some("github-hosted"));
        leaf.params.not_before = rcgen::date_time_ymd(2024, 3, 1);
        leaf.params.not_after = rcgen::date_time_ymd(2024, 3, 2);
        let cert_der = leaf.issued_by(&authority.issuer);

        // 2024-03-01T12:00:00Z
        let inside = signed_bundle_at(&cert_der, &leaf.signing_key, &digest, 1_709_294_400);
        assert!(authority.verifier().verify(&digest, &inside).is_ok());

        let later = signed_bundle_at(&cert_der, &leaf.signing_key, &digest, now());
        let err = authority.verifier().verify(&digest, &later).unwrap_err();
        assert!(err.contains("not valid at signing time"), "{err}");
    }

    #[test]
    fn test_verify_requires_transparency_log_entry() {
        let authority = TestAuthority::new();
        let digest = "ab".repeat(32);
        let (cert_der, key) = authority.issue(ISSUER, REPO, Some("github-hosted"));
        let mut bundle = signed_bundle(&cert_der, &key, &digest);
        bundle.verification_material.tlog_entries.clear();

        let err = authority.verifier().verify(&digest, &bundle).unwrap_err();
        assert!(err.contains("no transparency log entry"), "{err}");
    }

    #[test]
    fn test_verify_rejects_other_subject() {
        let authority = TestAuthority::new();
        let (cert_der, key) = authority.issue(ISSUER, REPO, Some("github-hosted"));
        let bundle = signed_bundle(&cert_der, &key, &"ab".repeat(32));

        let err = authority.verifier().verify(&"ef".repeat(32), &bundle).unwrap_err();
        assert!(err.contains("does not cover"), "{err}");
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let authority = TestAuthority::new();
        let digest = "ab".repeat(32);
        let (cert_der, key) = authority.issue(ISSUER, REPO, Some("github-hosted"));
        let mut bundle = signed_bundle(&cert_der, &key, &digest);
        let mut tampered = statement_for(&digest);
        tampered.push(b' ');
        bundle.dsse_envelope.as_mut().unwrap().payload =
            base64::engine::general_purpose::STANDARD.encode(&tampered);

        assert!(authority.verifier().verify(&digest, &bundle).is_err());
    }

    #[test]
    fn test_verify_rejects_foreign_key() {
        let authority = TestAuthority::new();
        let digest = "ab".repeat(32);
        let (cert_der, _) = authority.issue(ISSUER, REPO, Some("github-hosted"));
        let (_, other_key) = authority.issue(ISSUER, REPO, Some("github-hosted"));
        let bundle = signed_bundle(&cert_der, &other_key, &digest);

        let err = authority.verifier().verify(&digest, &bundle).unwrap_err();
        assert!(err.contains("signature verification failed"), "{err}");
    }

    #[test]
    fn test_verify_rejects_unknown_media_type() {
        let authority = TestAuthority::new();
        let digest = "ab".repeat(32);
        let (cert_der, key) = authority.issue(ISSUER, REPO, Some("github-hosted"));
        let mut bundle = signed_bundle(&cert_der, &key, &digest);
        bundle.media_type = "application/vnd.example+json".to_string();

        let err = authority.verifier().verify(&digest, &bundle).unwrap_err();
        assert!(err.contains("unsupported bundle media type"), "{err}");
    }
}
