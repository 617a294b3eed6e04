//! Per-host leaf certificate minting.
//!
//! Leaves are short-lived server certificates signed by the local root,
//! cached in memory by port-stripped host so repeated CONNECTs to the same
//! origin reuse one key pair.

use log::debug;
use moka::sync::Cache;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rsa::RsaPrivateKey;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::{Duration, OffsetDateTime};

use crate::proxy::ca::{parse_rsa_private_key, random_serial, rcgen_key_pair, CaMaterial, RSA_KEY_BITS};
use crate::utils::error::{AppError, AppResult};

/// Subject organization stamped on every leaf
const LEAF_ORGANIZATION: &str = "CetiProbe MITM";

/// Leaf validity and cache lifetime
pub const LEAF_TTL: StdDuration = StdDuration::from_secs(24 * 60 * 60);

/// Backdating applied to `not_before` to absorb clock skew
const NOT_BEFORE_SKEW_MIN: i64 = 5;

/// A minted leaf certificate with its private key, both PEM
#[derive(Debug, Clone)]
pub struct LeafCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Signs per-host server certificates from the root CA.
pub struct LeafSigner {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_pem: String,
    ttl: StdDuration,
    cache: Cache<String, Arc<LeafCert>>,
}

impl LeafSigner {
    pub fn new(material: &CaMaterial) -> AppResult<Self> {
        Self::with_ttl(material, LEAF_TTL)
    }

    pub fn with_ttl(material: &CaMaterial, ttl: StdDuration) -> AppResult<Self> {
        let ca_key: RsaPrivateKey = parse_rsa_private_key(&material.key_pem)?;
        let key_pair = rcgen_key_pair(&ca_key)?;
        let issuer = Issuer::from_ca_cert_pem(&material.cert_pem, key_pair)
            .map_err(|e| AppError::CertificateError(format!("CA issuer setup failed: {}", e)))?;

        Ok(Self {
            issuer,
            ca_cert_pem: material.cert_pem.clone(),
            ttl,
            cache: Cache::builder()
                .max_capacity(1024)
                .time_to_live(ttl)
                .build(),
        })
    }

    /// Mint (or fetch from cache) a server certificate for `host`. A
    /// `:port` suffix is stripped before signing and caching.
    pub fn sign_host(&self, host: &str) -> AppResult<Arc<LeafCert>> {
        let host = host.split(':').next().unwrap_or(host).to_string();

        if let Some(cached) = self.cache.get(&host) {
            debug!("leaf cache hit for {}", host);
            return Ok(cached);
        }

        let leaf = Arc::new(self.mint(&host)?);
        self.cache.insert(host, leaf.clone());
        Ok(leaf)
    }

    /// The root certificate PEM, appended to served chains so clients can
    /// build a path to the installed trust anchor.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn mint(&self, host: &str) -> AppResult<LeafCert> {
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
            .map_err(|e| AppError::CertificateError(format!("RSA key generation failed: {}", e)))?;
        let key_pair = rcgen_key_pair(&rsa_key)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
        params.distinguished_name = dn;

        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(NOT_BEFORE_SKEW_MIN);
        params.not_after = now
            + Duration::try_from(self.ttl)
                .map_err(|e| AppError::CertificateError(format!("leaf TTL out of range: {}", e)))?;

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let san = host
            .try_into()
            .map_err(|_| AppError::CertificateError(format!("invalid DNS name: {}", host)))?;
        params.subject_alt_names = vec![SanType::DnsName(san)];

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| AppError::CertificateError(format!("leaf signing failed: {}", e)))?;

        debug!("minted leaf certificate for {}", host);

        Ok(LeafCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ca::{generate_ca_at, CaFiles, CA_COMMON_NAME};
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::*;

    fn signer() -> LeafSigner {
        let files =
            CaFiles::at(std::env::temp_dir().join(format!("cetiprobe-leaf-{}", uuid::Uuid::new_v4())));
        let material = generate_ca_at(&files).unwrap();
        LeafSigner::new(&material).unwrap()
    }

    fn parse(pem: &[u8]) -> x509_parser::pem::Pem {
        parse_x509_pem(pem).unwrap().1
    }

    #[test]
    fn leaf_carries_host_cn_and_single_dns_san() {
        let signer = signer();
        let leaf = signer.sign_host("example.com").unwrap();

        let doc = parse(leaf.cert_pem.as_bytes());
        let cert = doc.parse_x509().unwrap();

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
            .unwrap();
        assert_eq!(cn, "example.com");

        let issuer_cn = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
            .unwrap();
        assert_eq!(issuer_cn, CA_COMMON_NAME);

        let san = cert.subject_alternative_name().unwrap().unwrap();
        let names: Vec<_> = san.value.general_names.iter().collect();
        assert_eq!(names.len(), 1);
        match names[0] {
            GeneralName::DNSName(name) => assert_eq!(*name, "example.com"),
            other => panic!("unexpected SAN {:?}", other),
        }
    }

    #[test]
    fn validity_window_honors_ttl_with_backdating() {
        let signer = signer();
        let leaf = signer.sign_host("short.example").unwrap();

        let doc = parse(leaf.cert_pem.as_bytes());
        let cert = doc.parse_x509().unwrap();
        let not_before = cert.validity().not_before.to_datetime();
        let not_after = cert.validity().not_after.to_datetime();

        let lifetime = not_after - not_before;
        let ttl = Duration::try_from(LEAF_TTL).unwrap();
        assert!(lifetime <= ttl + Duration::minutes(10));
        assert!(lifetime >= ttl);
    }

    #[test]
    fn repeated_signing_hits_the_cache_and_strips_ports() {
        let signer = signer();
        let first = signer.sign_host("example.com:443").unwrap();
        let second = signer.sign_host("example.com:443").unwrap();
        let third = signer.sign_host("example.com").unwrap();

        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.cert_pem, third.cert_pem);
        assert_eq!(first.key_pem, third.key_pem);
    }

    #[test]
    fn distinct_hosts_get_distinct_keys() {
        let signer = signer();
        let a = signer.sign_host("a.example").unwrap();
        let b = signer.sign_host("b.example").unwrap();
        assert_ne!(a.cert_pem, b.cert_pem);
        assert_ne!(a.key_pem, b.key_pem);
    }
}
