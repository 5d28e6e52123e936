//! Roles: the policy applied when issuing certificates.

use std::net::IpAddr;
use serde::{Deserialize, Serialize};
use crate::commons::{PkiEmptyResult, PkiResult};
use crate::commons::crypto::{
    ec_curve, ExtKeyUsage, KeyUsage, PrivateKeyType, SubjectName,
    MIN_RSA_BITS,
};
use crate::commons::error::Error;
use crate::config::IssuanceConfig;


//------------ TtlPolicy -----------------------------------------------------

/// What happens when a requested TTL exceeds the maximum.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlPolicy {
    /// Reduce the TTL to the maximum.
    #[default]
    Clamp,

    /// Reject the request.
    Strict,
}


//------------ NotAfterBehavior ----------------------------------------------

/// What happens when a certificate would outlive its issuer.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotAfterBehavior {
    /// Reject the request.
    #[default]
    Err,

    /// End the validity with the issuer’s.
    Truncate,
}


//------------ RoleKeyType ---------------------------------------------------

/// The key types a role accepts.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKeyType {
    #[default]
    Rsa,
    Ec,
    Ed25519,
    Any,
}

impl RoleKeyType {
    fn fixed(self) -> Option<PrivateKeyType> {
        match self {
            RoleKeyType::Rsa => Some(PrivateKeyType::Rsa),
            RoleKeyType::Ec => Some(PrivateKeyType::Ec),
            RoleKeyType::Ed25519 => Some(PrivateKeyType::Ed25519),
            RoleKeyType::Any => None,
        }
    }
}


//------------ Role ----------------------------------------------------------

/// The named policy for issuing certificates.
///
/// TTL values are in seconds. A `key_bits` of zero means the configured
/// default for the key type.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Role {
    pub name: String,

    pub ttl: Option<u64>,
    pub max_ttl: Option<u64>,
    pub ttl_policy: TtlPolicy,
    pub not_after_behavior: NotAfterBehavior,

    pub allow_any_name: bool,
    pub allowed_domains: Vec<String>,
    pub allow_bare_domains: bool,
    pub allow_subdomains: bool,
    pub allow_glob_domains: bool,
    pub allow_localhost: bool,
    pub allow_ip_sans: bool,
    pub allowed_uri_sans: Vec<String>,
    pub enforce_hostnames: bool,
    pub require_cn: bool,
    pub use_csr_common_name: bool,

    pub key_type: RoleKeyType,
    pub key_bits: u32,

    pub key_usage: Vec<KeyUsage>,
    pub ext_key_usage: Vec<ExtKeyUsage>,
    pub server_flag: bool,
    pub client_flag: bool,
    pub code_signing_flag: bool,
    pub email_protection_flag: bool,

    pub organization: Vec<String>,
    pub ou: Vec<String>,
    pub country: Vec<String>,
    pub locality: Vec<String>,
    pub province: Vec<String>,
}

impl Default for Role {
    fn default() -> Self {
        Role {
            name: String::new(),
            ttl: None,
            max_ttl: None,
            ttl_policy: TtlPolicy::default(),
            not_after_behavior: NotAfterBehavior::default(),
            allow_any_name: false,
            allowed_domains: Vec::new(),
            allow_bare_domains: false,
            allow_subdomains: false,
            allow_glob_domains: false,
            allow_localhost: true,
            allow_ip_sans: true,
            allowed_uri_sans: Vec::new(),
            enforce_hostnames: true,
            require_cn: true,
            use_csr_common_name: true,
            key_type: RoleKeyType::default(),
            key_bits: 0,
            key_usage: vec![
                KeyUsage::DigitalSignature,
                KeyUsage::KeyAgreement,
                KeyUsage::KeyEncipherment,
            ],
            ext_key_usage: Vec::new(),
            server_flag: true,
            client_flag: true,
            code_signing_flag: false,
            email_protection_flag: false,
            organization: Vec::new(),
            ou: Vec::new(),
            country: Vec::new(),
            locality: Vec::new(),
            province: Vec::new(),
        }
    }
}

impl Role {
    /// Returns the role used for CA certificates.
    ///
    /// It accepts any name and key type and ends the validity with the
    /// issuer’s if needed.
    pub fn for_ca() -> Self {
        Role {
            name: "ca".into(),
            not_after_behavior: NotAfterBehavior::Truncate,
            allow_any_name: true,
            enforce_hostnames: false,
            use_csr_common_name: true,
            key_type: RoleKeyType::Any,
            key_usage: vec![
                KeyUsage::DigitalSignature,
                KeyUsage::CertSign,
                KeyUsage::CrlSign,
            ],
            server_flag: false,
            client_flag: false,
            ..Default::default()
        }
    }

    /// Returns the subject for a certificate with the given common name.
    pub fn subject(&self, common_name: Option<String>) -> SubjectName {
        SubjectName {
            common_name,
            organization: self.organization.clone(),
            organizational_unit: self.ou.clone(),
            country: self.country.clone(),
            locality: self.locality.clone(),
            province: self.province.clone(),
        }
    }
}


/// # TTL
impl Role {
    /// Returns the effective maximum TTL.
    pub fn max_ttl(&self, config: &IssuanceConfig) -> u64 {
        match self.max_ttl {
            Some(max) if max > 0 => max.min(config.max_ttl_seconds),
            _ => config.max_ttl_seconds,
        }
    }

    /// Resolves the TTL for a request.
    ///
    /// A missing or zero TTL falls back to the role’s TTL and then to the
    /// configured default. Such a fallback is always clamped to the
    /// maximum. A requested TTL above the maximum is clamped or rejected
    /// according to the role’s TTL policy.
    pub fn resolve_ttl(
        &self, requested: Option<u64>, config: &IssuanceConfig
    ) -> PkiResult<u64> {
        let max = self.max_ttl(config);
        let Some(ttl) = requested.filter(|ttl| *ttl > 0) else {
            return Ok(
                self.ttl.filter(|ttl| *ttl > 0)
                    .unwrap_or(config.default_ttl_seconds)
                    .min(max)
            )
        };
        if ttl <= max {
            return Ok(ttl)
        }
        match self.ttl_policy {
            TtlPolicy::Clamp => Ok(max),
            TtlPolicy::Strict => Err(Error::policy(format!(
                "TTL of {ttl} seconds exceeds the maximum of {max} seconds"
            ))),
        }
    }
}


/// # Names
impl Role {
    /// Checks that a DNS name or email address may be certified.
    pub fn check_name(&self, name: &str) -> PkiEmptyResult {
        let host = match name.rsplit_once('@') {
            Some((_, domain)) => domain,
            None => name,
        };

        if self.enforce_hostnames && !is_valid_hostname(host) {
            return Err(Error::policy(format!(
                "'{name}' is not a valid hostname"
            )))
        }
        if self.allow_any_name {
            return Ok(())
        }
        if self.allow_localhost && is_localhost(host) {
            return Ok(())
        }
        for domain in &self.allowed_domains {
            if self.allow_bare_domains && host == domain {
                return Ok(())
            }
            if self.allow_subdomains {
                if let Some(prefix) = host.strip_suffix(domain.as_str()) {
                    if prefix.len() > 1 && prefix.ends_with('.') {
                        return Ok(())
                    }
                }
            }
            if self.allow_glob_domains && domain.contains('*')
                && glob_match(domain, host)
            {
                return Ok(())
            }
        }
        Err(Error::policy(format!(
            "name '{name}' not allowed by role '{}'", self.name
        )))
    }

    /// Checks IP SANs against the role.
    pub fn check_ip_sans(&self, ips: &[IpAddr]) -> PkiEmptyResult {
        if !ips.is_empty() && !self.allow_ip_sans {
            return Err(Error::policy(format!(
                "role '{}' does not allow IP SANs", self.name
            )))
        }
        Ok(())
    }

    /// Checks URI SANs against the allowed patterns.
    pub fn check_uri_sans(&self, uris: &[String]) -> PkiEmptyResult {
        for uri in uris {
            if !self.allowed_uri_sans.iter().any(|pattern| {
                glob_match(pattern, uri)
            }) {
                return Err(Error::policy(format!(
                    "URI SAN '{uri}' not allowed by role '{}'", self.name
                )))
            }
        }
        Ok(())
    }
}


/// # Keys
impl Role {
    /// Resolves type and size of a key to be generated.
    pub fn resolve_key_params(
        &self,
        requested_type: Option<PrivateKeyType>,
        requested_bits: Option<u32>,
        config: &IssuanceConfig,
    ) -> PkiResult<(PrivateKeyType, u32)> {
        let key_type = match (self.key_type.fixed(), requested_type) {
            (Some(fixed), Some(requested)) if fixed != requested => {
                return Err(Error::policy(format!(
                    "role '{}' requires {fixed} keys, not {requested}",
                    self.name
                )))
            }
            (Some(fixed), _) => fixed,
            (None, Some(requested)) => requested,
            (None, None) => PrivateKeyType::Rsa,
        };
        let bits = requested_bits.filter(|bits| *bits > 0)
            .or((self.key_bits > 0).then_some(self.key_bits))
            .unwrap_or_else(|| {
                key_type.default_bits(
                    config.default_rsa_bits, config.default_ec_bits
                )
            });
        self.check_key(key_type, bits)?;
        Ok((key_type, bits))
    }

    /// Checks that a key of the given type and size is acceptable.
    pub fn check_key(
        &self, key_type: PrivateKeyType, bits: u32
    ) -> PkiEmptyResult {
        if let Some(fixed) = self.key_type.fixed() {
            if fixed != key_type {
                return Err(Error::policy(format!(
                    "role '{}' requires {fixed} keys, not {key_type}",
                    self.name
                )))
            }
        }
        match key_type {
            PrivateKeyType::Rsa => {
                let min = MIN_RSA_BITS.max(self.key_bits);
                if bits < min {
                    return Err(Error::policy(format!(
                        "RSA keys need at least {min} bits, got {bits}"
                    )))
                }
            }
            PrivateKeyType::Ec => {
                if ec_curve(bits).is_none() {
                    return Err(Error::policy(format!(
                        "unsupported EC key size {bits}"
                    )))
                }
                if bits < self.key_bits {
                    return Err(Error::policy(format!(
                        "EC keys need at least {} bits, got {bits}",
                        self.key_bits
                    )))
                }
            }
            PrivateKeyType::Ed25519 => { }
            PrivateKeyType::Unknown => {
                return Err(Error::policy("unsupported key type"))
            }
        }
        Ok(())
    }
}


/// # Usage
impl Role {
    /// Returns all extended key usages the role permits.
    pub fn permitted_ext_key_usage(&self) -> Vec<ExtKeyUsage> {
        let mut res = self.ext_key_usage.clone();
        let flags = [
            (self.server_flag, ExtKeyUsage::ServerAuth),
            (self.client_flag, ExtKeyUsage::ClientAuth),
            (self.code_signing_flag, ExtKeyUsage::CodeSigning),
            (self.email_protection_flag, ExtKeyUsage::EmailProtection),
        ];
        for (set, usage) in flags {
            if set {
                res.push(usage)
            }
        }
        res.sort();
        res.dedup();
        res
    }

    /// Narrows the permitted extended key usages to the requested ones.
    ///
    /// An empty request keeps everything the role permits.
    pub fn narrow_ext_key_usage(
        &self, requested: &[ExtKeyUsage]
    ) -> PkiResult<Vec<ExtKeyUsage>> {
        let permitted = self.permitted_ext_key_usage();
        if requested.is_empty() {
            return Ok(permitted)
        }
        if let Some(usage) = requested.iter().find(|usage| {
            !permitted.contains(usage)
        }) {
            return Err(Error::policy(format!(
                "extended key usage {usage} not permitted by role '{}'",
                self.name
            )))
        }
        let mut res = requested.to_vec();
        res.sort();
        res.dedup();
        Ok(res)
    }
}


//------------ Helpers -------------------------------------------------------

fn is_localhost(host: &str) -> bool {
    host == "localhost" || host == "localdomain"
        || host.ends_with(".localhost") || host.ends_with(".localdomain")
}

/// Returns whether the name is a hostname, allowing a leading wildcard.
pub(super) fn is_valid_hostname(name: &str) -> bool {
    let name = name.strip_prefix("*.").unwrap_or(name);
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false
    }
    name.split('.').all(|label| {
        !label.is_empty() && label.len() <= 63
            && !label.starts_with('-') && !label.ends_with('-')
            && label.bytes().all(|ch| {
                ch.is_ascii_alphanumeric() || ch == b'-' || ch == b'_'
            })
    })
}

/// Matches `text` against a pattern where `*` matches any sequence.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        }
        else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        }
        else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        }
        else {
            return false
        }
    }
    pattern[p..].iter().all(|ch| *ch == b'*')
}


//------------ Tests ---------------------------------------------------------
