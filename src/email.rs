//! Email address parsing, canonicalization and deliverability checks.
//!
//! Canonical form is used as the account key: plus-addressing is cut off
//! and dots and dashes are removed from the local part, so
//! `john.doe+news@x.com` and `johndoe@x.com` name the same account.

use std::fmt;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use regex_lite::Regex;

static EMAIL_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,10}$")
        .expect("email grammar must compile")
});

pub type Result<T> = std::result::Result<T, EmailError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EmailError {
    #[error("invalid email format")]
    InvalidFormat,
    #[error("email domain has neither mail exchanger nor address record")]
    InvalidHost,
    #[error("email domain suffix is not managed by ICANN")]
    InvalidSuffix,
}

impl EmailError {
    /// Message shown next to the form field.
    pub fn message(&self) -> &'static str {
        match self {
            EmailError::InvalidFormat => "Invalid email address.",
            EmailError::InvalidHost | EmailError::InvalidSuffix => {
                "Email address seems not real."
            },
        }
    }
}

/// A syntactically valid `local@domain` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmailAddress {
    local_part: String,
    domain: String,
}

impl EmailAddress {
    /// Check `raw` against the address grammar and split it at the last `@`.
    pub fn parse(raw: &str) -> Result<Self> {
        if !EMAIL_FORMAT.is_match(raw) {
            return Err(EmailError::InvalidFormat);
        }

        let (local_part, domain) =
            raw.rsplit_once('@').ok_or(EmailError::InvalidFormat)?;

        Ok(Self {
            local_part: local_part.to_owned(),
            domain: domain.to_owned(),
        })
    }

    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

/// Canonicalize an address without any network check.
pub fn sanitize(raw: &str) -> Result<EmailAddress> {
    let email = EmailAddress::parse(&raw.trim().to_lowercase())?;

    let local_part = email
        .local_part
        .split('+')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !matches!(c, '.' | '-'))
        .collect::<String>();

    EmailAddress::parse(&format!("{local_part}@{}", email.domain))
}

/// Require the public suffix of `domain` to be in the ICANN section of the
/// public suffix list.
pub fn validate_icann_suffix(domain: &str) -> Result<()> {
    let domain = domain.to_lowercase();
    match psl::suffix(domain.as_bytes()) {
        Some(suffix) if suffix.typ() == Some(psl::Type::Icann) => Ok(()),
        _ => Err(EmailError::InvalidSuffix),
    }
}

/// Port for checking that a domain can receive mail.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// Whether `domain` has a mail exchanger, or at least an address record.
    async fn accepts_mail(&self, domain: &str) -> bool;
}

/// DNS-backed [`DomainResolver`].
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    /// Use the host resolver configuration, or public defaults when it
    /// cannot be read.
    pub fn new() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(err) => {
                tracing::warn!(error = %err, "system resolver configuration unavailable, using defaults");
                TokioAsyncResolver::tokio(
                    ResolverConfig::default(),
                    ResolverOpts::default(),
                )
            },
        };

        Self { resolver }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainResolver for DnsResolver {
    async fn accepts_mail(&self, domain: &str) -> bool {
        // Trailing dot stops search-domain expansion.
        let fqdn = format!("{}.", domain.trim_end_matches('.'));

        match self.resolver.mx_lookup(fqdn.as_str()).await {
            Ok(records) if records.iter().next().is_some() => return true,
            Ok(_) => {},
            Err(err) => tracing::debug!(%domain, error = %err, "mx lookup failed"),
        }

        match self.resolver.lookup_ip(fqdn.as_str()).await {
            Ok(ips) => ips.iter().next().is_some(),
            Err(err) => {
                tracing::debug!(%domain, error = %err, "address lookup failed");
                false
            },
        }
    }
}

/// Canonicalizes addresses and, on request, checks their domain.
#[derive(Clone)]
pub struct EmailValidator {
    resolver: Arc<dyn DomainResolver>,
}

impl EmailValidator {
    pub fn new(resolver: Arc<dyn DomainResolver>) -> Self {
        Self { resolver }
    }

    /// [`sanitize`], then when `validate_host` is set require a reachable,
    /// ICANN-managed domain. DNS failures are not retried.
    pub async fn sanitize(
        &self,
        raw: &str,
        validate_host: bool,
    ) -> Result<EmailAddress> {
        let email = sanitize(raw)?;

        if validate_host {
            if !self.resolver.accepts_mail(email.domain()).await {
                return Err(EmailError::InvalidHost);
            }
            validate_icann_suffix(email.domain())?;
        }

        Ok(email)
    }
}

#[cfg(test)]
pub struct StaticResolver {
    domains: Vec<String>,
}

#[cfg(test)]
impl StaticResolver {
    pub fn new(domains: &[&str]) -> Self {
        Self {
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl DomainResolver for StaticResolver {
    async fn accepts_mail(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_address() {
        let email = EmailAddress::parse("John.Doe@mail.dev").unwrap();
        assert_eq!(email.local_part(), "John.Doe");
        assert_eq!(email.domain(), "mail.dev");
        assert_eq!(email.to_string(), "John.Doe@mail.dev");
    }

    #[test]
    fn test_parse_rejects_bad_format() {
        for raw in [
            "",
            "invalid_email",
            "@test.com",
            "invalid_email.test.com",
            "invalid_email@localhost",
            "invalid_email@testcom",
            "invalid_email@test.",
            "invalid_email@test.c",
            "invalid_email@test.business-test",
            "invalid_email@test.businesstest",
            "test#john@gmail.com",
        ] {
            assert_eq!(
                EmailAddress::parse(raw),
                Err(EmailError::InvalidFormat),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(
            sanitize("test.test@mail.dev").unwrap().to_string(),
            "testtest@mail.dev"
        );
        assert_eq!(
            sanitize("test+test@mail.dev").unwrap().to_string(),
            "test@mail.dev"
        );
        assert_eq!(
            sanitize("  Jo-hn.Doe+Promo.X@Mail.DEV ").unwrap().to_string(),
            "johndoe@mail.dev"
        );
        assert_eq!(
            sanitize("Test@Gmail.com").unwrap().to_string(),
            "test@gmail.com"
        );
    }

    #[test]
    fn test_sanitize_merges_variants() {
        assert_eq!(
            sanitize("john.doe+promo@x.com").unwrap(),
            sanitize("johndoe@x.com").unwrap()
        );
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for raw in [
            "john.doe+promo@x.com",
            "A-B.C@Example.ORG",
            "plain@domain.io",
            "x+y+z@sub.domain.co",
        ] {
            let once = sanitize(raw).unwrap();
            let twice = sanitize(&once.to_string()).unwrap();
            assert_eq!(once, twice, "{raw}");
        }
    }

    #[test]
    fn test_sanitize_rejects_empty_local_part() {
        assert_eq!(sanitize("+tag@x.com"), Err(EmailError::InvalidFormat));
        assert_eq!(sanitize(".-@x.com"), Err(EmailError::InvalidFormat));
    }

    #[test]
    fn test_icann_suffix() {
        assert!(validate_icann_suffix("gmail.com").is_ok());
        assert!(validate_icann_suffix("example.co.uk").is_ok());
        assert_eq!(
            validate_icann_suffix("gmail.test"),
            Err(EmailError::InvalidSuffix)
        );
    }

    #[tokio::test]
    async fn test_validator_checks_host_on_request() {
        let validator =
            EmailValidator::new(Arc::new(StaticResolver::new(&["gmail.com"])));

        assert_eq!(
            validator.sanitize("john+x@gmail.com", true).await.unwrap().to_string(),
            "john@gmail.com"
        );
        assert_eq!(
            validator.sanitize("john@nowhere.com", true).await,
            Err(EmailError::InvalidHost)
        );
        assert!(validator.sanitize("john@nowhere.com", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_validator_rejects_non_icann_suffix() {
        let validator =
            EmailValidator::new(Arc::new(StaticResolver::new(&["gmail.test"])));

        assert_eq!(
            validator.sanitize("test@gmail.test", true).await,
            Err(EmailError::InvalidSuffix)
        );
    }
}
