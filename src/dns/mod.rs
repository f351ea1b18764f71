use chrono::{DateTime, Utc};
#[cfg(not(test))]
use hickory_resolver::{
    Resolver, config::ResolverConfig, name_server::TokioConnectionProvider,
};
use serde::Serialize;
use tracing::{debug, trace};

#[cfg(test)]
use crate::dns::mock;

/// TXT record label checked during domain verification.
pub const VERIFICATION_TXT_LABEL: &str = "_driftmail-verification";

/// MX priority suggested in the setup instructions.
pub const MX_PRIORITY: u16 = 10;

/// DNS records the owner is asked to create for a pending domain.
#[derive(Debug, Serialize)]
pub struct DnsInstructions {
    pub mx_host: String,
    pub mx_priority: u16,
    pub txt_name: String,
    pub txt_value: String,
}

/// Outcome of one verification probe. Verification is all-or-nothing:
/// both checks must pass.
#[derive(Debug, Serialize)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub mx_record_found: bool,
    pub txt_record_found: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DomainVerifier {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    pub(crate) resolver: mock::Resolver,
    mail_hostname: String,
}

impl DomainVerifier {
    #[cfg(not(test))]
    pub fn new(mail_hostname: String) -> Self {
        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::cloudflare(),
                TokioConnectionProvider::default(),
            )
            .build(),
            mail_hostname,
        }
    }

    #[cfg(test)]
    pub fn mock(mail_hostname: &str, resolver: mock::Resolver) -> Self {
        Self {
            resolver,
            mail_hostname: mail_hostname.to_string(),
        }
    }

    pub fn instructions(&self, domain: &str, token: &str) -> DnsInstructions {
        DnsInstructions {
            mx_host: self.mail_hostname.clone(),
            mx_priority: MX_PRIORITY,
            txt_name: format!("{VERIFICATION_TXT_LABEL}.{domain}"),
            txt_value: token.to_string(),
        }
    }

    /// Probes MX and TXT. DNS lookup errors count as a failed check, not
    /// an internal error: the caller gets a structured outcome either way.
    pub async fn verify(&self, domain: &str, expected_token: &str) -> VerificationOutcome {
        let mx_record_found = self.check_mx(domain).await;
        let txt_record_found = self.check_txt(domain, expected_token).await;

        debug!(
            domain,
            mx_record_found, txt_record_found, "domain verification probe"
        );

        VerificationOutcome {
            verified: mx_record_found && txt_record_found,
            mx_record_found,
            txt_record_found,
            checked_at: Utc::now(),
        }
    }

    async fn check_mx(&self, domain: &str) -> bool {
        // fully qualified lookups are cheaper and unambiguous
        let name = format!("{}.", domain.trim_end_matches('.'));

        let Ok(lookup) = self.resolver.mx_lookup(&name).await else {
            return false;
        };

        let expected = self.mail_hostname.trim_end_matches('.').to_lowercase();

        lookup.iter().any(|mx| {
            let exchange = mx.exchange().to_utf8();
            trace!(domain, exchange, "mx candidate");
            exchange.trim_end_matches('.').to_lowercase() == expected
        })
    }

    async fn check_txt(&self, domain: &str, expected_token: &str) -> bool {
        let name = format!(
            "{VERIFICATION_TXT_LABEL}.{}.",
            domain.trim_end_matches('.')
        );

        let Ok(lookup) = self.resolver.txt_lookup(&name).await else {
            return false;
        };

        lookup.iter().any(|record| {
            let data: Vec<u8> = record.txt_data().iter().flatten().copied().collect();
            match String::from_utf8(data) {
                Ok(value) => unquote(&value) == expected_token,
                Err(_) => false,
            }
        })
    }
}

/// Some providers hand the TXT payload back with its surrounding quotes.
fn unquote(value: &str) -> &str {
    value
        .trim()
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or_else(|| value.trim())
}

/// Domain name validation per RFC 1035 label rules, plus a reserved list
/// the service will never verify.
pub fn valid_domain_name(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 || !name.contains('.') {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

const RESERVED_DOMAINS: &[&str] = &[
    "localhost",
    "example.com",
    "example.net",
    "example.org",
];

pub fn reserved_domain(name: &str) -> bool {
    let name = name.trim_end_matches('.').to_lowercase();
    RESERVED_DOMAINS
        .iter()
        .any(|reserved| name == *reserved || name.ends_with(&format!(".{reserved}")))
}

/// A minimal mock-up for hickory_resolver
#[cfg(test)]
pub(crate) mod mock {
    #[derive(Clone, Debug, Default)]
    pub struct Resolver {
        pub mx: Vec<(u16, &'static str)>,
        pub txt: Vec<&'static str>,
    }

    impl Resolver {
        pub async fn mx_lookup(
            &self,
            _: impl AsRef<str>,
        ) -> Result<Vec<Mx>, hickory_resolver::ResolveError> {
            Ok(self.mx.iter().map(|&(preference, host)| Mx { preference, host }).collect())
        }

        pub async fn txt_lookup(
            &self,
            _: impl AsRef<str>,
        ) -> Result<Vec<Txt>, hickory_resolver::ResolveError> {
            Ok(self.txt.iter().map(|&data| Txt(data)).collect())
        }
    }

    #[derive(Debug)]
    pub struct Mx {
        preference: u16,
        host: &'static str,
    }

    impl Mx {
        #[allow(dead_code)]
        pub fn preference(&self) -> u16 {
            self.preference
        }

        pub fn exchange(&self) -> ToStr {
            ToStr(self.host)
        }
    }

    pub struct ToStr(&'static str);

    impl ToStr {
        pub fn to_utf8(&self) -> String {
            self.0.into()
        }
    }

    #[derive(Debug)]
    pub struct Txt(pub &'static str);

    impl Txt {
        pub fn txt_data(&self) -> [Vec<u8>; 1] {
            [self.0.as_bytes().to_vec()]
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn verifier(mx: Vec<(u16, &'static str)>, txt: Vec<&'static str>) -> DomainVerifier {
        DomainVerifier::mock("mx.driftmail.io", mock::Resolver { mx, txt })
    }

    #[tokio::test]
    async fn verify_passes_with_both_records() {
        let verifier = verifier(vec![(10, "mx.driftmail.io.")], vec!["vrf_abc123"]);

        let outcome = verifier.verify("foo.test", "vrf_abc123").await;
        assert!(outcome.verified);
        assert!(outcome.mx_record_found);
        assert!(outcome.txt_record_found);
    }

    #[tokio::test]
    async fn mx_match_is_case_insensitive_and_dot_tolerant() {
        let verifier = verifier(vec![(20, "MX.Driftmail.IO.")], vec!["vrf_abc123"]);

        let outcome = verifier.verify("foo.test", "vrf_abc123").await;
        assert!(outcome.mx_record_found);
    }

    #[tokio::test]
    async fn txt_value_is_quote_unwrapped() {
        let verifier = verifier(vec![(10, "mx.driftmail.io")], vec!["\"vrf_abc123\""]);

        let outcome = verifier.verify("foo.test", "vrf_abc123").await;
        assert!(outcome.txt_record_found);
    }

    #[tokio::test]
    async fn missing_txt_fails_with_structured_result() {
        let verifier = verifier(vec![(10, "mx.driftmail.io")], vec![]);

        let outcome = verifier.verify("foo.test", "vrf_abc123").await;
        assert!(!outcome.verified);
        assert!(outcome.mx_record_found);
        assert!(!outcome.txt_record_found);
    }

    #[tokio::test]
    async fn wrong_token_fails() {
        let verifier = verifier(vec![(10, "mx.driftmail.io")], vec!["vrf_other"]);

        let outcome = verifier.verify("foo.test", "vrf_abc123").await;
        assert!(!outcome.verified);
    }

    #[tokio::test]
    async fn foreign_mx_only_fails() {
        let verifier = verifier(vec![(10, "mx.elsewhere.example")], vec!["vrf_abc123"]);

        let outcome = verifier.verify("foo.test", "vrf_abc123").await;
        assert!(!outcome.mx_record_found);
        assert!(!outcome.verified);
    }

    #[test]
    fn domain_name_rules() {
        assert!(valid_domain_name("foo.test"));
        assert!(valid_domain_name("sub.foo-bar.example"));
        assert!(valid_domain_name("foo.test."));

        assert!(!valid_domain_name(""));
        assert!(!valid_domain_name("nodots"));
        assert!(!valid_domain_name("-bad.test"));
        assert!(!valid_domain_name("bad-.test"));
        assert!(!valid_domain_name("ba_d.test"));
        assert!(!valid_domain_name(&format!("{}.test", "a".repeat(64))));
        assert!(!valid_domain_name(&"a.".repeat(130)));
    }

    #[test]
    fn reserved_list() {
        assert!(reserved_domain("example.com"));
        assert!(reserved_domain("mail.example.com"));
        assert!(reserved_domain("LOCALHOST"));
        assert!(!reserved_domain("driftmail.io"));
        assert!(!reserved_domain("foo.test"));
    }
}
