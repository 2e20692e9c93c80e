//! Trust policy over Sigstore signer identities
//!
//! A [`TrustPolicy`] is the conjunction of atomic [`Predicate`]s. Every
//! predicate must hold for a certificate to be accepted; a single failing or
//! undecidable predicate rejects it.

use std::fmt;
use std::sync::Arc;

use crate::sigstore::CertificateIdentity;

/// GitHub Actions OIDC issuer
pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Runner environment value Fulcio records for GitHub-hosted runners
pub const HOSTED_RUNNER_MARKER: &str = "github-hosted";

/// Why a certificate failed a predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    IssuerMismatch { expected: String, actual: Option<String> },
    RepositoryMismatch { expected: String, actual: Option<String> },
    NotHostedRunner { actual: Option<String> },
    EmptyPolicy,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IssuerMismatch { expected, actual } => {
                write!(f, "issuer mismatch: expected {}, got {}", expected, or_missing(actual))
            }
            Self::RepositoryMismatch { expected, actual } => {
                write!(f, "source repository mismatch: expected {}, got {}", expected, or_missing(actual))
            }
            Self::NotHostedRunner { actual: None } => {
                write!(f, "runner environment extension missing; cannot prove hosted runner")
            }
            Self::NotHostedRunner { actual: Some(actual) } => {
                write!(f, "runner environment is {}, not {}", actual, HOSTED_RUNNER_MARKER)
            }
            Self::EmptyPolicy => write!(f, "policy has no predicates"),
        }
    }
}

fn or_missing(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("<missing>")
}

/// One atomic check against a signer identity
pub trait Predicate: fmt::Debug + Send + Sync {
    fn check(&self, cert: &CertificateIdentity) -> Result<(), Violation>;
}

/// OIDC issuer equals a required URL
#[derive(Debug, Clone)]
pub struct IssuerMatches(pub String);

impl Predicate for IssuerMatches {
    fn check(&self, cert: &CertificateIdentity) -> Result<(), Violation> {
        match &cert.issuer {
            Some(issuer) if *issuer == self.0 => Ok(()),
            actual => Err(Violation::IssuerMismatch {
                expected: self.0.clone(),
                actual: actual.clone(),
            }),
        }
    }
}

/// Workflow source repository equals a required identifier
#[derive(Debug, Clone)]
pub struct SourceRepositoryMatches(pub String);

impl Predicate for SourceRepositoryMatches {
    fn check(&self, cert: &CertificateIdentity) -> Result<(), Violation> {
        match &cert.source_repository {
            Some(repo) if *repo == self.0 => Ok(()),
            actual => Err(Violation::RepositoryMismatch {
                expected: self.0.clone(),
                actual: actual.clone(),
            }),
        }
    }
}

/// The build ran on a platform-hosted runner. Fails closed when the
/// runner environment extension is absent.
#[derive(Debug, Clone, Copy)]
pub struct HostedRunnerOnly;

impl Predicate for HostedRunnerOnly {
    fn check(&self, cert: &CertificateIdentity) -> Result<(), Violation> {
        match cert.runner_environment.as_deref() {
            Some(HOSTED_RUNNER_MARKER) => Ok(()),
            _ => Err(Violation::NotHostedRunner {
                actual: cert.runner_environment.clone(),
            }),
        }
    }
}

/// Immutable conjunction of predicates
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    predicates: Vec<Arc<dyn Predicate>>,
}

impl TrustPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate to the conjunction
    pub fn and(mut self, predicate: impl Predicate + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Policy for artifacts built by GitHub Actions in `repo` (`owner/name`)
    /// on a GitHub-hosted runner
    pub fn github_actions(repo: &str) -> Self {
        Self::new()
            .and(IssuerMatches(GITHUB_ACTIONS_ISSUER.to_string()))
            .and(SourceRepositoryMatches(format!("https://github.com/{}", repo)))
            .and(HostedRunnerOnly)
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Check every predicate, reporting the first violation.
    ///
    /// An empty policy rejects everything.
    pub fn check(&self, cert: &CertificateIdentity) -> Result<(), Violation> {
        if self.predicates.is_empty() {
            return Err(Violation::EmptyPolicy);
        }
        for predicate in &self.predicates {
            predicate.check(cert)?;
        }
        Ok(())
    }

    pub fn evaluate(&self, cert: &CertificateIdentity) -> bool {
        self.check(cert).is_ok()
    }
}
