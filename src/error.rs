//! Error taxonomy of the certificate lifecycle.
//!
//! Every failure is classified where it happens into one of three kinds. Callers never
//! see raw transport, storage or cryptography errors, only a [`CertificateError`] whose
//! `anyhow` chain keeps the underlying cause for diagnostics.

use thiserror::Error;

pub type ManagerResult<T> = Result<T, CertificateError>;

#[derive(Debug, Error)]
pub enum CertificateError {
    /// Session, registration, revocation, deactivation or local storage failure.
    #[error("ACME client error: {0:#}")]
    AcmeClient(anyhow::Error),
    /// Order creation, challenge response or finalization failure.
    #[error("ACME challenge error: {0:#}")]
    AcmeChallenge(anyhow::Error),
    /// The remote DNS challenge API did not accept a request.
    #[error("remote DNS API error: {0:#}")]
    NabuCasa(anyhow::Error),
}

impl CertificateError {
    /// Challenge and remote API failures are refinements of a client failure.
    pub fn is_client_error(&self) -> bool {
        true
    }

    pub fn is_challenge_error(&self) -> bool {
        matches!(self, CertificateError::AcmeChallenge(_))
    }

    pub fn is_remote_api_error(&self) -> bool {
        matches!(self, CertificateError::NabuCasa(_))
    }

    pub fn inner(&self) -> &anyhow::Error {
        match self {
            CertificateError::AcmeClient(err)
            | CertificateError::AcmeChallenge(err)
            | CertificateError::NabuCasa(err) => err,
        }
    }
}

pub trait AcmeErrorContext<T> {
    fn client_failure(self) -> ManagerResult<T>;
    fn challenge_failure(self) -> ManagerResult<T>;
    fn remote_api_failure(self) -> ManagerResult<T>;
}

impl<T> AcmeErrorContext<T> for anyhow::Error {
    fn client_failure(self) -> ManagerResult<T> {
        Err(CertificateError::AcmeClient(self))
    }

    fn challenge_failure(self) -> ManagerResult<T> {
        Err(CertificateError::AcmeChallenge(self))
    }

    fn remote_api_failure(self) -> ManagerResult<T> {
        Err(CertificateError::NabuCasa(self))
    }
}

impl<T, E> AcmeErrorContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn client_failure(self) -> ManagerResult<T> {
        self.map_err(|err| CertificateError::AcmeClient(err.into()))
    }

    fn challenge_failure(self) -> ManagerResult<T> {
        self.map_err(|err| CertificateError::AcmeChallenge(err.into()))
    }

    fn remote_api_failure(self) -> ManagerResult<T> {
        self.map_err(|err| CertificateError::NabuCasa(err.into()))
    }
}
