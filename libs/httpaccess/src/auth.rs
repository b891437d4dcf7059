use crate::error::HttpAccessError;
use crate::request::Verb;
use async_trait::async_trait;

/// What an authenticator sees of the request it signs.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticationContext<'a> {
    pub verb: Verb,
    /// Target URL as given by the caller, without merged parameters
    pub url: &'a str,
    /// Form parameters supplied by the caller, in order
    pub parameters: &'a [(String, String)],
}

/// Extra request material produced by a [`RequestAuthenticator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationMaterial {
    /// Merged into the query string (GET, DELETE, raw bodies) or the form (POST, PUT)
    pub parameters: Vec<(String, String)>,
    /// Set on the request after caller headers, replacing same-named ones
    pub headers: Vec<(String, String)>,
}

impl AuthenticationMaterial {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.headers.is_empty()
    }
}

/// Computes request-signing parameters and headers.
///
/// Signing schemes live outside this crate; the executor only merges what the
/// authenticator returns.
#[async_trait]
pub trait RequestAuthenticator: Send + Sync {
    /// # Errors
    /// Implementations return [`HttpAccessError::Authentication`] when the
    /// request cannot be signed; the request is then not sent.
    async fn authenticate(
        &self,
        context: &AuthenticationContext<'_>,
        signing_elements: &[String],
    ) -> Result<AuthenticationMaterial, HttpAccessError>;
}
