/// Default allow-list of accepted response status codes
pub const DEFAULT_AUTHORIZED_STATUS_CODES: &str = "200,201,202";

/// Decides whether a response status counts as success.
///
/// Closures of shape `Fn(u16) -> bool` implement this trait, so a call site
/// can accept e.g. every 2xx and 3xx status without a dedicated type:
///
/// ```
/// use httpaccess::ResponseStatusValidator;
///
/// let accept_2xx_3xx = |status: u16| (200..400).contains(&status);
/// assert!(accept_2xx_3xx.validate(302));
/// ```
pub trait ResponseStatusValidator: Send + Sync {
    /// Returns `true` when `status` is accepted
    fn validate(&self, status: u16) -> bool;
}

impl<F> ResponseStatusValidator for F
where
    F: Fn(u16) -> bool + Send + Sync,
{
    fn validate(&self, status: u16) -> bool {
        self(status)
    }
}

/// Accepts the status codes of a comma-separated allow-list.
///
/// Entries are trimmed and compared to the decimal status as text, so an entry
/// such as `2xx` never matches anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleResponseValidator {
    authorized: Vec<String>,
}

impl SimpleResponseValidator {
    /// Build a validator from a list such as `"200, 201, 202"`
    #[must_use]
    pub fn new(authorized_codes: &str) -> Self {
        Self {
            authorized: authorized_codes
                .split(',')
                .map(|code| code.trim().to_owned())
                .collect(),
        }
    }

    /// Configured codes, trimmed
    #[must_use]
    pub fn authorized_codes(&self) -> &[String] {
        &self.authorized
    }
}

impl Default for SimpleResponseValidator {
    fn default() -> Self {
        Self::new(DEFAULT_AUTHORIZED_STATUS_CODES)
    }
}

impl ResponseStatusValidator for SimpleResponseValidator {
    fn validate(&self, status: u16) -> bool {
        let status = status.to_string();
        self.authorized.iter().any(|code| *code == status)
    }
}
