/// Replacement written after the `password` key of a redacted URL
pub const PASSWORD_MASK: &str = "=*****";

const PASSWORD_KEY: &str = "password";

/// Hide everything after a `password` key found in the query string.
///
/// The key is searched case-insensitively after the first `?`. When found, the
/// URL is cut right after the key and [`PASSWORD_MASK`] is appended, so any
/// parameters following the password are dropped from the rendered URL too.
///
/// ```
/// use httpaccess::security::redact_url;
///
/// assert_eq!(
///     redact_url("https://host/x?password=secret123"),
///     "https://host/x?password=*****"
/// );
/// ```
#[must_use]
pub fn redact_url(url: &str) -> String {
    let Some(query_start) = url.find('?') else {
        return url.to_owned();
    };
    // ASCII lowercasing keeps byte offsets aligned with `url`
    let query = url[query_start..].to_ascii_lowercase();
    match query.find(PASSWORD_KEY) {
        Some(offset) => {
            let cut = query_start + offset + PASSWORD_KEY.len();
            format!("{}{PASSWORD_MASK}", &url[..cut])
        }
        None => url.to_owned(),
    }
}
