use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, USER_AGENT,
};

use super::FetchError;

/// Header carrying the API language
pub const API_LANG: HeaderName = HeaderName::from_static("x-api-lang");

/// Build headers for ticketing API requests
///
/// The session cookie is attached when given. The reservation endpoint
/// expects the JSON content type even on GET requests from the browser app,
/// so it is always set.
///
/// # Examples
///
/// ```
/// use slotrush::client::headers::build_api_headers;
///
/// let headers = build_api_headers("Mozilla/5.0", "ja", Some("session_id=abc")).unwrap();
/// assert_eq!(headers["x-api-lang"], "ja");
/// ```
pub fn build_api_headers(
    user_agent: &str,
    api_lang: &str,
    cookie: Option<&str>,
) -> Result<HeaderMap, FetchError> {
    let mut headers = HeaderMap::new();

    headers.insert(USER_AGENT, header_value(user_agent)?);
    headers.insert(API_LANG, header_value(api_lang)?);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json;charset=UTF-8"),
    );

    if let Some(cookie) = cookie {
        let mut value = header_value(cookie)?;
        value.set_sensitive(true);
        headers.insert(COOKIE, value);
    }

    Ok(headers)
}

fn header_value(raw: &str) -> Result<HeaderValue, FetchError> {
    HeaderValue::from_str(raw.trim()).map_err(|e| FetchError::InvalidHeader(e.to_string()))
}
