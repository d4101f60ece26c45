//! Redirect planning: where to go next and what to send there.

use http::{header, HeaderMap, Method, StatusCode};

use crate::{error::Error, retry::Retry, url::Url};

/// Statuses that carry a redirect when paired with a `Location` header.
pub const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

/// `Location` of a redirect response, if it is one.
pub fn redirect_location(status: StatusCode, headers: &HeaderMap) -> Option<String> {
    if !REDIRECT_STATUSES.contains(&status.as_u16()) {
        return None;
    }

    headers
        .get(header::LOCATION)
        .map(|location| String::from_utf8_lossy(location.as_bytes()).into_owned())
}

/// The request to send after following a redirect.
#[derive(Debug)]
pub struct RedirectPlan {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    /// The request body must not be resent.
    pub drop_body: bool,
}

/// Whether two URLs share scheme, host and effective port.
pub(crate) fn is_same_origin(a: &Url, b: &Url) -> bool {
    a.scheme().unwrap_or("http") == b.scheme().unwrap_or("http")
        && a.host() == b.host()
        && a.port_or_default() == b.port_or_default()
}

/// Compute the follow-up request for a redirect from `from` to `location`.
///
/// A 303 switches to GET without a body. Leaving the origin strips every header listed in the
/// retry configuration's removal set.
pub fn plan(
    retry: &Retry,
    method: &Method,
    headers: &HeaderMap,
    from: &Url,
    status: StatusCode,
    location: &str,
) -> Result<RedirectPlan, Error> {
    let url = from.join(location)?;
    let mut headers = headers.clone();

    let see_other = status == StatusCode::SEE_OTHER && *method != Method::HEAD;
    let method = if see_other { Method::GET } else { method.clone() };

    if see_other {
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::TRANSFER_ENCODING);
    }

    if !is_same_origin(from, &url) {
        let stripped: Vec<_> = headers
            .keys()
            .filter(|name| retry.should_strip_header(name))
            .cloned()
            .collect();

        for name in stripped {
            headers.remove(&name);
        }
    }

    // a Host header pinned to the old origin would misroute the next request
    headers.remove(header::HOST);

    Ok(RedirectPlan {
        url,
        method,
        headers,
        drop_body: see_other,
    })
}
