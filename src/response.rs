use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::{h1::ResponseHead, redirect, retry::Retry, url::Url};

/// A fully read HTTP response.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    retries: Option<Retry>,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, body: Bytes, url: Url) -> Self {
        Response {
            status: head.status,
            version: head.version,
            headers: head.headers,
            body,
            url,
            retries: None,
        }
    }

    pub(crate) fn with_retries(mut self, retries: Retry) -> Self {
        self.retries = Some(retries);
        self
    }

    pub(crate) fn take_retries(&mut self) -> Option<Retry> {
        self.retries.take()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// URL of the request that produced this response.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Retry state after the request completed, including its history.
    pub fn retries(&self) -> Option<&Retry> {
        self.retries.as_ref()
    }

    /// `Location` header, when this is a redirect response.
    pub fn redirect_location(&self) -> Option<String> {
        redirect::redirect_location(self.status, &self.headers)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nResponse {:?} {}", self.version, self.status)?;
        writeln!(f, "  url: {}", self.url)?;
        writeln!(f, "  headers:")?;
        for (key, val) in self.headers.iter() {
            writeln!(f, "    {:?}: {:?}", key, val)?;
        }
        writeln!(f, "  body: {} bytes", self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use http::{header, HeaderValue};

    use super::*;

    fn response(status: StatusCode, headers: HeaderMap, body: &'static str) -> Response {
        Response::new(
            ResponseHead {
                status,
                version: Version::HTTP_11,
                headers,
            },
            Bytes::from_static(body.as_bytes()),
            Url::parse("http://localhost/").unwrap(),
        )
    }

    #[test]
    fn test_json_and_text() {
        let res = response(StatusCode::OK, HeaderMap::new(), r#"{"a": [1, 2]}"#);
        let value: serde_json::Value = res.json().unwrap();
        assert_eq!(value["a"][1], 2);
        assert_eq!(res.text(), r#"{"a": [1, 2]}"#);
        assert!(res.retries().is_none());
    }

    #[test]
    fn test_redirect_location() {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/elsewhere"));

        let res = response(StatusCode::TEMPORARY_REDIRECT, headers.clone(), "");
        assert_eq!(res.redirect_location().as_deref(), Some("/elsewhere"));

        let res = response(StatusCode::CREATED, headers, "");
        assert_eq!(res.redirect_location(), None);
    }
}
