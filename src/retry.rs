//! Retry and redirect budgets.
//!
//! A [`Retry`] is never mutated in place: [`Retry::increment`] consumes an outcome and returns
//! the next state, or the terminal error once a budget runs out. A configuration shared between
//! requests therefore never accumulates another request's history.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use http::{header::RETRY_AFTER, HeaderMap, HeaderName, Method, StatusCode};

use crate::error::{Error, MaxRetryError, RetryReason};

const DEFAULT_METHOD_WHITELIST: [Method; 6] = [
    Method::HEAD,
    Method::GET,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::TRACE,
];

/// Statuses for which a `Retry-After` header makes a response retryable.
pub const RETRY_AFTER_STATUS_CODES: [u16; 3] = [413, 429, 503];

const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(120);

/// One attempt, as recorded in [`Retry::history`].
#[derive(Debug, Clone)]
pub struct RequestHistory {
    pub method: Method,
    pub url: String,
    pub error: Option<Arc<Error>>,
    pub status: Option<StatusCode>,
    pub redirect_location: Option<String>,
}

/// What happened on the attempt being accounted for.
#[derive(Debug)]
pub enum Outcome {
    /// The attempt failed before a usable response arrived.
    Error(Error),

    /// A response with a status that should be retried.
    Status(StatusCode),

    /// A redirect response that is about to be followed.
    Redirect { status: StatusCode, location: String },
}

/// Retry configuration and the state accumulated while following it.
///
/// Budgets are `None` when unlimited. Each specific budget (`connect`, `read`, `redirect`,
/// `status`) is spent together with `total`, and running any of them out ends the request with
/// [`Error::MaxRetry`].
#[derive(Debug, Clone)]
pub struct Retry {
    pub(crate) total: Option<u32>,
    pub(crate) connect: Option<u32>,
    pub(crate) read: Option<u32>,
    pub(crate) redirect: Option<u32>,
    pub(crate) status: Option<u32>,
    pub(crate) method_whitelist: Option<Vec<Method>>,
    pub(crate) status_forcelist: Vec<u16>,
    pub(crate) backoff_factor: f64,
    pub(crate) backoff_jitter: f64,
    pub(crate) backoff_max: Duration,
    pub(crate) raise_on_redirect: bool,
    pub(crate) raise_on_status: bool,
    pub(crate) respect_retry_after_header: bool,
    pub(crate) remove_headers_on_redirect: Vec<HeaderName>,
    pub(crate) history: Vec<RequestHistory>,
    disabled: bool,
}

impl Default for Retry {
    fn default() -> Self {
        Retry::new(3)
    }
}

impl Retry {
    /// Retry configuration allowing `total` retries of any kind.
    pub fn new(total: impl Into<Option<u32>>) -> Self {
        Retry {
            total: total.into(),
            connect: None,
            read: None,
            redirect: None,
            status: None,
            method_whitelist: Some(DEFAULT_METHOD_WHITELIST.to_vec()),
            status_forcelist: Vec::new(),
            backoff_factor: 0.0,
            backoff_jitter: 0.0,
            backoff_max: DEFAULT_BACKOFF_MAX,
            raise_on_redirect: true,
            raise_on_status: true,
            respect_retry_after_header: true,
            remove_headers_on_redirect: vec![http::header::AUTHORIZATION],
            history: Vec::new(),
            disabled: false,
        }
    }

    /// No retries and no redirects; transport errors surface unwrapped and redirect responses
    /// are returned as they are.
    pub fn disabled() -> Self {
        Retry {
            disabled: true,
            ..Retry::new(0).disable_redirects()
        }
    }

    /// Resolve a per-request retry option against the pool's default.
    ///
    /// A plain count with `redirect` off gets a zero redirect budget that returns the redirect
    /// response instead of raising.
    pub fn from_option(retries: Option<Retries>, redirect: bool, default: &Retry) -> Retry {
        match retries {
            None => default.clone(),
            Some(Retries::Config(retry)) => retry,
            Some(Retries::Disabled) => Retry::disabled(),
            Some(Retries::Count(total)) if redirect => Retry::new(total),
            Some(Retries::Count(total)) => Retry::new(total).disable_redirects(),
        }
    }

    fn disable_redirects(mut self) -> Self {
        self.redirect = Some(0);
        self.raise_on_redirect = false;
        self
    }

    /// Set the total budget. `None` leaves only the specific budgets in force.
    pub fn total(mut self, total: impl Into<Option<u32>>) -> Self {
        self.total = total.into();
        self
    }

    /// Set the budget for errors raised while connecting.
    pub fn connect(mut self, connect: impl Into<Option<u32>>) -> Self {
        self.connect = connect.into();
        self
    }

    /// Set the budget for errors raised after the request was sent.
    pub fn read(mut self, read: impl Into<Option<u32>>) -> Self {
        self.read = read.into();
        self
    }

    /// Set the number of redirects to follow.
    pub fn redirect(mut self, redirect: impl Into<Option<u32>>) -> Self {
        self.redirect = redirect.into();
        self
    }

    /// Set the budget for retries on forced statuses.
    pub fn status(mut self, status: impl Into<Option<u32>>) -> Self {
        self.status = status.into();
        self
    }

    /// Statuses that are always retried, given an idempotent method.
    ///
    /// By default, no status is forced.
    pub fn status_forcelist<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.status_forcelist = statuses.into_iter().collect();
        self
    }

    /// Methods eligible for read and status retries, compared case-insensitively.
    ///
    /// By default, HEAD, GET, PUT, DELETE, OPTIONS and TRACE.
    pub fn method_whitelist<I: IntoIterator<Item = Method>>(mut self, methods: I) -> Self {
        self.method_whitelist = Some(methods.into_iter().collect());
        self
    }

    /// Make every method eligible for read and status retries.
    pub fn any_method(mut self) -> Self {
        self.method_whitelist = None;
        self
    }

    /// Base of the exponential backoff, in seconds.
    ///
    /// By default, 0 which disables backoff.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Upper bound, in seconds, of a uniformly random extra backoff.
    ///
    /// By default, 0.
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    /// Cap on a single backoff wait.
    ///
    /// By default, 120 seconds.
    pub fn backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Whether exhausting the redirect budget raises or returns the last redirect response.
    ///
    /// By default, raises.
    pub fn raise_on_redirect(mut self, raise: bool) -> Self {
        self.raise_on_redirect = raise;
        self
    }

    /// Whether exhausting the status budget raises or returns the last response.
    ///
    /// By default, raises.
    pub fn raise_on_status(mut self, raise: bool) -> Self {
        self.raise_on_status = raise;
        self
    }

    /// Whether `Retry-After` takes precedence over the computed backoff.
    ///
    /// By default, it does.
    pub fn respect_retry_after_header(mut self, respect: bool) -> Self {
        self.respect_retry_after_header = respect;
        self
    }

    /// Headers stripped when a redirect leaves the original host.
    ///
    /// By default, `Authorization`. Names are case-insensitive; invalid names are logged and
    /// skipped.
    pub fn remove_headers_on_redirect<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.remove_headers_on_redirect = names
            .into_iter()
            .filter_map(|name| match HeaderName::from_bytes(name.as_ref().as_bytes()) {
                Ok(name) => Some(name),
                Err(err) => {
                    log::error!("Invalid header name {:?}: {}", name.as_ref(), err);
                    None
                }
            })
            .collect();
        self
    }

    pub fn total_budget(&self) -> Option<u32> {
        self.total
    }

    pub fn redirect_budget(&self) -> Option<u32> {
        self.redirect
    }

    pub fn status_budget(&self) -> Option<u32> {
        self.status
    }

    pub fn is_raise_on_redirect(&self) -> bool {
        self.raise_on_redirect
    }

    pub fn is_raise_on_status(&self) -> bool {
        self.raise_on_status
    }

    /// Attempts accounted for so far, oldest first.
    pub fn history(&self) -> &[RequestHistory] {
        &self.history
    }

    pub(crate) fn should_strip_header(&self, name: &HeaderName) -> bool {
        self.remove_headers_on_redirect.contains(name)
    }

    fn is_method_retryable(&self, method: &Method) -> bool {
        match &self.method_whitelist {
            Some(methods) => methods
                .iter()
                .any(|allowed| allowed.as_str().eq_ignore_ascii_case(method.as_str())),
            None => true,
        }
    }

    /// Whether a response should be retried rather than returned.
    pub fn is_retry(&self, method: &Method, status: StatusCode, has_retry_after: bool) -> bool {
        if !self.is_method_retryable(method) {
            return false;
        }

        if self.status_forcelist.contains(&status.as_u16()) {
            return true;
        }

        self.total != Some(0)
            && self.respect_retry_after_header
            && has_retry_after
            && RETRY_AFTER_STATUS_CODES.contains(&status.as_u16())
    }

    /// Account for one attempt and return the state for the next one.
    ///
    /// Fails with [`Error::MaxRetry`] when a budget is already spent. With retries disabled, or
    /// for a read error on a method outside the whitelist, the error itself is returned.
    pub fn increment(&self, method: &Method, url: &str, outcome: Outcome) -> Result<Retry, Error> {
        let reraise = match &outcome {
            Outcome::Error(err) => {
                self.disabled || (err.is_read_error() && !self.is_method_retryable(method))
            }
            _ => false,
        };

        if reraise {
            if let Outcome::Error(err) = outcome {
                return Err(err);
            }
        }

        let mut exhausted = false;
        let mut next = self.clone();
        next.total = spend(self.total, &mut exhausted);

        let (entry, reason) = match outcome {
            Outcome::Error(err) => {
                if err.is_connect_error() {
                    next.connect = spend(self.connect, &mut exhausted);
                } else if err.is_read_error() {
                    next.read = spend(self.read, &mut exhausted);
                }

                let err = Arc::new(err);
                let entry = RequestHistory {
                    method: method.clone(),
                    url: url.to_owned(),
                    error: Some(Arc::clone(&err)),
                    status: None,
                    redirect_location: None,
                };
                (entry, RetryReason::Error(err))
            }

            Outcome::Redirect { status, location } => {
                next.redirect = spend(self.redirect, &mut exhausted);

                let entry = RequestHistory {
                    method: method.clone(),
                    url: url.to_owned(),
                    error: None,
                    status: Some(status),
                    redirect_location: Some(location),
                };
                (entry, RetryReason::TooManyRedirects)
            }

            Outcome::Status(status) => {
                next.status = spend(self.status, &mut exhausted);

                let entry = RequestHistory {
                    method: method.clone(),
                    url: url.to_owned(),
                    error: None,
                    status: Some(status),
                    redirect_location: None,
                };
                (entry, RetryReason::TooManyErrorResponses(Some(status)))
            }
        };

        next.history.push(entry);

        if exhausted {
            return Err(Error::MaxRetry(MaxRetryError {
                url: url.to_owned(),
                reason,
                history: next.history,
            }));
        }

        log::debug!("Incremented Retry for (url='{}'): {}", url, next);

        Ok(next)
    }

    /// Exponential backoff for the current run of consecutive failures.
    ///
    /// Zero until at least two attempts in a row have failed; redirects reset the run.
    pub fn backoff_time(&self) -> Duration {
        let consecutive = self
            .history
            .iter()
            .rev()
            .take_while(|entry| entry.redirect_location.is_none())
            .count();

        if consecutive <= 1 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(consecutive - 1).unwrap_or(i32::MAX);
        let mut secs = self.backoff_factor * 2f64.powi(exponent);
        if self.backoff_jitter > 0.0 {
            secs += rand::random::<f64>() * self.backoff_jitter;
        }

        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64(secs.min(self.backoff_max.as_secs_f64()))
    }

    /// `Retry-After` wait from response headers, when it should be honored.
    fn retry_after(&self, headers: &HeaderMap) -> Result<Option<Duration>, Error> {
        if !self.respect_retry_after_header {
            return Ok(None);
        }

        match headers.get(RETRY_AFTER) {
            Some(value) => {
                let value = value.to_str().map_err(|_| {
                    Error::InvalidHeader(format!(
                        "Invalid Retry-After header: {}",
                        String::from_utf8_lossy(value.as_bytes())
                    ))
                })?;
                parse_retry_after(value).map(Some)
            }
            None => Ok(None),
        }
    }

    /// How long to wait before the next attempt.
    ///
    /// A respected `Retry-After` header wins over the exponential backoff.
    pub fn next_wait(&self, headers: Option<&HeaderMap>) -> Result<Duration, Error> {
        if let Some(headers) = headers {
            if let Some(wait) = self.retry_after(headers)? {
                return Ok(wait);
            }
        }

        Ok(self.backoff_time())
    }

    /// How long to wait before following a redirect; only `Retry-After` applies.
    pub fn redirect_wait(&self, headers: &HeaderMap) -> Result<Duration, Error> {
        Ok(self.retry_after(headers)?.unwrap_or(Duration::ZERO))
    }
}

/// Spend one unit of `budget`, flagging exhaustion instead of going below zero.
fn spend(budget: Option<u32>, exhausted: &mut bool) -> Option<u32> {
    match budget {
        Some(0) => {
            *exhausted = true;
            Some(0)
        }
        Some(n) => Some(n - 1),
        None => None,
    }
}

impl fmt::Display for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Budget(Option<u32>);

        impl fmt::Display for Budget {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    Some(n) => write!(f, "{}", n),
                    None => f.write_str("None"),
                }
            }
        }

        write!(
            f,
            "Retry(total={}, connect={}, read={}, redirect={}, status={})",
            Budget(self.total),
            Budget(self.connect),
            Budget(self.read),
            Budget(self.redirect),
            Budget(self.status),
        )
    }
}

/// Parse a `Retry-After` value: delay-seconds or an HTTP-date.
///
/// A date in the past yields a zero wait.
pub fn parse_retry_after(value: &str) -> Result<Duration, Error> {
    let invalid = || Error::InvalidHeader(format!("Invalid Retry-After header: {}", value));

    let trimmed = value.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let secs = trimmed.parse::<u64>().map_err(|_| invalid())?;
        return Ok(Duration::from_secs(secs));
    }

    let date = httpdate::parse_http_date(trimmed).map_err(|_| invalid())?;
    Ok(date
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO))
}

/// Per-request retry option.
#[derive(Debug, Clone)]
pub enum Retries {
    /// Allow this many retries of any kind.
    Count(u32),

    /// No retries and no redirects.
    Disabled,

    /// Full configuration.
    Config(Retry),
}

impl From<u32> for Retries {
    fn from(total: u32) -> Self {
        Retries::Count(total)
    }
}

impl From<bool> for Retries {
    fn from(enabled: bool) -> Self {
        if enabled {
            Retries::Config(Retry::default())
        } else {
            Retries::Disabled
        }
    }
}

impl From<Retry> for Retries {
    fn from(retry: Retry) -> Self {
        Retries::Config(retry)
    }
}
