use std::time::{Duration, Instant};

/// Connect, read and total time budgets for one request.
///
/// The total budget bounds connecting plus every read; `None` means no limit. A `Timeout` is
/// cloned per request and started when the first connection attempt begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeout {
    connect: Option<Duration>,
    read: Option<Duration>,
    total: Option<Duration>,
    started: Option<Instant>,
}

impl Timeout {
    /// Timeout with separate connect and read limits and no total limit.
    pub fn new(connect: Option<Duration>, read: Option<Duration>) -> Self {
        Timeout {
            connect,
            read,
            total: None,
            started: None,
        }
    }

    /// Use the same limit for connecting and for each read.
    pub fn from_duration(timeout: Duration) -> Self {
        Timeout::new(Some(timeout), Some(timeout))
    }

    /// Set the connect limit.
    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    /// Set the limit for each read.
    pub fn read(mut self, timeout: Duration) -> Self {
        self.read = Some(timeout);
        self
    }

    /// Set the limit for connecting and reading combined.
    pub fn total(mut self, timeout: Duration) -> Self {
        self.total = Some(timeout);
        self
    }

    /// Copy of this configuration with the clock reset.
    pub fn fresh(&self) -> Self {
        Timeout {
            started: None,
            ..*self
        }
    }

    /// Start the clock, unless already started.
    pub(crate) fn start_connect(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.map_or(Duration::ZERO, |started| started.elapsed())
    }

    /// Time allowed for establishing the connection.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match (self.connect, self.total) {
            (Some(connect), Some(total)) => Some(connect.min(total)),
            (connect, None) => connect,
            (None, total) => total,
        }
    }

    /// Time allowed for the next read, accounting for time already spent.
    ///
    /// Never negative; an exhausted total budget yields zero.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_remaining(Duration::ZERO)
    }

    /// Like [`read_timeout`](Self::read_timeout) for a read that has already waited `idle`.
    pub(crate) fn read_remaining(&self, idle: Duration) -> Option<Duration> {
        let read = self.read.map(|read| read.saturating_sub(idle));

        match self.total {
            Some(total) => {
                let remaining = total.saturating_sub(self.elapsed());
                Some(read.map_or(remaining, |read| read.min(remaining)))
            }
            None => read,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(timeout: Duration) -> Self {
        Timeout::from_duration(timeout)
    }
}
