//! Line classification for forwarder debug logs.
//!
//! Every line of a log is tested against an ordered table of rules. Rules are
//! independent: a single line may fire several rules from different
//! categories, and every rule is evaluated for every line. Counter rules only
//! need to match, sample rules extract one or two integers from capture
//! groups. Lines that match nothing are ignored.

use std::fmt;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Errors produced while classifying a line.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A capture group matched digits that do not fit the sample type.
    #[error("line {line}: rule {rule} captured malformed number {text:?}")]
    MalformedNumericCapture {
        /// Name of the rule that fired
        rule: &'static str,
        /// 1-based line number in the scanned log
        line: u64,
        /// The captured text
        text: String,
    },
}

/// Independent line counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Outgoing event batch posts
    EventPost,
    /// Outgoing ack poll requests
    AckPoll,
    /// Empty event posts used as a preflight check
    EmptyEventCheck,
    /// Polls of the health endpoint
    HealthCheck,
    /// Ack checks used as a preflight check
    AckCheck,
    /// Spins of the load balancer waiting for an available channel
    LbSpin,
    /// Session-Cookie changes, i.e. sticky session violations
    CookieViolation,
    /// 503 responses to event posts
    EventPostBusy,
    /// 503 responses to ack polls
    AckPollBusy,
    /// 503 responses seen by the generic callbacks
    GenericBusy,
    /// Channels transitioning to unavailable
    ChannelUnavailable,
    /// Channels transitioning to available
    ChannelAvailable,
}

impl Counter {
    /// Every counter, in report order.
    pub const ALL: [Counter; 12] = [
        Counter::EventPost,
        Counter::AckPoll,
        Counter::EmptyEventCheck,
        Counter::HealthCheck,
        Counter::AckCheck,
        Counter::LbSpin,
        Counter::CookieViolation,
        Counter::EventPostBusy,
        Counter::AckPollBusy,
        Counter::GenericBusy,
        Counter::ChannelUnavailable,
        Counter::ChannelAvailable,
    ];

    /// The counters that are outgoing requests. Their sum is the total number
    /// of requests.
    pub const REQUESTS: [Counter; 5] = [
        Counter::EventPost,
        Counter::AckPoll,
        Counter::EmptyEventCheck,
        Counter::HealthCheck,
        Counter::AckCheck,
    ];

    /// Stable snake case name of this counter.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Counter::EventPost => "event_post",
            Counter::AckPoll => "ack_poll",
            Counter::EmptyEventCheck => "empty_event_check",
            Counter::HealthCheck => "health_check",
            Counter::AckCheck => "ack_check",
            Counter::LbSpin => "lb_spin",
            Counter::CookieViolation => "cookie_violation",
            Counter::EventPostBusy => "event_post_busy",
            Counter::AckPollBusy => "ack_poll_busy",
            Counter::GenericBusy => "generic_busy",
            Counter::ChannelUnavailable => "channel_unavailable",
            Counter::ChannelAvailable => "channel_available",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single effect of a rule firing on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Increment a counter
    Count(Counter),
    /// A response was received after this many milliseconds
    ResponseTime(u64),
    /// A batch was acknowledged after this many milliseconds
    AckTime(u64),
    /// An ack poll succeeded for `received` out of `requested` ack ids
    AckSuccess {
        /// Ack ids reported as acknowledged
        received: u64,
        /// Ack ids sent in the poll
        requested: u64,
    },
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Count(Counter),
    ResponseTime,
    AckTime,
    AckSuccess,
}

#[derive(Debug)]
struct Rule {
    name: &'static str,
    kind: Kind,
    regex: Regex,
}

impl Rule {
    fn new(name: &'static str, kind: Kind, pattern: &str) -> Self {
        Self {
            name,
            kind,
            regex: Regex::new(pattern).expect("Invalid regex pattern provided"),
        }
    }

    fn counter(counter: Counter, pattern: &str) -> Self {
        Self::new(counter.name(), Kind::Count(counter), pattern)
    }

    fn number(&self, caps: &Captures<'_>, group: usize, line: u64) -> Result<u64, Error> {
        let text = caps.get(group).map_or("", |m| m.as_str());
        text.parse::<u64>()
            .map_err(|_| Error::MalformedNumericCapture {
                rule: self.name,
                line,
                text: text.to_string(),
            })
    }

    fn apply(&self, input: &str, line: u64) -> Result<Option<Observation>, Error> {
        let observation = match self.kind {
            Kind::Count(counter) => self
                .regex
                .is_match(input)
                .then_some(Observation::Count(counter)),
            Kind::ResponseTime => match self.regex.captures(input) {
                Some(caps) => Some(Observation::ResponseTime(self.number(&caps, 1, line)?)),
                None => None,
            },
            Kind::AckTime => match self.regex.captures(input) {
                Some(caps) => Some(Observation::AckTime(self.number(&caps, 1, line)?)),
                None => None,
            },
            Kind::AckSuccess => match self.regex.captures(input) {
                Some(caps) => Some(Observation::AckSuccess {
                    received: self.number(&caps, 1, line)?,
                    requested: self.number(&caps, 2, line)?,
                }),
                None => None,
            },
        };
        Ok(observation)
    }
}

// Search semantics, not anchored. The table order is the report order of the
// counters followed by the sample rules.
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule::counter(Counter::EventPost, r"executing event batch post"),
        Rule::counter(Counter::AckPoll, r"executing ack poll request"),
        Rule::counter(Counter::EmptyEventCheck, r"executing empty event post"),
        Rule::counter(Counter::HealthCheck, r"executing poll on health endpoint"),
        Rule::counter(Counter::AckCheck, r"executing ack check"),
        Rule::counter(Counter::LbSpin, r"load balancer waited 1"),
        Rule::counter(Counter::CookieViolation, r"to change the Session-Cookie"),
        Rule::counter(Counter::EventPostBusy, r"503 response from event"),
        Rule::counter(Counter::AckPollBusy, r"503 response from ack"),
        Rule::counter(Counter::GenericBusy, r"503 response in HttpCallbacksGeneric"),
        Rule::counter(Counter::ChannelUnavailable, r"channel became unavailable"),
        Rule::counter(Counter::ChannelAvailable, r"channel became available"),
        Rule::new(
            "response_time",
            Kind::ResponseTime,
            r"Response received\. .* took ([0-9]+) ms",
        ),
        Rule::new(
            "ack_time",
            Kind::AckTime,
            r"byte batch acknowledged in ([0-9]+) ms",
        ),
        Rule::new(
            "ack_success",
            Kind::AckSuccess,
            r"received success on ([0-9]+) ack ids out of ([0-9]+)",
        ),
    ]
});

/// Classifies a single line.
///
/// `line` is the 1-based position of `input` in the log and is only used for
/// error reporting. Returns every observation the line produced, in rule
/// order. An empty vector means the line is not recognized.
///
/// # Errors
///
/// Returns [`Error::MalformedNumericCapture`] if a sample rule matched digits
/// that do not fit in a `u64`.
pub fn classify(input: &str, line: u64) -> Result<Vec<Observation>, Error> {
    let mut observations = Vec::new();
    for rule in RULES.iter() {
        if let Some(observation) = rule.apply(input, line)? {
            observations.push(observation);
        }
    }
    Ok(observations)
}

/// Accumulated counters and sample series of one scan.
///
/// Series are append-only while scanning and read-only afterward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    counters: [u64; Counter::ALL.len()],
    response_times: Vec<u64>,
    ack_times: Vec<u64>,
    acks_received: Vec<u64>,
    ack_ids_requested: Vec<u64>,
    acks_received_nonzero: Vec<u64>,
    lines: u64,
    recognized_lines: u64,
}

impl Tally {
    /// Create an empty tally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `input` and fold the result into this tally.
    ///
    /// Returns the number of observations the line produced.
    ///
    /// # Errors
    ///
    /// See [`classify`]. On error the tally is left untouched.
    pub fn observe(&mut self, input: &str, line: u64) -> Result<usize, Error> {
        let observations = classify(input, line)?;
        self.lines += 1;
        if !observations.is_empty() {
            self.recognized_lines += 1;
        }
        for observation in &observations {
            self.record(*observation);
        }
        Ok(observations.len())
    }

    /// Fold a single observation into this tally.
    pub fn record(&mut self, observation: Observation) {
        match observation {
            Observation::Count(counter) => self.counters[counter.index()] += 1,
            Observation::ResponseTime(ms) => self.response_times.push(ms),
            Observation::AckTime(ms) => self.ack_times.push(ms),
            Observation::AckSuccess {
                received,
                requested,
            } => {
                self.acks_received.push(received);
                self.ack_ids_requested.push(requested);
                if received > 0 {
                    self.acks_received_nonzero.push(received);
                }
            }
        }
    }

    /// Current value of `counter`.
    #[must_use]
    pub fn count(&self, counter: Counter) -> u64 {
        self.counters[counter.index()]
    }

    /// Sum of the outgoing request counters.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        Counter::REQUESTS.iter().map(|c| self.count(*c)).sum()
    }

    /// Response times in milliseconds, in log order.
    #[must_use]
    pub fn response_times(&self) -> &[u64] {
        &self.response_times
    }

    /// Batch acknowledgement times in milliseconds, in log order.
    #[must_use]
    pub fn ack_times(&self) -> &[u64] {
        &self.ack_times
    }

    /// Ack ids acknowledged per successful ack poll.
    #[must_use]
    pub fn acks_received(&self) -> &[u64] {
        &self.acks_received
    }

    /// Ack ids sent per successful ack poll.
    #[must_use]
    pub fn ack_ids_requested(&self) -> &[u64] {
        &self.ack_ids_requested
    }

    /// Ack ids acknowledged per successful ack poll that acknowledged at
    /// least one.
    #[must_use]
    pub fn acks_received_nonzero(&self) -> &[u64] {
        &self.acks_received_nonzero
    }

    /// Number of lines observed.
    #[must_use]
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Number of observed lines that fired at least one rule.
    #[must_use]
    pub fn recognized_lines(&self) -> u64 {
        self.recognized_lines
    }
}
