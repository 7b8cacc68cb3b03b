//! Aggregation of a [`Tally`] into a structured report.
//!
//! A [`Report`] is an ordered list of labeled sections. Building a report is
//! decoupled from emitting it: the same report renders as the plain text
//! layout downstream tooling parses, as JSON, or as structured log events.

use std::{fmt, io, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{classify::Counter, classify::Tally, stats::Summary};

/// Errors produced while emitting a [`Report`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Writing the report failed
    #[error("Failed to write report: {0}")]
    Io(#[from] io::Error),
    /// Serializing the report failed
    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where the "acks received in ack poll response" average draws its samples
/// from.
///
/// Historically this average was computed from the ack ids sent in the poll
/// rather than the ack ids acknowledged, making it identical to the
/// "ackIDs sent" average. Whether that was intended has not been confirmed,
/// so both behaviors are selectable.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum AckReceivedSource {
    /// Average the acknowledged ack id counts
    #[default]
    Received,
    /// Average the requested ack id counts, as historical reports did
    Requested,
}

impl FromStr for AckReceivedSource {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "received" => Ok(Self::Received),
            "requested" => Ok(Self::Requested),
            _ => Err(format!(
                "unknown ack received source {input:?}, expected one of: received, requested"
            )),
        }
    }
}

impl fmt::Display for AckReceivedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => f.write_str("received"),
            Self::Requested => f.write_str("requested"),
        }
    }
}

/// How a [`Report`] is emitted.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// Plain text, the historical layout
    #[default]
    Text,
    /// Pretty printed JSON
    Json,
    /// One `info` tracing event per field
    Log,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "log" => Ok(Self::Log),
            _ => Err(format!(
                "unknown report format {input:?}, expected one of: text, json, log"
            )),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
            Self::Log => f.write_str("log"),
        }
    }
}

/// Knobs that change how a [`Tally`] is reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Assumed size of one acknowledged batch, in megabytes
    pub batch_megabytes: u64,
    /// Samples behind the "acks received" average
    pub acks_received_source: AckReceivedSource,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            batch_megabytes: 5,
            acks_received_source: AckReceivedSource::default(),
        }
    }
}

/// A reported value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// An exact count
    Count(u64),
    /// A mean or deviation, `None` when undefined
    Measure(Option<f64>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Count(c) => write!(f, "{c}"),
            Value::Measure(None) => f.write_str("nan"),
            Value::Measure(Some(m)) => f.write_str(&render_measure(*m)),
        }
    }
}

/// Significant digits of a rendered measure.
const MEASURE_PRECISION: i32 = 12;

/// Renders `m` the way the historical report did, `%.12g` with a `.0`
/// appended to integral values: `100.0`, `1.66666666667`, `1e+20`.
fn render_measure(m: f64) -> String {
    if m.is_nan() {
        return "nan".to_string();
    }
    if m.is_infinite() {
        return if m > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    // Rounding to the precision first settles the decimal exponent, 9.5e11
    // rounded up to 1e12 must switch to exponent form.
    let scientific = format!("{:.*e}", (MEASURE_PRECISION - 1) as usize, m);
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= MEASURE_PRECISION {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (MEASURE_PRECISION - 1 - exponent).max(0) as usize;
        let fixed = format!("{m:.decimals$}");
        let fixed = trim_fraction(&fixed);
        if fixed.contains('.') {
            fixed.to_string()
        } else {
            format!("{fixed}.0")
        }
    }
}

fn trim_fraction(digits: &str) -> &str {
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.')
    } else {
        digits
    }
}

/// A labeled value inside a [`Section`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    /// Stable machine name
    pub key: &'static str,
    /// Human readable label, printed verbatim
    pub label: String,
    /// The value
    pub value: Value,
}

/// An ordered group of fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    /// Stable machine name
    pub key: &'static str,
    /// Human readable title
    pub title: &'static str,
    /// Fields in print order
    pub fields: Vec<Field>,
}

impl Section {
    fn new(key: &'static str, title: &'static str) -> Self {
        Self {
            key,
            title,
            fields: Vec::new(),
        }
    }

    fn count(mut self, key: &'static str, label: impl Into<String>, value: u64) -> Self {
        self.fields.push(Field {
            key,
            label: label.into(),
            value: Value::Count(value),
        });
        self
    }

    fn measure(mut self, key: &'static str, label: impl Into<String>, value: Option<f64>) -> Self {
        self.fields.push(Field {
            key,
            label: label.into(),
            value: Value::Measure(value),
        });
        self
    }

    /// Look up a field by key.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }
}

/// The aggregate statistics of one scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Sections in print order
    pub sections: Vec<Section>,
}

impl Report {
    /// Reduce `tally` into a report.
    #[must_use]
    pub fn build(tally: &Tally, options: Options) -> Self {
        let response_times = Summary::of(tally.response_times());
        let ack_times = Summary::of(tally.ack_times());
        let acks_received = match options.acks_received_source {
            AckReceivedSource::Received => Summary::of(tally.acks_received()),
            AckReceivedSource::Requested => Summary::of(tally.ack_ids_requested()),
        };
        let ack_ids_requested = Summary::of(tally.ack_ids_requested());
        let acks_received_nonzero = Summary::of(tally.acks_received_nonzero());

        let requests = Section::new("requests", "Number of requests")
            .count(
                "event_posts",
                "Total number of event batches posted: ",
                tally.count(Counter::EventPost),
            )
            .count(
                "ack_polls",
                "Total number of ack polls: ",
                tally.count(Counter::AckPoll),
            )
            .count(
                "empty_event_posts",
                "Total number of empty event posts: ",
                tally.count(Counter::EmptyEventCheck),
            )
            .count(
                "health_checks",
                "Total number of requests to /health: ",
                tally.count(Counter::HealthCheck),
            )
            .count(
                "ack_checks",
                "Total number of 'ack checks': ",
                tally.count(Counter::AckCheck),
            )
            .count("total_requests", "Total requests: ", tally.total_requests());

        let responses = Section::new("response_times", "Response times")
            .measure(
                "mean_response_time_ms",
                "Average response time: ",
                response_times.mean,
            )
            .measure(
                "std_dev_response_time_ms",
                "Standard deviation of response times: ",
                response_times.std_dev,
            );

        let back_pressure = Section::new(
            "back_pressure",
            "Back pressure and channel availability",
        )
        .count(
            "lb_spins",
            "Total number of spins in load balancer: ",
            tally.count(Counter::LbSpin),
        )
        .count(
            "event_post_503s",
            "Total number of 503 responses from event posts: ",
            tally.count(Counter::EventPostBusy),
        )
        .count(
            "ack_poll_503s",
            "Total number of 503 responses from ack polls: ",
            tally.count(Counter::AckPollBusy),
        )
        .count(
            "generic_503s",
            "Total number of 503 responses from HttpCallbacksGeneric: ",
            tally.count(Counter::GenericBusy),
        )
        .count(
            "channels_unavailable",
            "Total number of times a channel became unhealthy: ",
            tally.count(Counter::ChannelUnavailable),
        )
        .count(
            "channels_available",
            "Total number of times a channel became healthy: ",
            tally.count(Counter::ChannelAvailable),
        );

        let acks = Section::new("acks", "Ack Metrics")
            .count(
                "acknowledged_batches",
                "Total number of acknowledged batches: ",
                ack_times.count,
            )
            .count(
                "megabytes_acknowledged",
                format!(
                    "Megabytes acknowledged (assuming {}MB batches)",
                    options.batch_megabytes
                ),
                ack_times.count.saturating_mul(options.batch_megabytes),
            )
            .measure(
                "mean_ack_time_ms",
                "Average ack time for an event batch: ",
                ack_times.mean,
            )
            .measure(
                "std_dev_ack_time_ms",
                "Standard deviation of ack times for an event batch: ",
                ack_times.std_dev,
            )
            .measure(
                "mean_acks_received",
                "Average number of acks received in ack poll response: ",
                acks_received.mean,
            )
            .measure(
                "mean_ack_ids_requested",
                "Average number of ackIDs sent in an ack poll request: ",
                ack_ids_requested.mean,
            )
            .measure(
                "mean_acks_received_nonzero",
                "Average number of acks received in ack poll response when we get at least one: ",
                acks_received_nonzero.mean,
            );

        let sticky = Section::new("sticky_sessions", "Sticky sessions violations").count(
            "cookie_violations",
            "Total number of session cookie violations detected: ",
            tally.count(Counter::CookieViolation),
        );

        Self {
            sections: vec![requests, responses, back_pressure, acks, sticky],
        }
    }

    /// Look up a section by key.
    #[must_use]
    pub fn section(&self, key: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.key == key)
    }

    /// Look up a value by section and field key.
    #[must_use]
    pub fn value(&self, section: &str, field: &str) -> Option<Value> {
        self.section(section)
            .and_then(|s| s.field(field))
            .map(|f| f.value)
    }

    /// Emit this report in `format`. [`Format::Log`] ignores `writer`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `writer` or serialization fails.
    pub fn emit<W: io::Write>(&self, format: Format, writer: &mut W) -> Result<(), Error> {
        match format {
            Format::Text => {
                write!(writer, "{self}")?;
            }
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, self)?;
                writeln!(writer)?;
            }
            Format::Log => self.log(),
        }
        writer.flush()?;
        Ok(())
    }

    fn log(&self) {
        for section in &self.sections {
            for field in &section.fields {
                info!(
                    section = section.key,
                    field = field.key,
                    value = %field.value,
                    "{}",
                    field.label.trim_end()
                );
            }
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RESULTS:\n")?;
        for section in &self.sections {
            writeln!(f, "\n********* {} *********\n", section.title)?;
            for field in &section.fields {
                writeln!(f, "{}", field.label)?;
                writeln!(f, "\t{}", field.value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Observation;

    fn tally_of(lines: &[&str]) -> Tally {
        let mut tally = Tally::new();
        for (i, line) in lines.iter().enumerate() {
            tally.observe(line, i as u64 + 1).expect("line must classify");
        }
        tally
    }

    #[test]
    fn response_time_mean_and_deviation() {
        let tally = tally_of(&[
            "Response received. X took 120 ms",
            "Response received. Y took 80 ms",
        ]);
        let report = Report::build(&tally, Options::default());
        assert_eq!(
            report.value("response_times", "mean_response_time_ms"),
            Some(Value::Measure(Some(100.0)))
        );
        assert_eq!(
            report.value("response_times", "std_dev_response_time_ms"),
            Some(Value::Measure(Some(20.0)))
        );
    }

    #[test]
    fn megabytes_follow_ack_time_samples() {
        let mut tally = Tally::new();
        for ms in [10, 20, 30, 40] {
            tally.record(Observation::AckTime(ms));
        }
        let report = Report::build(&tally, Options::default());
        assert_eq!(
            report.value("acks", "acknowledged_batches"),
            Some(Value::Count(4))
        );
        assert_eq!(
            report.value("acks", "megabytes_acknowledged"),
            Some(Value::Count(20))
        );

        let report = Report::build(
            &tally,
            Options {
                batch_megabytes: 8,
                ..Options::default()
            },
        );
        let field = report
            .section("acks")
            .and_then(|s| s.field("megabytes_acknowledged"))
            .expect("field present");
        assert_eq!(field.value, Value::Count(32));
        assert_eq!(field.label, "Megabytes acknowledged (assuming 8MB batches)");
    }

    #[test]
    fn total_requests_is_reported() {
        let tally = tally_of(&[
            "executing event batch post",
            "executing ack poll request",
            "executing ack poll request",
            "executing ack check",
        ]);
        let report = Report::build(&tally, Options::default());
        assert_eq!(
            report.value("requests", "total_requests"),
            Some(Value::Count(4))
        );
    }

    #[test]
    fn acks_received_source_selects_samples() {
        let tally = tally_of(&[
            "received success on 1 ack ids out of 6",
            "received success on 3 ack ids out of 10",
        ]);
        let received = Report::build(&tally, Options::default());
        assert_eq!(
            received.value("acks", "mean_acks_received"),
            Some(Value::Measure(Some(2.0)))
        );
        let requested = Report::build(
            &tally,
            Options {
                acks_received_source: AckReceivedSource::Requested,
                ..Options::default()
            },
        );
        assert_eq!(
            requested.value("acks", "mean_acks_received"),
            Some(Value::Measure(Some(8.0)))
        );
        assert_eq!(
            requested.value("acks", "mean_ack_ids_requested"),
            Some(Value::Measure(Some(8.0)))
        );
    }

    #[test]
    fn measure_rendering() {
        assert_eq!(Value::Measure(Some(100.0)).to_string(), "100.0");
        assert_eq!(Value::Measure(Some(12.5)).to_string(), "12.5");
        assert_eq!(Value::Measure(Some(f64::NAN)).to_string(), "nan");
        assert_eq!(Value::Measure(None).to_string(), "nan");
        assert_eq!(Value::Count(7).to_string(), "7");
    }

    #[test]
    fn measures_render_with_twelve_significant_digits() {
        let cases = [
            (5.0 / 3.0, "1.66666666667"),
            (2.0 / 3.0, "0.666666666667"),
            (1e20, "1e+20"),
            (123_456_789_012.0, "123456789012.0"),
            (1_234_567_890_123.0, "1.23456789012e+12"),
            (999_999_999_999.6, "1e+12"),
            (0.0001, "0.0001"),
            (0.00001, "1e-05"),
            (-2.5, "-2.5"),
            (0.0, "0.0"),
            (f64::INFINITY, "inf"),
        ];
        for (measure, expected) in cases {
            assert_eq!(
                Value::Measure(Some(measure)).to_string(),
                expected,
                "rendering {measure:?}"
            );
        }
    }

    #[test]
    fn non_terminating_mean_renders_truncated() {
        let mut tally = Tally::new();
        for ms in [1, 2, 2] {
            tally.record(Observation::ResponseTime(ms));
        }
        let text = Report::build(&tally, Options::default()).to_string();
        assert!(
            text.contains("Average response time: \n\t1.66666666667\n"),
            "unexpected report: {text}"
        );
    }

    #[test]
    fn text_layout() {
        let tally = tally_of(&[
            "executing event batch post",
            "Response received. X took 120 ms",
            "Response received. Y took 80 ms",
            "to change the Session-Cookie",
        ]);
        let text = Report::build(&tally, Options::default()).to_string();
        let expected = "RESULTS:\n\
\n\
\n\
********* Number of requests *********\n\
\n\
Total number of event batches posted: \n\
\t1\n\
Total number of ack polls: \n\
\t0\n\
Total number of empty event posts: \n\
\t0\n\
Total number of requests to /health: \n\
\t0\n\
Total number of 'ack checks': \n\
\t0\n\
Total requests: \n\
\t1\n\
\n\
********* Response times *********\n\
\n\
Average response time: \n\
\t100.0\n\
Standard deviation of response times: \n\
\t20.0\n\
\n\
********* Back pressure and channel availability *********\n\
\n\
Total number of spins in load balancer: \n\
\t0\n\
Total number of 503 responses from event posts: \n\
\t0\n\
Total number of 503 responses from ack polls: \n\
\t0\n\
Total number of 503 responses from HttpCallbacksGeneric: \n\
\t0\n\
Total number of times a channel became unhealthy: \n\
\t0\n\
Total number of times a channel became healthy: \n\
\t0\n\
\n\
********* Ack Metrics *********\n\
\n\
Total number of acknowledged batches: \n\
\t0\n\
Megabytes acknowledged (assuming 5MB batches)\n\
\t0\n\
Average ack time for an event batch: \n\
\tnan\n\
Standard deviation of ack times for an event batch: \n\
\tnan\n\
Average number of acks received in ack poll response: \n\
\tnan\n\
Average number of ackIDs sent in an ack poll request: \n\
\tnan\n\
Average number of acks received in ack poll response when we get at least one: \n\
\tnan\n\
\n\
********* Sticky sessions violations *********\n\
\n\
Total number of session cookie violations detected: \n\
\t1\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn json_uses_null_for_undefined_measures() {
        let report = Report::build(&Tally::new(), Options::default());
        let mut out = Vec::new();
        report
            .emit(Format::Json, &mut out)
            .expect("json must serialize");
        let json: serde_json::Value = serde_json::from_slice(&out).expect("valid json");
        let acks = &json["sections"][3];
        assert_eq!(acks["key"], "acks");
        assert_eq!(acks["fields"][2]["key"], "mean_ack_time_ms");
        assert!(acks["fields"][2]["value"].is_null());
        assert_eq!(acks["fields"][0]["value"], 0);
    }

    #[test]
    fn formats_parse() {
        assert_eq!("json".parse::<Format>(), Ok(Format::Json));
        assert!("xml".parse::<Format>().is_err());
        assert_eq!(
            "requested".parse::<AckReceivedSource>(),
            Ok(AckReceivedSource::Requested)
        );
    }
}
