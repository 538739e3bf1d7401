// FQLab: Network-Emulation Experiments for Fair-Queuing Detection in Congestion Control
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Classification of the transport's detection events against the ground truth of the
//! configured queue discipline.
//!
//! The server log is scanned for lines of the form
//! `<label>: (Ending|Recovery|FQ detected) at <microseconds>`, where `<label>` is the
//! transport's own log tag. The resulting event sequence is scored by the fraction of
//! elapsed time during which the reported state matched the ground truth.

use lazy_static::lazy_static;
use regex::Regex;

use crate::shaping::QueueDiscipline;

lazy_static! {
    static ref EVENT_RE: Regex =
        Regex::new(r"(\w+): (Ending|Recovery|FQ detected) at ([0-9]+)").unwrap();
    /// Out-of-band failure marker: the server handled a connection it cannot attribute to
    /// this run. Such a log must never be scored.
    static ref BAD_CNX_RE: Regex = Regex::new(r"[Uu]nexpected cnx_id").unwrap();
}

/// The transport's reported state at one point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// The transport believes it shares the bottleneck with a fair-queuing discipline.
    FqDetected,
    /// The transport is in loss/congestion recovery.
    Recovery,
    /// The session is ending; terminates accumulation.
    Terminal,
}

impl Classification {
    /// The fair-queuing claim this state makes, if any.
    fn indicates_fair_queue(&self) -> Option<bool> {
        match self {
            Self::FqDetected => Some(true),
            Self::Recovery => Some(false),
            Self::Terminal => None,
        }
    }
}

/// One timestamped detection marker from the server log. Events keep log order; the log is
/// append-only and time-ordered, so they are never re-sorted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionEvent {
    /// Seconds, derived from the microsecond log field.
    pub timestamp: f64,
    pub classification: Classification,
}

/// Why a run cannot be scored. Invalid samples are discarded and the configuration is
/// retried; they never count towards the repetition target.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSample {
    #[error("log carries an unexpected connection identifier (misattributed session)")]
    UnexpectedConnection,
    #[error("too few detection events to score ({0} < 3)")]
    TooFewEvents(usize),
    #[error("detection events span no elapsed time")]
    NoElapsedTime,
    #[error("unrepresentable event timestamp `{0}`")]
    BadTimestamp(String),
}

/// Extract the chronological event sequence from the server log.
///
/// Accumulation stops at the first terminal marker; its timestamp is retained. A log
/// containing the unexpected-connection marker is rejected as a whole, regardless of how
/// many events it carries.
pub fn parse_events(server_log: &str) -> Result<Vec<DetectionEvent>, InvalidSample> {
    if BAD_CNX_RE.is_match(server_log) {
        return Err(InvalidSample::UnexpectedConnection);
    }

    let mut events = Vec::new();
    for line in server_log.lines() {
        let Some(m) = EVENT_RE.captures(line) else {
            continue;
        };
        // once a terminal marker is pending, stop before inconsistency compounds
        if events
            .last()
            .is_some_and(|e: &DetectionEvent| e.classification == Classification::Terminal)
        {
            break;
        }
        let classification = match m.get(2).map(|k| k.as_str()) {
            Some("FQ detected") => Classification::FqDetected,
            Some("Recovery") => Classification::Recovery,
            _ => Classification::Terminal,
        };
        // the grammar admits more digits than u64 holds
        let micros: u64 = m[3]
            .parse()
            .map_err(|_| InvalidSample::BadTimestamp(m[3].to_string()))?;
        events.push(DetectionEvent {
            timestamp: micros as f64 / 1e6,
            classification,
        });
    }

    Ok(events)
}

/// Score the server log against the configured queue discipline.
///
/// Deterministic: the result is a pure function of the log text and the discipline. For
/// `n` events, interval `i -> i+1` counts as correct when `events[i+1]` matches the ground
/// truth; the total duration runs up to `events[n-2]`, excluding the terminal marker's
/// trailing interval. Fewer than 3 events, or scored events that all share one timestamp,
/// cannot form a scoreable interval.
pub fn classify(server_log: &str, qdisc: &QueueDiscipline) -> Result<f64, InvalidSample> {
    let events = parse_events(server_log)?;
    let n = events.len();
    if n < 3 {
        return Err(InvalidSample::TooFewEvents(n));
    }

    let expected = qdisc.is_fair_queuing();
    let mut correct_duration = 0.0;
    for i in 0..n - 2 {
        if events[i + 1].classification.indicates_fair_queue() == Some(expected) {
            correct_duration += events[i + 1].timestamp - events[i].timestamp;
        }
    }
    let total_duration = events[n - 2].timestamp - events[0].timestamp;
    if total_duration <= 0.0 {
        return Err(InvalidSample::NoElapsedTime);
    }

    Ok(correct_duration / total_duration)
}

#[cfg(test)]
mod test {
    use super::*;

    fn log(lines: &[&str]) -> String {
        lines.join("\n")
    }

    #[test]
    fn parses_event_grammar() {
        let events = parse_events(&log(&[
            "noise that should be ignored",
            "Tonopah: FQ detected at 1000000: cwin 42",
            "Tonopah: Recovery at 2500000: cwin 21",
            "Tonopah: Ending at 4000000",
        ]))
        .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp, 1.0);
        assert_eq!(events[0].classification, Classification::FqDetected);
        assert_eq!(events[1].timestamp, 2.5);
        assert_eq!(events[1].classification, Classification::Recovery);
        assert_eq!(events[2].classification, Classification::Terminal);
    }

    #[test]
    fn stops_after_terminal_marker() {
        let events = parse_events(&log(&[
            "Tonopah: FQ detected at 1000000",
            "Tonopah: Ending at 2000000",
            "Tonopah: FQ detected at 3000000",
            "Tonopah: Recovery at 4000000",
        ]))
        .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].classification, Classification::Terminal);
        assert_eq!(events[1].timestamp, 2.0);
    }

    #[test]
    fn worked_example_scores_half() {
        // intervals: 0->10 scored against Recovery (wrong), 10->20 against FQ (right);
        // total = 20 - 0
        let text = log(&[
            "Tonopah: FQ detected at 0",
            "Tonopah: Recovery at 10000000",
            "Tonopah: FQ detected at 20000000",
            "Tonopah: Ending at 30000000",
        ]);
        let accuracy = classify(&text, &QueueDiscipline::FairQueue).unwrap();
        assert_eq!(accuracy, 0.5);
    }

    #[test]
    fn classifier_is_deterministic() {
        let text = log(&[
            "Tonopah: Recovery at 1000000",
            "Tonopah: FQ detected at 3000000",
            "Tonopah: Recovery at 6000000",
            "Tonopah: Ending at 9000000",
        ]);
        let first = classify(&text, &QueueDiscipline::PlainFifo).unwrap();
        let second = classify(&text, &QueueDiscipline::PlainFifo).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fifo_ground_truth_inverts_score() {
        let text = log(&[
            "Tonopah: FQ detected at 0",
            "Tonopah: Recovery at 10000000",
            "Tonopah: FQ detected at 20000000",
            "Tonopah: Ending at 30000000",
        ]);
        // under a FIFO, the Recovery segment is the correct one
        let accuracy = classify(&text, &QueueDiscipline::PlainFifo).unwrap();
        assert_eq!(accuracy, 0.5);

        let all_fq = log(&[
            "Tonopah: FQ detected at 0",
            "Tonopah: FQ detected at 10000000",
            "Tonopah: FQ detected at 20000000",
            "Tonopah: Ending at 30000000",
        ]);
        assert_eq!(classify(&all_fq, &QueueDiscipline::PlainFifo).unwrap(), 0.0);
        assert_eq!(classify(&all_fq, &QueueDiscipline::FairQueue).unwrap(), 1.0);
    }

    #[test]
    fn unexpected_connection_always_invalidates() {
        let text = log(&[
            "Tonopah: FQ detected at 0",
            "Tonopah: Recovery at 10000000",
            "Tonopah: FQ detected at 20000000",
            "Tonopah: unexpected cnx_id, dropping packet",
            "Tonopah: Ending at 30000000",
        ]);
        assert_eq!(
            classify(&text, &QueueDiscipline::FairQueue),
            Err(InvalidSample::UnexpectedConnection)
        );
        // also with too few events for scoring
        assert_eq!(
            parse_events("server: Unexpected cnx_id"),
            Err(InvalidSample::UnexpectedConnection)
        );
    }

    #[test]
    fn coincident_events_are_invalid() {
        // two markers in the same microsecond collapse the scoreable span to zero; the
        // sample must be discarded rather than scored as NaN
        let text = log(&[
            "Tonopah: FQ detected at 5000000",
            "Tonopah: Recovery at 5000000",
            "Tonopah: Ending at 9000000",
        ]);
        assert_eq!(
            classify(&text, &QueueDiscipline::FairQueue),
            Err(InvalidSample::NoElapsedTime)
        );
    }

    #[test]
    fn overflowing_timestamp_is_invalid() {
        let text = log(&[
            "Tonopah: FQ detected at 99999999999999999999999999",
            "Tonopah: Recovery at 10000000",
            "Tonopah: Ending at 20000000",
        ]);
        assert!(matches!(
            parse_events(&text),
            Err(InvalidSample::BadTimestamp(_))
        ));
    }

    #[test]
    fn two_events_are_invalid() {
        let text = log(&["Tonopah: FQ detected at 0", "Tonopah: Ending at 10000000"]);
        assert_eq!(
            classify(&text, &QueueDiscipline::FairQueue),
            Err(InvalidSample::TooFewEvents(2))
        );
        assert_eq!(
            classify("", &QueueDiscipline::FairQueue),
            Err(InvalidSample::TooFewEvents(0))
        );
    }
}
