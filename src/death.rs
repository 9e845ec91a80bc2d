//! Reading the broker's `x-death` history and deciding whether a message may be retried.

use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable};
use std::fmt;
use thiserror::Error;

/// Header the broker fills with one table per dead-lettering event, newest first.
pub const X_DEATH: &str = "x-death";
/// Optional explicit retry counter. Takes precedence over the death records when set.
pub const X_RETRY_COUNT: &str = "x-retry-count";

/// Why the broker dead-lettered a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    Rejected,
    Expired,
    MaxLen,
    DeliveryLimit,
    Other(String),
}

impl DeathReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "rejected" => DeathReason::Rejected,
            "expired" => DeathReason::Expired,
            "maxlen" => DeathReason::MaxLen,
            "delivery_limit" => DeathReason::DeliveryLimit,
            other => DeathReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeathReason::Rejected => "rejected",
            DeathReason::Expired => "expired",
            DeathReason::MaxLen => "maxlen",
            DeathReason::DeliveryLimit => "delivery_limit",
            DeathReason::Other(other) => other,
        }
    }
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the `x-death` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub reason: DeathReason,
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    /// How many times the broker dead-lettered the message for this queue and reason.
    pub count: u64,
    pub time: Option<DateTime<Utc>>,
}

/// The headers carried a death history (or retry counter) that could not be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedDeathHistory {
    #[error("`x-death` is not an array")]
    NotAnArray,

    #[error("`x-death` entry {index} is not a table")]
    RecordNotATable { index: usize },

    #[error("`x-death` entry {index} is missing `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("`x-death` entry {index} has an invalid `{field}`")]
    InvalidField { index: usize, field: &'static str },

    #[error("`x-retry-count` is not a non-negative integer")]
    InvalidRetryCounter,

    #[error("`x-retry-count` is {count} but the message has no death history")]
    CounterWithoutHistory { count: u64 },

    #[error("`x-retry-count` is {counter} but the message was dead-lettered {deaths} times")]
    CounterBehindHistory { counter: u64, deaths: u64 },
}

/// Death records in chronological order: the oldest first, the latest last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeathHistory {
    records: Vec<DeathRecord>,
}

impl DeathHistory {
    /// Parses the `x-death` header. Returns `Ok(None)` when the header is absent.
    pub fn from_headers(headers: &FieldTable) -> Result<Option<Self>, MalformedDeathHistory> {
        let Some(value) = headers.inner().get(X_DEATH) else {
            return Ok(None);
        };

        let AMQPValue::FieldArray(entries) = value else {
            return Err(MalformedDeathHistory::NotAnArray);
        };

        let mut records = entries
            .as_slice()
            .iter()
            .enumerate()
            .map(|(index, entry)| match entry {
                AMQPValue::FieldTable(table) => parse_record(index, table),
                _ => Err(MalformedDeathHistory::RecordNotATable { index }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        // The broker prepends, so the wire order is newest first.
        records.reverse();
        Ok(Some(Self { records }))
    }

    pub fn records(&self) -> &[DeathRecord] {
        &self.records
    }

    pub fn latest(&self) -> Option<&DeathRecord> {
        self.records.last()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total dead-letterings recorded, optionally only those out of `queue`.
    pub fn death_count(&self, queue: Option<&str>) -> u64 {
        self.records
            .iter()
            .filter(|record| queue.map_or(true, |q| record.queue == q))
            .fold(0u64, |total, record| total.saturating_add(record.count))
    }
}

impl fmt::Display for DeathHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}@{}({})", record.reason, record.queue, record.count)?;
        }
        f.write_str("]")
    }
}

fn parse_record(index: usize, table: &FieldTable) -> Result<DeathRecord, MalformedDeathHistory> {
    let fields = table.inner();

    let count = match fields.get("count") {
        None => return Err(MalformedDeathHistory::MissingField { index, field: "count" }),
        Some(value) => as_u64(value).ok_or(MalformedDeathHistory::InvalidField { index, field: "count" })?,
    };

    let reason = match fields.get("reason") {
        None => return Err(MalformedDeathHistory::MissingField { index, field: "reason" }),
        Some(value) => as_string(value).ok_or(MalformedDeathHistory::InvalidField { index, field: "reason" })?,
    };

    let queue = match fields.get("queue") {
        None => return Err(MalformedDeathHistory::MissingField { index, field: "queue" }),
        Some(value) => as_string(value).ok_or(MalformedDeathHistory::InvalidField { index, field: "queue" })?,
    };

    // The default exchange is reported as an empty string.
    let exchange = fields.get("exchange").and_then(as_string).unwrap_or_default();

    let routing_keys = match fields.get("routing-keys") {
        Some(AMQPValue::FieldArray(keys)) => keys.as_slice().iter().filter_map(as_string).collect(),
        _ => Vec::new(),
    };

    let time = match fields.get("time") {
        Some(AMQPValue::Timestamp(secs)) => i64::try_from(*secs)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    };

    Ok(DeathRecord {
        reason: DeathReason::parse(&reason),
        queue,
        exchange,
        routing_keys,
        count,
        time,
    })
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn as_u64(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::LongUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        _ => None,
    }
}

/// Reads `x-retry-count`. `Ok(None)` when the header is absent.
pub fn explicit_retry_count(headers: &FieldTable) -> Result<Option<u64>, MalformedDeathHistory> {
    match headers.inner().get(X_RETRY_COUNT) {
        None => Ok(None),
        Some(value) => as_u64(value)
            .map(Some)
            .ok_or(MalformedDeathHistory::InvalidRetryCounter),
    }
}

/// Why a message will not be retried again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exhaustion {
    ThresholdReached { retry_count: u32 },
    Malformed(MalformedDeathHistory),
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhaustion::ThresholdReached { retry_count } => {
                write!(f, "retry threshold reached after {} retries", retry_count)
            }
            Exhaustion::Malformed(e) => write!(f, "malformed death history: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    RetryEligible { retry_count: u32 },
    RetriesExhausted(Exhaustion),
}

impl Verdict {
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, Verdict::RetryEligible { .. })
    }
}

/// Decides retry eligibility from a message's headers.
///
/// Any header the inspector cannot make sense of ends the retry loop rather
/// than feeding it: a malformed `x-death`, a non-integer `x-retry-count`, or an
/// `x-retry-count` that disagrees with the death records (positive without any
/// history, or lower than the recorded deaths) all yield
/// [`Verdict::RetriesExhausted`] with [`Exhaustion::Malformed`].
#[derive(Debug, Clone)]
pub struct DeathHistoryInspector {
    policy: RetryPolicy,
    queue: Option<String>,
}

impl DeathHistoryInspector {
    /// Counts every death record regardless of the queue it came from.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, queue: None }
    }

    /// Only counts records produced by dead-lettering out of `queue`.
    ///
    /// In a two-queue loop (primary, then a TTL parking queue) every round-trip
    /// leaves a `rejected` record for the primary queue and an `expired` one for
    /// the parking queue. Binding the inspector to the primary queue makes one
    /// round-trip count once.
    pub fn for_queue(policy: RetryPolicy, queue: impl Into<String>) -> Self {
        Self {
            policy,
            queue: Some(queue.into()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn retry_count(&self, headers: Option<&FieldTable>) -> Result<u32, MalformedDeathHistory> {
        let Some(headers) = headers else {
            return Ok(0);
        };

        let counter = explicit_retry_count(headers)?;
        let history = DeathHistory::from_headers(headers)?.filter(|h| !h.is_empty());

        let count = match (history, counter) {
            (None, None) | (None, Some(0)) => 0,
            (None, Some(count)) => return Err(MalformedDeathHistory::CounterWithoutHistory { count }),
            (Some(history), Some(count)) => {
                // The broker never advances this header; a counter below the recorded deaths is stale.
                let deaths = history.death_count(self.queue.as_deref());
                if count < deaths {
                    return Err(MalformedDeathHistory::CounterBehindHistory { counter: count, deaths });
                }
                count
            }
            (Some(history), None) => history.death_count(self.queue.as_deref()),
        };

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub fn inspect(&self, headers: Option<&FieldTable>) -> Verdict {
        match self.retry_count(headers) {
            Ok(retry_count) if self.policy.allows_retry(retry_count) => Verdict::RetryEligible { retry_count },
            Ok(retry_count) => Verdict::RetriesExhausted(Exhaustion::ThresholdReached { retry_count }),
            Err(e) => Verdict::RetriesExhausted(Exhaustion::Malformed(e)),
        }
    }
}
