//! Pre-transmission filtering of a batch of publications.
//!
//! `on_change` drops a candidate whose normalized `(name, value, msg)` matches
//! the latest record of the same command in the previous batch and deletes it
//! from the store. `time_window` holds back every candidate while the local
//! time of day is outside `(time_start, time_end)`; those stay unsent.

use chrono::{Local, NaiveTime};
use tracing::{debug, warn};

use crate::config::{ForwardMethod, ForwardingSettings};
use crate::db::RecordStore;
use crate::error::StoreError;
use crate::models::{Command, LocationFix, Publication, Record, Status};

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    /// Candidates that must not be transmitted now.
    pub held_back: Vec<Publication>,
    pub status: Status,
    /// True when candidates were deferred to a later window rather than dropped.
    pub deferred: bool,
}

impl GateDecision {
    fn accept_all() -> Self {
        Self {
            held_back: Vec::new(),
            status: Status::Success,
            deferred: false,
        }
    }

    /// Candidates that may be transmitted.
    pub fn forwardable<'a>(&self, candidates: &'a [Publication]) -> Vec<&'a Publication> {
        candidates
            .iter()
            .filter(|c| !self.held_back.contains(*c))
            .collect()
    }
}

/// Fields compared to decide whether a publication repeats the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Projection {
    name: Option<String>,
    value: Option<String>,
    msg: Option<String>,
}

impl Projection {
    fn new(
        command: Command,
        name: Option<String>,
        value: Option<String>,
        msg: Option<String>,
    ) -> Self {
        match command {
            Command::PublishLocation => Projection {
                name: None,
                value: value.map(|v| normalize_location(&v)),
                msg: None,
            },
            Command::PublishAlarm => Projection {
                name,
                value,
                msg: None,
            },
            Command::PublishLog => Projection {
                name: None,
                value: None,
                msg,
            },
            // Integer part only: 21.4 and 21.9 count as the same reading.
            Command::PublishTelemetry => Projection {
                name,
                value: value.map(|v| v.split('.').next().unwrap_or_default().to_string()),
                msg: None,
            },
            Command::PublishAttribute => Projection {
                name,
                value,
                msg: None,
            },
        }
    }

    fn of_publication(publication: &Publication) -> Self {
        let (name, value, msg) = publication.payload.columns();
        Self::new(publication.command(), name, value, msg)
    }

    fn of_record(record: &Record) -> Self {
        Self::new(
            record.command,
            record.name.clone(),
            record.value.clone(),
            record.msg.clone(),
        )
    }
}

/// Strip trailing zeros, then a trailing decimal point: `1.50` -> `1.5`, `2.0` -> `2`.
pub fn trim_decimal(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn normalize_number(n: Option<f64>) -> String {
    match n {
        Some(n) => trim_decimal(&n.to_string()).to_string(),
        None => "None".to_string(),
    }
}

fn normalize_location(raw: &str) -> String {
    match LocationFix::decode(raw) {
        Ok(fix) => format!(
            "({}, {}, {}, {}, {}, {}, {})",
            normalize_number(Some(fix.lat)),
            normalize_number(Some(fix.lng)),
            normalize_number(fix.heading),
            normalize_number(fix.altitude),
            normalize_number(fix.speed),
            normalize_number(fix.accuracy),
            fix.fix_type.as_deref().unwrap_or("None"),
        ),
        Err(_) => raw.to_string(),
    }
}

/// Decides which candidates of an outgoing batch are forwarded.
#[derive(Clone)]
pub struct ForwardingGate {
    store: RecordStore,
    settings: ForwardingSettings,
}

impl ForwardingGate {
    pub fn new(store: RecordStore, settings: ForwardingSettings) -> Self {
        Self { store, settings }
    }

    /// Check a batch stamped with `topic_num` against the configured policy.
    pub async fn check(&self, topic_num: &str, candidates: &[Publication]) -> GateDecision {
        match self.settings.method {
            ForwardMethod::OnChange => self.check_on_change(topic_num, candidates).await,
            ForwardMethod::TimeWindow => self.check_window(candidates, Local::now().time()),
            ForwardMethod::None => GateDecision::accept_all(),
        }
    }

    /// Time-window check against an explicit time of day.
    pub fn check_window(&self, candidates: &[Publication], now: NaiveTime) -> GateDecision {
        let open = self.settings.time_start < now && now < self.settings.time_end;
        if open || candidates.is_empty() {
            return GateDecision::accept_all();
        }

        debug!(
            "Deferring {} publication(s) outside {}-{}",
            candidates.len(),
            self.settings.time_start,
            self.settings.time_end
        );
        GateDecision {
            held_back: candidates.to_vec(),
            status: Status::Success,
            deferred: true,
        }
    }

    async fn check_on_change(&self, topic_num: &str, candidates: &[Publication]) -> GateDecision {
        let mut decision = GateDecision::accept_all();

        for candidate in candidates {
            match self.suppress_if_unchanged(topic_num, candidate).await {
                Ok(true) => {
                    decision.held_back.push(candidate.clone());
                    decision.status = Status::Exists;
                }
                Ok(false) => {}
                // Left in the batch when the check cannot complete.
                Err(e) => warn!(
                    "Change check failed for {} in topic {}: {}",
                    candidate.command(),
                    topic_num,
                    e
                ),
            }
        }

        decision
    }

    /// Delete `candidate` from `topic_num` if it repeats the latest record of
    /// the previous batch. Returns whether it was suppressed.
    async fn suppress_if_unchanged(
        &self,
        topic_num: &str,
        candidate: &Publication,
    ) -> Result<bool, StoreError> {
        let command = candidate.command();
        let recent = match self.store.latest_in_other_topic(topic_num, command).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        let wanted = Projection::of_publication(candidate);
        if Projection::of_record(&recent) != wanted {
            return Ok(false);
        }

        let ids: Vec<i64> = self
            .store
            .list_in_topic(topic_num, command)
            .await?
            .iter()
            .filter(|record| Projection::of_record(record) == wanted)
            .map(|record| record.id)
            .collect();
        let removed = self.store.remove_ids(&ids).await?;
        debug!(
            "Suppressed unchanged {} in topic {} ({} record(s) removed)",
            command,
            topic_num,
            removed.len()
        );
        Ok(true)
    }
}
