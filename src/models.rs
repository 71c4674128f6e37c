use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Canonical on-disk timestamp layout. Fixed width, so text order is time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Topic number carried by records that have not been stamped into a batch yet.
pub const DEFAULT_TOPIC_NUM: &str = "0000";

/// Current UTC time at microsecond precision.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| StoreError::InvalidTimestamp(s.to_string()))
}

/// Outcome reported to callers of mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    /// Capacity reached, insert rejected.
    Full,
    /// On-change suppression triggered.
    Exists,
    /// Storage operation failed after one retry.
    Failure,
}

/// Kind of publication held in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    PublishAlarm,
    PublishAttribute,
    PublishTelemetry,
    PublishLocation,
    PublishLog,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::PublishAlarm => "PublishAlarm",
            Command::PublishAttribute => "PublishAttribute",
            Command::PublishTelemetry => "PublishTelemetry",
            Command::PublishLocation => "PublishLocation",
            Command::PublishLog => "PublishLog",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the internal names as well as the wire-protocol command names.
impl FromStr for Command {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PublishAlarm" | "alarm.publish" => Ok(Command::PublishAlarm),
            "PublishAttribute" | "attribute.publish" => Ok(Command::PublishAttribute),
            "PublishTelemetry" | "property.publish" => Ok(Command::PublishTelemetry),
            "PublishLocation" | "location.publish" => Ok(Command::PublishLocation),
            "PublishLog" | "log.publish" => Ok(Command::PublishLog),
            other => Err(StoreError::InvalidValue {
                field: "command",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery state of a record. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Unsent,
    Pending,
    Sent,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Unsent => "unsent",
            RecordStatus::Pending => "pending",
            RecordStatus::Sent => "sent",
        }
    }

    /// Statuses a record may hold right before moving to `self`.
    pub fn predecessors(&self) -> &'static [RecordStatus] {
        match self {
            RecordStatus::Unsent => &[],
            RecordStatus::Pending => &[RecordStatus::Unsent],
            RecordStatus::Sent => &[RecordStatus::Pending],
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsent" => Ok(RecordStatus::Unsent),
            "pending" => Ok(RecordStatus::Pending),
            "sent" => Ok(RecordStatus::Sent),
            other => Err(StoreError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Columns of the publish table that may be matched on or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    TopicNum,
    Command,
    Name,
    Value,
    Msg,
    Timestamp,
    Status,
}

impl Field {
    pub fn column(&self) -> &'static str {
        match self {
            Field::TopicNum => "topic_num",
            Field::Command => "command",
            Field::Name => "name",
            Field::Value => "value",
            Field::Msg => "msg",
            Field::Timestamp => "ts",
            Field::Status => "status",
        }
    }

    /// Check a value against the column's domain and return its stored form.
    pub fn canonicalize(&self, value: &str) -> Result<String, StoreError> {
        match self {
            Field::Command => value.parse::<Command>().map(|c| c.as_str().to_string()),
            Field::Status => value.parse::<RecordStatus>().map(|s| s.as_str().to_string()),
            Field::Timestamp => parse_timestamp(value).map(|ts| format_timestamp(&ts)),
            Field::TopicNum | Field::Name | Field::Value | Field::Msg => Ok(value.to_string()),
        }
    }
}

/// Position report. Stored as versioned JSON in the `value` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lng: f64,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub fix_type: Option<String>,
}

const LOCATION_FORMAT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct VersionedLocation {
    v: u8,
    #[serde(flatten)]
    fix: LocationFix,
}

impl LocationFix {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            heading: None,
            altitude: None,
            speed: None,
            accuracy: None,
            fix_type: None,
        }
    }

    /// Numeric fields all hold finite values.
    pub fn is_finite(&self) -> bool {
        [self.heading, self.altitude, self.speed, self.accuracy]
            .iter()
            .flatten()
            .chain([&self.lat, &self.lng])
            .all(|n| n.is_finite())
    }

    pub fn encode(&self) -> String {
        let versioned = VersionedLocation {
            v: LOCATION_FORMAT_VERSION,
            fix: self.clone(),
        };
        // Plain struct of floats and strings; serialization cannot fail.
        serde_json::to_string(&versioned).unwrap_or_default()
    }

    pub fn decode(s: &str) -> Result<Self, String> {
        let versioned: VersionedLocation = serde_json::from_str(s).map_err(|e| e.to_string())?;
        if versioned.v != LOCATION_FORMAT_VERSION {
            return Err(format!("unsupported location format version {}", versioned.v));
        }
        Ok(versioned.fix)
    }
}

/// Command-shaped body of a publication.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Alarm {
        name: String,
        state: i64,
        message: Option<String>,
    },
    Attribute {
        name: String,
        value: String,
    },
    Telemetry {
        name: String,
        value: f64,
    },
    Location(LocationFix),
    Log {
        message: String,
    },
}

impl Payload {
    pub fn command(&self) -> Command {
        match self {
            Payload::Alarm { .. } => Command::PublishAlarm,
            Payload::Attribute { .. } => Command::PublishAttribute,
            Payload::Telemetry { .. } => Command::PublishTelemetry,
            Payload::Location(_) => Command::PublishLocation,
            Payload::Log { .. } => Command::PublishLog,
        }
    }

    /// Reject values that cannot be stored and read back unchanged.
    pub fn validate(&self) -> Result<(), StoreError> {
        let finite = match self {
            Payload::Telemetry { value, .. } => value.is_finite(),
            Payload::Location(fix) => fix.is_finite(),
            _ => true,
        };
        if finite {
            Ok(())
        } else {
            Err(StoreError::InvalidValue {
                field: "value",
                value: self.columns().1.unwrap_or_default(),
            })
        }
    }

    /// The `(name, value, msg)` columns this payload is stored under.
    pub fn columns(&self) -> (Option<String>, Option<String>, Option<String>) {
        match self {
            Payload::Alarm {
                name,
                state,
                message,
            } => (Some(name.clone()), Some(state.to_string()), message.clone()),
            Payload::Attribute { name, value } => (Some(name.clone()), Some(value.clone()), None),
            Payload::Telemetry { name, value } => (Some(name.clone()), Some(value.to_string()), None),
            Payload::Location(fix) => (None, Some(fix.encode()), None),
            Payload::Log { message } => (None, None, Some(message.clone())),
        }
    }
}

/// A publication handed to the buffer by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Publication {
    /// Create a publication stamped with the current time.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            timestamp: now_utc(),
        }
    }

    pub fn at(payload: Payload, timestamp: DateTime<Utc>) -> Self {
        Self {
            payload,
            timestamp: timestamp.trunc_subsecs(6),
        }
    }

    pub fn command(&self) -> Command {
        self.payload.command()
    }
}

/// Raw row of the publish table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecordRow {
    pub id: i64,
    pub topic_num: String,
    pub command: String,
    pub name: Option<String>,
    pub value: Option<String>,
    pub msg: Option<String>,
    pub ts: String,
    pub status: String,
}

/// One buffered publication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: i64,
    pub topic_num: String,
    pub command: Command,
    pub name: Option<String>,
    pub value: Option<String>,
    pub msg: Option<String>,
    pub timestamp: String,
    pub status: RecordStatus,
}

impl TryFrom<RecordRow> for Record {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let decode_err = |reason: String| StoreError::Decode { id: row.id, reason };
        let command = row
            .command
            .parse::<Command>()
            .map_err(|e| decode_err(e.to_string()))?;
        let status = row
            .status
            .parse::<RecordStatus>()
            .map_err(|e| decode_err(e.to_string()))?;

        Ok(Record {
            id: row.id,
            topic_num: row.topic_num,
            command,
            name: row.name,
            value: row.value,
            msg: row.msg,
            timestamp: row.ts,
            status,
        })
    }
}

impl Record {
    /// Rebuild the producer-facing publication this record was created from.
    pub fn to_publication(&self) -> Result<Publication, StoreError> {
        let decode_err = |reason: &str| StoreError::Decode {
            id: self.id,
            reason: reason.to_string(),
        };
        let require = |field: &Option<String>, what: &str| {
            field
                .clone()
                .ok_or_else(|| decode_err(&format!("missing {}", what)))
        };

        let payload = match self.command {
            Command::PublishAlarm => Payload::Alarm {
                name: require(&self.name, "alarm name")?,
                state: require(&self.value, "alarm state")?
                    .parse()
                    .map_err(|_| decode_err("alarm state is not an integer"))?,
                message: self.msg.clone(),
            },
            Command::PublishAttribute => Payload::Attribute {
                name: require(&self.name, "attribute name")?,
                value: require(&self.value, "attribute value")?,
            },
            Command::PublishTelemetry => Payload::Telemetry {
                name: require(&self.name, "telemetry name")?,
                value: require(&self.value, "telemetry value")?
                    .parse()
                    .map_err(|_| decode_err("telemetry value is not a number"))?,
            },
            Command::PublishLocation => Payload::Location(
                LocationFix::decode(&require(&self.value, "location")?)
                    .map_err(|e| decode_err(&e))?,
            ),
            Command::PublishLog => Payload::Log {
                message: require(&self.msg, "log message")?,
            },
        };

        Ok(Publication {
            payload,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}
