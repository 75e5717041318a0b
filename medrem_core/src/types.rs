//! Core domain types for the medication reminder system.
//!
//! This module defines the fundamental types used throughout the system:
//! - Identifiers for prescriptions and dose obligations
//! - Dosing rules and prescriptions
//! - Dose obligations and their status machine
//! - Reminder attempts and delivery results
//! - Outbound notices (refill, escalation) and read views

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a registered prescription
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PrescriptionId(pub Uuid);

impl PrescriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PrescriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PrescriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PrescriptionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a single dose obligation
///
/// Derived from the natural key (prescription, scheduled time), so that
/// regenerating the same dose always yields the same id.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ObligationId(pub Uuid);

impl ObligationId {
    pub fn derive(prescription: PrescriptionId, scheduled_at: DateTime<Utc>) -> Self {
        let key = scheduled_at.timestamp().to_string();
        Self(Uuid::new_v5(&prescription.0, key.as_bytes()))
    }
}

impl fmt::Display for ObligationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ObligationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ============================================================================
// Dosing Rules
// ============================================================================

/// How often a medication is due
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frequency {
    /// Every N minutes of wall-clock time, starting at `anchor` on the start date
    Interval {
        every_minutes: i64,
        #[serde(with = "hhmm")]
        anchor: NaiveTime,
    },
    /// Fixed times of day, every day
    Daily {
        #[serde(with = "hhmm::list")]
        times: Vec<NaiveTime>,
    },
    /// Fixed times of day on selected weekdays
    Weekly {
        days: Vec<Weekday>,
        #[serde(with = "hhmm::list")]
        times: Vec<NaiveTime>,
    },
}

/// A dosing rule: frequency plus the local calendar span it applies to
///
/// `end` is exclusive: no dose is due on or after local midnight of `end`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DosingRule {
    pub frequency: Frequency,
    pub start: NaiveDate,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

/// A rule together with the instant from which it governs generation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSegment {
    pub effective_from: DateTime<Utc>,
    pub rule: DosingRule,
}

// ============================================================================
// Prescriptions
// ============================================================================

/// Amount consumed per dose; supply is counted in the same unit
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dosage {
    pub amount: u32,
    pub unit: String,
}

impl fmt::Display for Dosage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}

/// Delivery channel kind understood by the external transport
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Sms,
    Push,
    Email,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Email => "email",
        };
        f.write_str(s)
    }
}

/// Who hears about a prescription
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contacts {
    /// The owner's own reminder address
    pub address: String,
    #[serde(default)]
    pub channel: Channel,
    /// Receive escalations when reminders go unanswered
    #[serde(default)]
    pub emergency: Vec<String>,
    /// Receives refill-needed notices
    #[serde(default)]
    pub pharmacy: Option<String>,
}

/// Caller-supplied definition used to register a prescription
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrescriptionDefinition {
    pub owner: String,
    pub medication: String,
    pub dosage: Dosage,
    pub rule: DosingRule,
    pub timezone: Tz,
    pub supply: u32,
    pub low_supply_threshold: u32,
    pub contacts: Contacts,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub side_effects: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
}

/// A registered prescription and its mutable supply/generation state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prescription {
    pub id: PrescriptionId,
    pub owner: String,
    pub medication: String,
    pub dosage: Dosage,
    pub timezone: Tz,
    pub contacts: Contacts,
    pub notes: Option<String>,
    pub side_effects: Option<String>,
    pub storage: Option<String>,
    /// Rule history, ordered by `effective_from`
    pub segments: Vec<RuleSegment>,
    pub supply: u32,
    pub low_supply_threshold: u32,
    /// A refill notice was already emitted for the current depletion cycle
    pub refill_requested: bool,
    /// Exclusive upper bound of the span already turned into obligations
    pub generated_through: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl Prescription {
    /// The rule currently in force (the most recent segment)
    pub fn current_rule(&self) -> Option<&DosingRule> {
        self.segments.last().map(|s| &s.rule)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

// ============================================================================
// Dose Obligations
// ============================================================================

/// Lifecycle status of a dose obligation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DoseStatus {
    Pending,
    Reminded,
    Taken,
    Missed,
    Skipped,
}

impl DoseStatus {
    /// Taken, Missed and Skipped are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(self, DoseStatus::Taken | DoseStatus::Missed | DoseStatus::Skipped)
    }
}

impl fmt::Display for DoseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DoseStatus::Pending => "pending",
            DoseStatus::Reminded => "reminded",
            DoseStatus::Taken => "taken",
            DoseStatus::Missed => "missed",
            DoseStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome a caller can report for a dose
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Taken,
    Missed,
    Skipped,
}

impl Outcome {
    pub fn status(self) -> DoseStatus {
        match self {
            Outcome::Taken => DoseStatus::Taken,
            Outcome::Missed => DoseStatus::Missed,
            Outcome::Skipped => DoseStatus::Skipped,
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "taken" | "take" => Ok(Outcome::Taken),
            "missed" | "miss" => Ok(Outcome::Missed),
            "skipped" | "skip" => Ok(Outcome::Skipped),
            other => Err(format!("unknown outcome: {}", other)),
        }
    }
}

/// Audited correction of a terminal status
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Amendment {
    pub from: DoseStatus,
    pub to: DoseStatus,
    pub actual_time: Option<DateTime<Utc>>,
    pub reason: String,
    pub amended_at: DateTime<Utc>,
}

/// Result reported by the delivery transport
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered,
    Failed,
    TimedOut,
}

/// One reminder delivery attempt (append-only)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderAttempt {
    pub obligation_id: ObligationId,
    pub attempt: u32,
    pub channel: Channel,
    pub fired_at: DateTime<Utc>,
    pub result: DeliveryResult,
}

/// A single (prescription, scheduled time) dose and its lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoseObligation {
    pub id: ObligationId,
    pub prescription_id: PrescriptionId,
    pub scheduled_at: DateTime<Utc>,
    pub status: DoseStatus,
    pub actual_time: Option<DateTime<Utc>>,
    pub attempts: u32,
    /// Supply actually deducted for this dose (less than the dosage when clamped at zero)
    #[serde(default)]
    pub consumed: u32,
    #[serde(default)]
    pub reminders: Vec<ReminderAttempt>,
    #[serde(default)]
    pub amendments: Vec<Amendment>,
}

impl DoseObligation {
    pub fn new(prescription_id: PrescriptionId, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: ObligationId::derive(prescription_id, scheduled_at),
            prescription_id,
            scheduled_at,
            status: DoseStatus::Pending,
            actual_time: None,
            attempts: 0,
            consumed: 0,
            reminders: Vec::new(),
            amendments: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

// ============================================================================
// Notices and Views
// ============================================================================

/// Supply fell to or below the low-supply threshold
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefillNeeded {
    pub prescription_id: PrescriptionId,
    pub medication: String,
    pub remaining: u32,
    pub threshold: u32,
}

/// Reminders were exhausted without an outcome
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Escalation {
    pub obligation_id: ObligationId,
    pub prescription_id: PrescriptionId,
    pub owner: String,
    pub medication: String,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Event published to the external notification collaborator
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    RefillNeeded(RefillNeeded),
    Escalation(Escalation),
}

/// Message handed to a delivery channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

/// What a query is scoped to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Subject {
    Prescription(PrescriptionId),
    Owner(String),
}

/// Read view of a dose for the UI layer
#[derive(Clone, Debug, Serialize)]
pub struct ObligationView {
    pub id: ObligationId,
    pub prescription_id: PrescriptionId,
    pub medication: String,
    pub dosage: Dosage,
    pub scheduled_at: DateTime<Utc>,
    /// Scheduled time rendered in the owner's time zone
    pub local_time: String,
    pub status: DoseStatus,
    pub actual_time: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub notes: Option<String>,
}

impl ObligationView {
    pub fn new(prescription: &Prescription, obligation: &DoseObligation) -> Self {
        let local = obligation.scheduled_at.with_timezone(&prescription.timezone);
        Self {
            id: obligation.id,
            prescription_id: prescription.id,
            medication: prescription.medication.clone(),
            dosage: prescription.dosage.clone(),
            scheduled_at: obligation.scheduled_at,
            local_time: local.format("%Y-%m-%d %H:%M %Z").to_string(),
            status: obligation.status,
            actual_time: obligation.actual_time,
            attempts: obligation.attempts,
            notes: prescription.notes.clone(),
        }
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

/// `HH:MM` wall-clock times
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(|e| {
            serde::de::Error::custom(format!("invalid time '{}', use HH:MM: {}", raw, e))
        })
    }

    pub mod list {
        use super::FORMAT;
        use chrono::NaiveTime;
        use serde::ser::SerializeSeq;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(times: &[NaiveTime], s: S) -> Result<S::Ok, S::Error> {
            let mut seq = s.serialize_seq(Some(times.len()))?;
            for t in times {
                seq.serialize_element(&t.format(FORMAT).to_string())?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<NaiveTime>, D::Error> {
            let raw = Vec::<String>::deserialize(d)?;
            raw.iter()
                .map(|r| {
                    NaiveTime::parse_from_str(r, FORMAT).map_err(|e| {
                        serde::de::Error::custom(format!("invalid time '{}', use HH:MM: {}", r, e))
                    })
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_obligation_id_is_stable() {
        let pid = PrescriptionId::new();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        assert_eq!(ObligationId::derive(pid, at), ObligationId::derive(pid, at));
        assert_ne!(
            ObligationId::derive(pid, at),
            ObligationId::derive(pid, at + chrono::Duration::minutes(1))
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!DoseStatus::Pending.is_terminal());
        assert!(!DoseStatus::Reminded.is_terminal());
        assert!(DoseStatus::Taken.is_terminal());
        assert!(DoseStatus::Missed.is_terminal());
        assert!(DoseStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_rule_parses_hhmm_times() {
        let toml_str = r#"
start = "2024-01-01"

[frequency]
kind = "daily"
times = ["08:00", "20:00"]
"#;
        let rule: DosingRule = toml::from_str(toml_str).unwrap();
        match rule.frequency {
            Frequency::Daily { times } => {
                assert_eq!(times[0], NaiveTime::from_hms_opt(8, 0, 0).unwrap());
                assert_eq!(times[1], NaiveTime::from_hms_opt(20, 0, 0).unwrap());
            }
            other => panic!("unexpected frequency {:?}", other),
        }
    }

    #[test]
    fn test_rule_rejects_bad_time() {
        let toml_str = r#"
start = "2024-01-01"

[frequency]
kind = "daily"
times = ["8am"]
"#;
        assert!(toml::from_str::<DosingRule>(toml_str).is_err());
    }

    #[test]
    fn test_outcome_from_str() {
        assert_eq!("Taken".parse::<Outcome>().unwrap(), Outcome::Taken);
        assert_eq!("skip".parse::<Outcome>().unwrap(), Outcome::Skipped);
        assert!("later".parse::<Outcome>().is_err());
    }
}
