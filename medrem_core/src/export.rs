//! CSV export of dose history.

use crate::{DeliveryResult, DoseObligation, Prescription, PrescriptionId, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    obligation_id: String,
    prescription_id: String,
    owner: String,
    medication: String,
    dosage: String,
    scheduled_at: String,
    local_time: String,
    status: String,
    actual_time: Option<String>,
    attempts: u32,
    delivered_reminders: usize,
    amendments: usize,
}

impl CsvRow {
    fn new(prescription: &Prescription, obligation: &DoseObligation) -> Self {
        CsvRow {
            obligation_id: obligation.id.to_string(),
            prescription_id: prescription.id.to_string(),
            owner: prescription.owner.clone(),
            medication: prescription.medication.clone(),
            dosage: prescription.dosage.to_string(),
            scheduled_at: obligation.scheduled_at.to_rfc3339(),
            local_time: obligation
                .scheduled_at
                .with_timezone(&prescription.timezone)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            status: obligation.status.to_string(),
            actual_time: obligation.actual_time.map(|t| t.to_rfc3339()),
            attempts: obligation.attempts,
            delivered_reminders: obligation
                .reminders
                .iter()
                .filter(|r| r.result == DeliveryResult::Delivered)
                .count(),
            amendments: obligation.amendments.len(),
        }
    }
}

/// Write dose history as CSV, one row per obligation
///
/// Obligations whose prescription is not in `prescriptions` are skipped.
pub fn write_history<W: Write>(
    writer: W,
    prescriptions: &[Prescription],
    obligations: &[DoseObligation],
) -> Result<usize> {
    let by_id: HashMap<PrescriptionId, &Prescription> =
        prescriptions.iter().map(|p| (p.id, p)).collect();

    let mut writer = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for obligation in obligations {
        let Some(prescription) = by_id.get(&obligation.prescription_id) else {
            tracing::warn!("No prescription for dose {}, skipping", obligation.id);
            continue;
        };
        writer.serialize(CsvRow::new(prescription, obligation))?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

/// Export dose history to a CSV file, replacing it
pub fn export_history(
    path: &Path,
    prescriptions: &[Prescription],
    obligations: &[DoseObligation],
) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let rows = write_history(&file, prescriptions, obligations)?;
    file.sync_all()?;

    tracing::info!("Exported {} doses to {:?}", rows, path);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Contacts, Dosage, DoseStatus, DosingRule, Frequency, ReminderAttempt, RuleSegment,
    };
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

    fn prescription() -> Prescription {
        let rule = DosingRule {
            frequency: Frequency::Daily {
                times: vec![NaiveTime::from_hms_opt(8, 0, 0).unwrap()],
            },
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: None,
        };
        Prescription {
            id: PrescriptionId::new(),
            owner: "patient-1".into(),
            medication: "Levothyroxine".into(),
            dosage: Dosage {
                amount: 1,
                unit: "tablet".into(),
            },
            timezone: chrono_tz::America::New_York,
            contacts: Contacts {
                address: "+15550100".into(),
                channel: Default::default(),
                emergency: vec![],
                pharmacy: None,
            },
            notes: None,
            side_effects: None,
            storage: None,
            segments: vec![RuleSegment {
                effective_from: Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap(),
                rule,
            }],
            supply: 30,
            low_supply_threshold: 5,
            refill_requested: false,
            generated_through: None,
            archived_at: None,
            registered_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_history_rows() {
        let p = prescription();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 13, 0, 0).unwrap();
        let mut taken = DoseObligation::new(p.id, at);
        taken.status = DoseStatus::Taken;
        taken.actual_time = Some(at);
        taken.attempts = 1;
        taken.reminders.push(ReminderAttempt {
            obligation_id: taken.id,
            attempt: 1,
            channel: Default::default(),
            fired_at: at,
            result: DeliveryResult::Delivered,
        });
        let orphan = DoseObligation::new(PrescriptionId::new(), at);

        let mut out = Vec::new();
        let rows = write_history(&mut out, &[p], &[taken, orphan]).unwrap();
        assert_eq!(rows, 1);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("obligation_id,prescription_id,owner"));
        assert!(lines[1].contains("2024-01-02 08:00"));
        assert!(lines[1].contains("taken"));
        assert!(lines[1].ends_with(",1,1,0"));
    }

    #[test]
    fn test_export_creates_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out").join("history.csv");
        let p = prescription();
        let dose = DoseObligation::new(p.id, Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap());

        let rows = export_history(&path, &[p], &[dose]).unwrap();
        assert_eq!(rows, 1);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("pending"));
    }
}
