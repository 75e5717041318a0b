//! Refill monitor.
//!
//! Evaluated on every supply change. The per-cycle flag lives on the
//! prescription itself so it survives journal replay; these functions only
//! decide what to do with it.

use crate::{Prescription, RefillNeeded};

/// Consume one dose from supply, clamped at zero
///
/// Returns a refill notice the first time supply drops to or below the
/// threshold within a depletion cycle.
pub fn consume(prescription: &mut Prescription) -> Option<RefillNeeded> {
    let before = prescription.supply;
    prescription.supply = before.saturating_sub(prescription.dosage.amount);
    tracing::debug!(
        "Supply for {} {} -> {}",
        prescription.id,
        before,
        prescription.supply
    );
    evaluate(prescription)
}

/// Add supply back (pharmacy refill or a reversed dose)
///
/// Rising above the threshold starts a new depletion cycle.
pub fn replenish(prescription: &mut Prescription, quantity: u32) {
    prescription.supply = prescription.supply.saturating_add(quantity);
    if prescription.supply > prescription.low_supply_threshold && prescription.refill_requested {
        tracing::debug!("Refill cycle reset for {}", prescription.id);
        prescription.refill_requested = false;
    }
}

/// Emit at most one refill notice per depletion cycle
pub fn evaluate(prescription: &mut Prescription) -> Option<RefillNeeded> {
    if prescription.supply > prescription.low_supply_threshold || prescription.refill_requested {
        return None;
    }
    prescription.refill_requested = true;
    tracing::info!(
        "Supply of {} is low ({} left, threshold {})",
        prescription.medication,
        prescription.supply,
        prescription.low_supply_threshold
    );
    Some(RefillNeeded {
        prescription_id: prescription.id,
        medication: prescription.medication.clone(),
        remaining: prescription.supply,
        threshold: prescription.low_supply_threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Contacts, Dosage, PrescriptionId};
    use chrono::Utc;

    fn prescription(supply: u32, threshold: u32, dose: u32) -> Prescription {
        Prescription {
            id: PrescriptionId::new(),
            owner: "patient-1".into(),
            medication: "Metformin".into(),
            dosage: Dosage {
                amount: dose,
                unit: "tablet".into(),
            },
            timezone: chrono_tz::Tz::UTC,
            contacts: Contacts {
                address: "+15550100".into(),
                channel: Default::default(),
                emergency: vec![],
                pharmacy: None,
            },
            notes: None,
            side_effects: None,
            storage: None,
            segments: vec![],
            supply,
            low_supply_threshold: threshold,
            refill_requested: false,
            generated_through: None,
            archived_at: None,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_supply_after_n_doses() {
        let mut p = prescription(10, 0, 3);
        for _ in 0..5 {
            consume(&mut p);
        }
        // max(0, 10 - 5*3)
        assert_eq!(p.supply, 0);

        let mut p = prescription(20, 0, 2);
        for _ in 0..4 {
            consume(&mut p);
        }
        assert_eq!(p.supply, 12);
    }

    #[test]
    fn test_one_notice_per_cycle() {
        let mut p = prescription(6, 3, 1);
        let notices: Vec<_> = (0..6).filter_map(|_| consume(&mut p)).collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].remaining, 3);
        assert_eq!(p.supply, 0);
    }

    #[test]
    fn test_replenish_starts_new_cycle() {
        let mut p = prescription(4, 3, 1);
        assert!(consume(&mut p).is_some());

        // Topping up but staying at the threshold keeps the cycle open
        replenish(&mut p, 0);
        assert!(p.refill_requested);

        replenish(&mut p, 10);
        assert!(!p.refill_requested);
        assert_eq!(p.supply, 13);

        let notices: Vec<_> = (0..13).filter_map(|_| consume(&mut p)).collect();
        assert_eq!(notices.len(), 1);
    }
}
