//! Dose ledger: the source of truth for dose obligations.
//!
//! Each prescription owns a "book" guarded by its own mutex. Every
//! operation on an obligation (reminding, resolving, sweeping, amending)
//! takes that lock, so transitions on the same obligation are serialized
//! while different prescriptions proceed in parallel.
//!
//! Mutations are expressed as [`JournalEntry`] values: validated against
//! the book, appended to the sink, then applied. Replaying a journal runs
//! the same validate/apply path.

use crate::journal::{
    read_entries, JournalCursor, JournalEntry, JournalLock, JsonlJournal, LedgerSink, Tail,
};
use crate::{
    refill, schedule, Amendment, Channel, Dosage, DoseObligation, DoseStatus, DosingRule, Error,
    ObligationId, ObligationView, Outcome, Prescription, PrescriptionDefinition, PrescriptionId,
    RefillNeeded, ReminderAttempt, Result, RuleSegment, Subject,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Result of resolving or amending a dose
#[derive(Clone, Debug)]
pub struct Resolution {
    pub obligation: DoseObligation,
    /// Set when this change started a refill cycle
    pub refill: Option<RefillNeeded>,
}

/// Summary of a sweep pass
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    pub missed: Vec<ObligationId>,
    pub errors: usize,
}

/// An open dose together with what the scheduler needs to remind about it
#[derive(Clone, Debug)]
pub struct ReminderTarget {
    pub obligation_id: ObligationId,
    pub prescription_id: PrescriptionId,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    pub owner: String,
    pub medication: String,
    pub dosage: Dosage,
    pub local_time: String,
    pub recipient: String,
    pub channel: Channel,
}

/// Changes an applied entry made that the ledger has to react to
#[derive(Debug, Default)]
struct Effect {
    created: Vec<ObligationId>,
    removed: Vec<ObligationId>,
    refill: Option<RefillNeeded>,
}

/// One prescription and its obligations
struct Book {
    prescription: Prescription,
    obligations: BTreeMap<DateTime<Utc>, DoseObligation>,
    by_id: HashMap<ObligationId, DateTime<Utc>>,
}

impl Book {
    fn new(prescription: Prescription) -> Self {
        Self {
            prescription,
            obligations: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    fn get(&self, id: ObligationId) -> Result<&DoseObligation> {
        self.by_id
            .get(&id)
            .and_then(|at| self.obligations.get(at))
            .ok_or_else(|| Error::unknown_dose(id))
    }

    fn get_mut(&mut self, id: ObligationId) -> Option<&mut DoseObligation> {
        let at = self.by_id.get(&id)?;
        self.obligations.get_mut(at)
    }

    fn insert(&mut self, obligation: DoseObligation) {
        self.by_id.insert(obligation.id, obligation.scheduled_at);
        self.obligations.insert(obligation.scheduled_at, obligation);
    }

    /// Check an entry against the state machine without touching anything
    fn validate(&self, entry: &JournalEntry) -> Result<()> {
        match entry {
            JournalEntry::RuleEdited { segment, .. } => {
                if self.prescription.is_archived() {
                    return Err(Error::InvalidRule(format!(
                        "prescription {} is archived",
                        self.prescription.id
                    )));
                }
                schedule::validate(&segment.rule)?;
                if let Some(last) = self.prescription.segments.last() {
                    if segment.effective_from < last.effective_from {
                        return Err(Error::InvalidRule(
                            "rule edit predates the rule currently in force".into(),
                        ));
                    }
                }
            }
            JournalEntry::Reminded { obligation_id, .. } => {
                let o = self.get(*obligation_id)?;
                if o.status.is_terminal() {
                    return Err(Error::InvalidTransition {
                        obligation: o.id,
                        from: o.status,
                        to: DoseStatus::Reminded,
                    });
                }
            }
            JournalEntry::AttemptLogged { attempt, .. } => {
                let o = self.get(attempt.obligation_id)?;
                let dispatched = attempt.attempt >= 1 && attempt.attempt <= o.attempts;
                let logged = o.reminders.iter().any(|r| r.attempt == attempt.attempt);
                if !dispatched || logged {
                    return Err(Error::NotFound {
                        kind: "reminder attempt",
                        id: format!("{}#{}", o.id, attempt.attempt),
                    });
                }
            }
            JournalEntry::Resolved {
                obligation_id,
                status,
                ..
            } => {
                let o = self.get(*obligation_id)?;
                if o.status.is_terminal() || !status.is_terminal() {
                    return Err(Error::InvalidTransition {
                        obligation: o.id,
                        from: o.status,
                        to: *status,
                    });
                }
            }
            JournalEntry::Amended {
                obligation_id,
                amendment,
                ..
            } => {
                let o = self.get(*obligation_id)?;
                let valid = o.status.is_terminal()
                    && amendment.from == o.status
                    && amendment.to.is_terminal()
                    && amendment.to != amendment.from;
                if !valid {
                    return Err(Error::InvalidTransition {
                        obligation: o.id,
                        from: o.status,
                        to: amendment.to,
                    });
                }
            }
            JournalEntry::Registered { .. }
            | JournalEntry::Generated { .. }
            | JournalEntry::Replenished { .. }
            | JournalEntry::Archived { .. }
            | JournalEntry::Restored { .. } => {}
        }
        Ok(())
    }

    /// Apply a validated entry
    fn apply(&mut self, entry: &JournalEntry) -> Effect {
        let mut effect = Effect::default();
        match entry {
            JournalEntry::Registered { .. } => {}
            JournalEntry::RuleEdited { segment, .. } => {
                self.prescription.segments.push(segment.clone());
            }
            JournalEntry::Generated {
                through, scheduled, ..
            } => {
                for at in scheduled {
                    if self.obligations.contains_key(at) {
                        continue;
                    }
                    let obligation = DoseObligation::new(self.prescription.id, *at);
                    effect.created.push(obligation.id);
                    self.insert(obligation);
                }
                let through = match self.prescription.generated_through {
                    Some(prev) => prev.max(*through),
                    None => *through,
                };
                self.prescription.generated_through = Some(through);
            }
            JournalEntry::Reminded { obligation_id, .. } => {
                if let Some(o) = self.get_mut(*obligation_id) {
                    o.status = DoseStatus::Reminded;
                    o.attempts += 1;
                }
            }
            JournalEntry::AttemptLogged { attempt, .. } => {
                if let Some(o) = self.get_mut(attempt.obligation_id) {
                    o.reminders.push(attempt.clone());
                }
            }
            JournalEntry::Resolved {
                obligation_id,
                status,
                actual_time,
                ..
            } => {
                if let Some(o) = self.get_mut(*obligation_id) {
                    o.status = *status;
                    o.actual_time = *actual_time;
                    if *status == DoseStatus::Taken {
                        effect.refill = self.consume(*obligation_id);
                    }
                }
            }
            JournalEntry::Amended {
                obligation_id,
                amendment,
                ..
            } => {
                if let Some(o) = self.get_mut(*obligation_id) {
                    o.status = amendment.to;
                    o.actual_time = amendment.actual_time;
                    o.amendments.push(amendment.clone());
                    let restored = std::mem::take(&mut o.consumed);

                    if amendment.from == DoseStatus::Taken {
                        refill::replenish(&mut self.prescription, restored);
                    }
                    if amendment.to == DoseStatus::Taken {
                        effect.refill = self.consume(*obligation_id);
                    }
                }
            }
            JournalEntry::Replenished { quantity, .. } => {
                refill::replenish(&mut self.prescription, *quantity);
            }
            JournalEntry::Archived { at, .. } => {
                if self.prescription.archived_at.is_none() {
                    self.prescription.archived_at = Some(*at);
                    let untouched: Vec<_> = self
                        .obligations
                        .range(*at..)
                        .filter(|(_, o)| o.status == DoseStatus::Pending && o.attempts == 0)
                        .map(|(t, o)| (*t, o.id))
                        .collect();
                    for (t, id) in untouched {
                        self.obligations.remove(&t);
                        self.by_id.remove(&id);
                        effect.removed.push(id);
                    }
                }
            }
            JournalEntry::Restored { obligations, .. } => {
                for o in obligations {
                    effect.created.push(o.id);
                    self.insert(o.clone());
                }
            }
        }
        effect
    }

    /// Deduct one dose from supply, remembering what was actually deducted
    fn consume(&mut self, id: ObligationId) -> Option<RefillNeeded> {
        let before = self.prescription.supply;
        let refill = refill::consume(&mut self.prescription);
        let consumed = before - self.prescription.supply;
        if let Some(o) = self.get_mut(id) {
            o.consumed = consumed;
        }
        refill
    }

    fn target(&self, o: &DoseObligation) -> ReminderTarget {
        let p = &self.prescription;
        ReminderTarget {
            obligation_id: o.id,
            prescription_id: p.id,
            scheduled_at: o.scheduled_at,
            attempts: o.attempts,
            owner: p.owner.clone(),
            medication: p.medication.clone(),
            dosage: p.dosage.clone(),
            local_time: o
                .scheduled_at
                .with_timezone(&p.timezone)
                .format("%H:%M")
                .to_string(),
            recipient: p.contacts.address.clone(),
            channel: p.contacts.channel,
        }
    }
}

/// A book plus its immutable owner, so owner queries need no lock
struct Slot {
    owner: String,
    book: Mutex<Book>,
}

fn lock(slot: &Slot) -> Result<MutexGuard<'_, Book>> {
    slot.book.lock().map_err(|_| Error::LockPoisoned)
}

/// A journal this ledger shares with other processes
struct Follow {
    path: PathBuf,
    cursor: Mutex<JournalCursor>,
}

/// The dose ledger
pub struct DoseLedger {
    slots: RwLock<HashMap<PrescriptionId, Arc<Slot>>>,
    index: RwLock<HashMap<ObligationId, PrescriptionId>>,
    sink: Option<Box<dyn LedgerSink>>,
    follow: Option<Follow>,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

/// Exclusive access to a shared journal; see [`DoseLedger::sync`]
pub struct SyncGuard<'a> {
    ledger: &'a DoseLedger,
    lock: Option<JournalLock>,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        if self.lock.is_none() {
            return;
        }
        let Some(follow) = &self.ledger.follow else {
            return;
        };
        // Our own appends are already applied; don't read them back
        let marked = follow
            .cursor
            .lock()
            .map_err(|_| Error::LockPoisoned)
            .and_then(|mut cursor| cursor.skip_to_end(&follow.path));
        if let Err(e) = marked {
            tracing::warn!("Could not advance journal cursor: {}", e);
        }
    }
}

impl DoseLedger {
    /// A ledger that keeps nothing beyond process memory
    pub fn in_memory() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            sink: None,
            follow: None,
            last_sweep: Mutex::new(None),
        }
    }

    /// A fresh ledger that records every mutation to `sink`
    pub fn with_sink(sink: impl LedgerSink + 'static) -> Self {
        let mut ledger = Self::in_memory();
        ledger.sink = Some(Box::new(sink));
        ledger
    }

    /// Rebuild a ledger from a journal file and keep appending to it
    ///
    /// The caller must be the journal's only writer (see [`JournalLock`]).
    pub fn open(path: &Path) -> Result<Self> {
        let entries = read_entries(path)?;
        let mut ledger = Self::in_memory();
        let skipped = ledger.replay_all(&entries);

        ledger.sink = Some(Box::new(JsonlJournal::new(path)));
        tracing::info!(
            "Replayed {} journal entries from {:?} ({} skipped)",
            entries.len() - skipped,
            path,
            skipped
        );
        Ok(ledger)
    }

    /// Open a journal that short-lived processes keep writing to
    ///
    /// Every mutation must happen inside [`sync`](Self::sync), which picks
    /// up what the other processes appended in the meantime.
    pub fn open_shared(path: &Path) -> Result<Self> {
        let mut ledger = Self::in_memory();
        let mut cursor = JournalCursor::default();
        {
            let _lock = JournalLock::acquire(path)?;
            let entries = match cursor.read_new(path)? {
                Tail::Appended(entries) | Tail::Rewritten(entries) => entries,
            };
            let skipped = ledger.replay_all(&entries);
            tracing::info!(
                "Following journal {:?} from {} entries ({} skipped)",
                path,
                entries.len() - skipped,
                skipped
            );
        }

        ledger.sink = Some(Box::new(JsonlJournal::new(path)));
        ledger.follow = Some(Follow {
            path: path.to_path_buf(),
            cursor: Mutex::new(cursor),
        });
        Ok(ledger)
    }

    /// Take the journal lock and apply entries other processes appended
    ///
    /// Hold the guard across a batch of mutations and drop it before any
    /// slow work. Does nothing for a ledger that owns its journal.
    pub fn sync(&self) -> Result<SyncGuard<'_>> {
        let Some(follow) = &self.follow else {
            return Ok(SyncGuard {
                ledger: self,
                lock: None,
            });
        };
        let lock = JournalLock::acquire(&follow.path)?;

        let tail = {
            let mut cursor = follow.cursor.lock().map_err(|_| Error::LockPoisoned)?;
            cursor.read_new(&follow.path)?
        };
        match tail {
            Tail::Appended(entries) => {
                if !entries.is_empty() {
                    let skipped = self.replay_all(&entries);
                    tracing::debug!(
                        "Applied {} new journal entries ({} skipped)",
                        entries.len() - skipped,
                        skipped
                    );
                }
            }
            Tail::Rewritten(entries) => {
                tracing::info!("Journal {:?} was rewritten, reloading", follow.path);
                self.clear()?;
                self.replay_all(&entries);
            }
        }

        Ok(SyncGuard {
            ledger: self,
            lock: Some(lock),
        })
    }

    fn clear(&self) -> Result<()> {
        self.slots.write().map_err(|_| Error::LockPoisoned)?.clear();
        self.index.write().map_err(|_| Error::LockPoisoned)?.clear();
        Ok(())
    }

    /// Replay entries, returning how many were skipped
    fn replay_all(&self, entries: &[JournalEntry]) -> usize {
        let mut skipped = 0;
        for entry in entries {
            if let Err(e) = self.replay(entry) {
                tracing::warn!("Skipping journal entry for {}: {}", entry.prescription_id(), e);
                skipped += 1;
            }
        }
        skipped
    }

    fn replay(&self, entry: &JournalEntry) -> Result<()> {
        if let JournalEntry::Registered { prescription } = entry {
            return self.insert_slot(prescription.clone());
        }
        let slot = self.slot(entry.prescription_id())?;
        let mut book = lock(&slot)?;
        book.validate(entry)?;
        let effect = book.apply(entry);
        self.reindex(book.prescription.id, &effect)
    }

    fn append(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(sink) = &self.sink {
            sink.append(entry)?;
        }
        Ok(())
    }

    /// Validate, journal, then apply
    fn commit(&self, book: &mut Book, entry: JournalEntry) -> Result<Effect> {
        book.validate(&entry)?;
        self.append(&entry)?;
        let effect = book.apply(&entry);
        self.reindex(book.prescription.id, &effect)?;
        Ok(effect)
    }

    fn reindex(&self, prescription: PrescriptionId, effect: &Effect) -> Result<()> {
        if effect.created.is_empty() && effect.removed.is_empty() {
            return Ok(());
        }
        let mut index = self.index.write().map_err(|_| Error::LockPoisoned)?;
        for id in &effect.created {
            index.insert(*id, prescription);
        }
        for id in &effect.removed {
            index.remove(id);
        }
        Ok(())
    }

    fn insert_slot(&self, prescription: Prescription) -> Result<()> {
        let mut slots = self.slots.write().map_err(|_| Error::LockPoisoned)?;
        if slots.contains_key(&prescription.id) {
            return Err(Error::InvalidRule(format!(
                "prescription {} already registered",
                prescription.id
            )));
        }
        slots.insert(
            prescription.id,
            Arc::new(Slot {
                owner: prescription.owner.clone(),
                book: Mutex::new(Book::new(prescription)),
            }),
        );
        Ok(())
    }

    fn slot(&self, id: PrescriptionId) -> Result<Arc<Slot>> {
        let slots = self.slots.read().map_err(|_| Error::LockPoisoned)?;
        slots
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::unknown_prescription(id))
    }

    fn slot_of(&self, id: ObligationId) -> Result<Arc<Slot>> {
        let prescription = {
            let index = self.index.read().map_err(|_| Error::LockPoisoned)?;
            index.get(&id).copied().ok_or_else(|| Error::unknown_dose(id))?
        };
        self.slot(prescription)
    }

    fn slots_for(&self, subject: &Subject) -> Result<Vec<Arc<Slot>>> {
        match subject {
            Subject::Prescription(id) => Ok(vec![self.slot(*id)?]),
            Subject::Owner(owner) => {
                let slots = self.slots.read().map_err(|_| Error::LockPoisoned)?;
                Ok(slots
                    .values()
                    .filter(|s| &s.owner == owner)
                    .cloned()
                    .collect())
            }
        }
    }

    fn all_slots(&self) -> Result<Vec<Arc<Slot>>> {
        let slots = self.slots.read().map_err(|_| Error::LockPoisoned)?;
        Ok(slots.values().cloned().collect())
    }

    // ------------------------------------------------------------------
    // Prescription lifecycle
    // ------------------------------------------------------------------

    /// Register a prescription; fails with `InvalidRule` on a bad definition
    pub fn register(
        &self,
        definition: PrescriptionDefinition,
        now: DateTime<Utc>,
    ) -> Result<PrescriptionId> {
        schedule::validate(&definition.rule)?;
        if definition.dosage.amount == 0 {
            return Err(Error::InvalidRule("dosage amount must be positive".into()));
        }
        if definition.medication.trim().is_empty() {
            return Err(Error::InvalidRule("medication name is required".into()));
        }

        let id = PrescriptionId::new();
        let effective_from = schedule::rule_start(&definition.rule, definition.timezone);
        let prescription = Prescription {
            id,
            owner: definition.owner,
            medication: definition.medication.trim().to_string(),
            dosage: definition.dosage,
            timezone: definition.timezone,
            contacts: definition.contacts,
            notes: definition.notes,
            side_effects: definition.side_effects,
            storage: definition.storage,
            segments: vec![RuleSegment {
                effective_from,
                rule: definition.rule,
            }],
            supply: definition.supply,
            low_supply_threshold: definition.low_supply_threshold,
            refill_requested: false,
            generated_through: None,
            archived_at: None,
            registered_at: now,
        };

        self.append(&JournalEntry::Registered {
            prescription: prescription.clone(),
        })?;
        tracing::info!(
            "Registered {} ({}) for {}",
            prescription.medication,
            id,
            prescription.owner
        );
        self.insert_slot(prescription)?;
        Ok(id)
    }

    /// Replace the dosing rule going forward
    ///
    /// The new rule takes effect no earlier than the end of the span already
    /// generated, so existing obligations are never altered. Returns the
    /// instant the new rule actually takes effect.
    pub fn edit_rule(
        &self,
        id: PrescriptionId,
        rule: DosingRule,
        effective_from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let slot = self.slot(id)?;
        let mut book = lock(&slot)?;

        let mut effective = effective_from;
        if let Some(through) = book.prescription.generated_through {
            effective = effective.max(through);
        }
        if let Some(last) = book.prescription.segments.last() {
            effective = effective.max(last.effective_from);
        }

        self.commit(
            &mut book,
            JournalEntry::RuleEdited {
                prescription_id: id,
                segment: RuleSegment {
                    effective_from: effective,
                    rule,
                },
            },
        )?;
        tracing::info!("Rule for {} changed, effective {}", id, effective);
        Ok(effective)
    }

    /// Add supply; returns the new supply count
    pub fn replenish(&self, id: PrescriptionId, quantity: u32, at: DateTime<Utc>) -> Result<u32> {
        let slot = self.slot(id)?;
        let mut book = lock(&slot)?;
        self.commit(
            &mut book,
            JournalEntry::Replenished {
                prescription_id: id,
                quantity,
                at,
            },
        )?;
        tracing::info!(
            "Replenished {} by {} (now {})",
            id,
            quantity,
            book.prescription.supply
        );
        Ok(book.prescription.supply)
    }

    /// Stop generating doses from `at` on, keeping history
    pub fn archive(&self, id: PrescriptionId, at: DateTime<Utc>) -> Result<()> {
        let slot = self.slot(id)?;
        let mut book = lock(&slot)?;
        if book.prescription.is_archived() {
            return Ok(());
        }
        let effect = self.commit(
            &mut book,
            JournalEntry::Archived {
                prescription_id: id,
                at,
            },
        )?;
        tracing::info!(
            "Archived {} at {} ({} future doses dropped)",
            id,
            at,
            effect.removed.len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Obligation lifecycle
    // ------------------------------------------------------------------

    /// Extend a prescription's obligations up to `up_to` (exclusive)
    ///
    /// Idempotent: timestamps that already have an obligation are left alone.
    /// Returns the number of obligations created.
    pub fn ensure_generated(&self, id: PrescriptionId, up_to: DateTime<Utc>) -> Result<usize> {
        let slot = self.slot(id)?;
        let mut book = lock(&slot)?;

        let p = &book.prescription;
        let horizon = match p.archived_at {
            Some(archived) => up_to.min(archived),
            None => up_to,
        };
        let from = match (p.generated_through, p.segments.first()) {
            (Some(through), _) => through,
            (None, Some(first)) => first.effective_from,
            (None, None) => return Ok(0),
        };
        if horizon <= from {
            return Ok(0);
        }

        let scheduled: Vec<_> = schedule::generate_segments(&p.segments, p.timezone, from, horizon)
            .into_iter()
            .filter(|at| !book.obligations.contains_key(at))
            .collect();
        if scheduled.is_empty() {
            return Ok(0);
        }

        let effect = self.commit(
            &mut book,
            JournalEntry::Generated {
                prescription_id: id,
                through: horizon,
                scheduled,
            },
        )?;
        tracing::debug!(
            "Generated {} obligations for {} through {}",
            effect.created.len(),
            id,
            horizon
        );
        Ok(effect.created.len())
    }

    /// [`ensure_generated`](Self::ensure_generated) for every prescription
    pub fn ensure_generated_all(&self, up_to: DateTime<Utc>) -> Result<usize> {
        let ids: Vec<_> = {
            let slots = self.slots.read().map_err(|_| Error::LockPoisoned)?;
            slots.keys().copied().collect()
        };
        let mut created = 0;
        for id in ids {
            created += self.ensure_generated(id, up_to)?;
        }
        Ok(created)
    }

    /// Pending/Reminded -> Reminded, bumping the attempt count
    ///
    /// Returns the new attempt number.
    pub fn mark_reminded(&self, id: ObligationId, at: DateTime<Utc>) -> Result<u32> {
        let slot = self.slot_of(id)?;
        let mut book = lock(&slot)?;
        let prescription_id = book.prescription.id;
        self.commit(
            &mut book,
            JournalEntry::Reminded {
                prescription_id,
                obligation_id: id,
                at,
            },
        )?;
        let attempts = book.get(id)?.attempts;
        tracing::debug!("Dose {} reminded (attempt {})", id, attempts);
        Ok(attempts)
    }

    /// Append the result of a dispatched reminder
    pub fn log_attempt(&self, attempt: ReminderAttempt) -> Result<()> {
        let slot = self.slot_of(attempt.obligation_id)?;
        let mut book = lock(&slot)?;
        let prescription_id = book.prescription.id;
        self.commit(
            &mut book,
            JournalEntry::AttemptLogged {
                prescription_id,
                attempt,
            },
        )?;
        Ok(())
    }

    /// Pending/Reminded -> Taken/Missed/Skipped
    ///
    /// A Taken outcome consumes one dose of supply and may start a refill
    /// cycle.
    pub fn record_outcome(
        &self,
        id: ObligationId,
        outcome: Outcome,
        actual_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let slot = self.slot_of(id)?;
        let mut book = lock(&slot)?;
        let prescription_id = book.prescription.id;
        let effect = self.commit(
            &mut book,
            JournalEntry::Resolved {
                prescription_id,
                obligation_id: id,
                status: outcome.status(),
                actual_time: Some(actual_time),
                at: now,
            },
        )?;
        tracing::debug!("Dose {} resolved as {}", id, outcome.status());
        Ok(Resolution {
            obligation: book.get(id)?.clone(),
            refill: effect.refill,
        })
    }

    /// Correct a terminal status with an audit record
    pub fn amend_outcome(
        &self,
        id: ObligationId,
        outcome: Outcome,
        actual_time: Option<DateTime<Utc>>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let slot = self.slot_of(id)?;
        let mut book = lock(&slot)?;
        let prescription_id = book.prescription.id;
        let from = book.get(id)?.status;
        let effect = self.commit(
            &mut book,
            JournalEntry::Amended {
                prescription_id,
                obligation_id: id,
                amendment: Amendment {
                    from,
                    to: outcome.status(),
                    actual_time,
                    reason: reason.to_string(),
                    amended_at: now,
                },
            },
        )?;
        tracing::info!("Dose {} amended {} -> {}: {}", id, from, outcome.status(), reason);
        Ok(Resolution {
            obligation: book.get(id)?.clone(),
            refill: effect.refill,
        })
    }

    /// Resolve every open obligation whose grace window has elapsed as Missed
    ///
    /// Best effort: anomalies are logged and the pass carries on.
    pub fn sweep_overdue(&self, now: DateTime<Utc>, grace: Duration) -> SweepReport {
        self.note_sweep(now);
        let mut report = SweepReport::default();
        let slots = match self.all_slots() {
            Ok(slots) => slots,
            Err(e) => {
                tracing::warn!("Sweep aborted: {}", e);
                report.errors += 1;
                return report;
            }
        };
        for slot in slots {
            self.sweep_slot(&slot, now, grace, &mut report);
        }
        if !report.missed.is_empty() {
            tracing::info!("Sweep marked {} doses missed", report.missed.len());
        }
        report
    }

    /// Sweep a single prescription
    pub fn sweep_prescription(
        &self,
        id: PrescriptionId,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        match self.slot(id) {
            Ok(slot) => self.sweep_slot(&slot, now, grace, &mut report),
            Err(e) => {
                tracing::warn!("Sweep skipped {}: {}", id, e);
                report.errors += 1;
            }
        }
        report
    }

    fn note_sweep(&self, now: DateTime<Utc>) {
        if let Ok(mut last) = self.last_sweep.lock() {
            match *last {
                Some(prev) if now < prev => {
                    tracing::warn!("Clock moved backwards: sweep at {} after {}", now, prev);
                }
                _ => *last = Some(now),
            }
        }
    }

    fn sweep_slot(&self, slot: &Slot, now: DateTime<Utc>, grace: Duration, report: &mut SweepReport) {
        let mut book = match lock(slot) {
            Ok(book) => book,
            Err(e) => {
                tracing::warn!("Sweep skipped a prescription: {}", e);
                report.errors += 1;
                return;
            }
        };
        let prescription_id = book.prescription.id;
        let overdue: Vec<_> = book
            .obligations
            .values()
            .take_while(|o| o.scheduled_at + grace <= now)
            .filter(|o| o.is_open())
            .map(|o| o.id)
            .collect();

        for id in overdue {
            let entry = JournalEntry::Resolved {
                prescription_id,
                obligation_id: id,
                status: DoseStatus::Missed,
                actual_time: None,
                at: now,
            };
            match self.commit(&mut book, entry) {
                Ok(_) => {
                    tracing::debug!("Dose {} missed (grace expired)", id);
                    report.missed.push(id);
                }
                Err(e) => {
                    tracing::warn!("Sweep could not resolve {}: {}", id, e);
                    report.errors += 1;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn prescription(&self, id: PrescriptionId) -> Result<Prescription> {
        let slot = self.slot(id)?;
        let book = lock(&slot)?;
        Ok(book.prescription.clone())
    }

    pub fn prescriptions(&self) -> Result<Vec<Prescription>> {
        let mut all = Vec::new();
        for slot in self.all_slots()? {
            all.push(lock(&slot)?.prescription.clone());
        }
        all.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(all)
    }

    pub fn obligation(&self, id: ObligationId) -> Result<DoseObligation> {
        let slot = self.slot_of(id)?;
        let book = lock(&slot)?;
        Ok(book.get(id)?.clone())
    }

    /// Prescription and obligation together, for building messages
    pub fn context(&self, id: ObligationId) -> Result<(Prescription, DoseObligation)> {
        let slot = self.slot_of(id)?;
        let book = lock(&slot)?;
        Ok((book.prescription.clone(), book.get(id)?.clone()))
    }

    /// Obligations scheduled in `[from, to)`
    pub fn obligations(
        &self,
        subject: &Subject,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DoseObligation>> {
        let mut found = Vec::new();
        if from >= to {
            return Ok(found);
        }
        for slot in self.slots_for(subject)? {
            let book = lock(&slot)?;
            found.extend(book.obligations.range(from..to).map(|(_, o)| o.clone()));
        }
        found.sort_by_key(|o| o.scheduled_at);
        Ok(found)
    }

    /// Open obligations scheduled at or before `as_of`
    pub fn due(&self, subject: &Subject, as_of: DateTime<Utc>) -> Result<Vec<ObligationView>> {
        let mut due = Vec::new();
        for slot in self.slots_for(subject)? {
            let book = lock(&slot)?;
            if book.prescription.is_archived() {
                continue;
            }
            due.extend(
                book.obligations
                    .range(..=as_of)
                    .filter(|(_, o)| o.is_open())
                    .map(|(_, o)| ObligationView::new(&book.prescription, o)),
            );
        }
        due.sort_by_key(|v| v.scheduled_at);
        Ok(due)
    }

    /// Everything an owner has scheduled on a local calendar day
    pub fn day_views(&self, owner: &str, date: NaiveDate) -> Result<Vec<ObligationView>> {
        let mut views = Vec::new();
        for slot in self.slots_for(&Subject::Owner(owner.to_string()))? {
            let book = lock(&slot)?;
            let tz = book.prescription.timezone;
            let start = schedule::resolve_local(tz, NaiveDateTime::new(date, NaiveTime::MIN));
            let end = schedule::resolve_local(
                tz,
                NaiveDateTime::new(date + Duration::days(1), NaiveTime::MIN),
            );
            if let (Some(start), Some(end)) = (start, end) {
                views.extend(
                    book.obligations
                        .range(start..end)
                        .map(|(_, o)| ObligationView::new(&book.prescription, o)),
                );
            }
        }
        views.sort_by_key(|v| v.scheduled_at);
        Ok(views)
    }

    /// The earliest open obligation at or after `as_of`
    pub fn next_due(&self, owner: &str, as_of: DateTime<Utc>) -> Result<Option<ObligationView>> {
        let mut next: Option<ObligationView> = None;
        for slot in self.slots_for(&Subject::Owner(owner.to_string()))? {
            let book = lock(&slot)?;
            if book.prescription.is_archived() {
                continue;
            }
            let candidate = book
                .obligations
                .range(as_of..)
                .map(|(_, o)| o)
                .find(|o| o.is_open());
            if let Some(o) = candidate {
                if next.as_ref().map_or(true, |n| o.scheduled_at < n.scheduled_at) {
                    next = Some(ObligationView::new(&book.prescription, o));
                }
            }
        }
        Ok(next)
    }

    /// Open obligations of active prescriptions scheduled at or before `until`
    pub fn reminder_targets(&self, until: DateTime<Utc>) -> Result<Vec<ReminderTarget>> {
        let mut targets = Vec::new();
        for slot in self.all_slots()? {
            let book = lock(&slot)?;
            if book.prescription.is_archived() {
                continue;
            }
            targets.extend(
                book.obligations
                    .range(..=until)
                    .filter(|(_, o)| o.is_open())
                    .map(|(_, o)| book.target(o)),
            );
        }
        targets.sort_by_key(|t| t.scheduled_at);
        Ok(targets)
    }

    /// Current status of an obligation, if it still exists
    pub fn status(&self, id: ObligationId) -> Result<DoseStatus> {
        let slot = self.slot_of(id)?;
        let book = lock(&slot)?;
        Ok(book.get(id)?.status)
    }

    /// Rewrite `journal` as the minimal set of entries reproducing this ledger
    ///
    /// Every book stays locked while the journal is rewritten.
    pub fn compact_into(&self, journal: &JsonlJournal) -> Result<usize> {
        let mut slots = self.all_slots()?;
        slots.sort_by_key(|s| s.owner.clone());
        let guards = slots.iter().map(|s| lock(s)).collect::<Result<Vec<_>>>()?;

        let mut entries = Vec::with_capacity(guards.len() * 2);
        for book in &guards {
            entries.push(JournalEntry::Registered {
                prescription: book.prescription.clone(),
            });
            if !book.obligations.is_empty() {
                entries.push(JournalEntry::Restored {
                    prescription_id: book.prescription.id,
                    obligations: book.obligations.values().cloned().collect(),
                });
            }
        }
        journal.compact(&entries)?;
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Contacts, DeliveryResult, Frequency};
    use chrono::TimeZone;
    use std::sync::Barrier;
    use std::thread;

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    fn definition(supply: u32, threshold: u32) -> PrescriptionDefinition {
        PrescriptionDefinition {
            owner: "patient-1".into(),
            medication: "Lisinopril".into(),
            dosage: Dosage {
                amount: 1,
                unit: "tablet".into(),
            },
            rule: DosingRule {
                frequency: Frequency::Daily {
                    times: vec![
                        NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                        NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
                    ],
                },
                start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end: None,
            },
            timezone: chrono_tz::Tz::UTC,
            supply,
            low_supply_threshold: threshold,
            contacts: Contacts {
                address: "+15550100".into(),
                channel: Channel::Sms,
                emergency: vec!["+15550199".into()],
                pharmacy: Some("pharmacy@example.com".into()),
            },
            notes: Some("with food".into()),
            side_effects: None,
            storage: None,
        }
    }

    fn setup() -> (DoseLedger, PrescriptionId) {
        let ledger = DoseLedger::in_memory();
        let id = ledger.register(definition(30, 5), utc(1, 7, 0)).unwrap();
        ledger.ensure_generated(id, utc(3, 0, 0)).unwrap();
        (ledger, id)
    }

    fn open_ids(ledger: &DoseLedger, id: PrescriptionId) -> Vec<ObligationId> {
        ledger
            .obligations(&Subject::Prescription(id), utc(1, 0, 0), utc(31, 0, 0))
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect()
    }

    #[test]
    fn test_daily_scenario() {
        let (ledger, id) = setup();
        let doses = ledger
            .obligations(&Subject::Prescription(id), utc(1, 0, 0), utc(3, 0, 0))
            .unwrap();
        let times: Vec<_> = doses.iter().map(|o| o.scheduled_at).collect();
        assert_eq!(
            times,
            vec![utc(1, 8, 0), utc(1, 20, 0), utc(2, 8, 0), utc(2, 20, 0)]
        );

        // Taken at 08:05 on day one
        ledger
            .record_outcome(doses[0].id, Outcome::Taken, utc(1, 8, 5), utc(1, 8, 5))
            .unwrap();

        // 20:00 goes unreported; sweep at 21:05 with 60 minutes grace
        let report = ledger.sweep_overdue(utc(1, 21, 5), Duration::minutes(60));
        assert_eq!(report.missed, vec![doses[1].id]);
        assert_eq!(ledger.status(doses[1].id).unwrap(), DoseStatus::Missed);
        assert_eq!(ledger.status(doses[2].id).unwrap(), DoseStatus::Pending);

        let late = ledger.record_outcome(doses[1].id, Outcome::Taken, utc(1, 21, 10), utc(1, 21, 10));
        assert!(matches!(late, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn test_ensure_generated_is_idempotent() {
        let (ledger, id) = setup();
        assert_eq!(ledger.ensure_generated(id, utc(3, 0, 0)).unwrap(), 0);
        assert_eq!(ledger.ensure_generated(id, utc(2, 0, 0)).unwrap(), 0);
        assert_eq!(ledger.ensure_generated(id, utc(4, 0, 0)).unwrap(), 2);
        assert_eq!(open_ids(&ledger, id).len(), 6);
    }

    #[test]
    fn test_concurrent_generation_never_duplicates() {
        let ledger = Arc::new(DoseLedger::in_memory());
        let id = ledger.register(definition(30, 5), utc(1, 7, 0)).unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ledger.ensure_generated(id, utc(2 + (i % 3), 0, 0)).unwrap()
                })
            })
            .collect();
        let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(created, 6);
        let ids = open_ids(&ledger, id);
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_terminal_states_absorb() {
        let (ledger, id) = setup();
        let ids = open_ids(&ledger, id);

        for (dose, outcome) in ids.iter().zip([Outcome::Taken, Outcome::Missed, Outcome::Skipped]) {
            ledger.record_outcome(*dose, outcome, utc(1, 9, 0), utc(1, 9, 0)).unwrap();

            for again in [Outcome::Taken, Outcome::Missed, Outcome::Skipped] {
                let err = ledger.record_outcome(*dose, again, utc(1, 9, 0), utc(1, 9, 0));
                assert!(matches!(err, Err(Error::InvalidTransition { .. })));
            }
            assert!(matches!(
                ledger.mark_reminded(*dose, utc(1, 9, 0)),
                Err(Error::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_unknown_dose_is_not_found() {
        let (ledger, id) = setup();
        let bogus = ObligationId::derive(id, utc(1, 9, 13));
        let err = ledger.record_outcome(bogus, Outcome::Taken, utc(1, 9, 0), utc(1, 9, 0));
        assert!(matches!(err, Err(Error::NotFound { kind: "dose", .. })));
    }

    #[test]
    fn test_mark_reminded_counts_attempts() {
        let (ledger, id) = setup();
        let dose = open_ids(&ledger, id)[0];
        assert_eq!(ledger.mark_reminded(dose, utc(1, 8, 0)).unwrap(), 1);
        assert_eq!(ledger.mark_reminded(dose, utc(1, 8, 15)).unwrap(), 2);
        assert_eq!(ledger.status(dose).unwrap(), DoseStatus::Reminded);

        // Reminded doses can still be resolved
        ledger
            .record_outcome(dose, Outcome::Taken, utc(1, 8, 20), utc(1, 8, 20))
            .unwrap();
    }

    #[test]
    fn test_attempt_log_requires_dispatch() {
        let (ledger, id) = setup();
        let dose = open_ids(&ledger, id)[0];
        let attempt = ReminderAttempt {
            obligation_id: dose,
            attempt: 1,
            channel: Channel::Sms,
            fired_at: utc(1, 8, 0),
            result: DeliveryResult::Delivered,
        };
        assert!(ledger.log_attempt(attempt.clone()).is_err());

        ledger.mark_reminded(dose, utc(1, 8, 0)).unwrap();
        ledger.log_attempt(attempt.clone()).unwrap();
        // Append-only: the same attempt cannot be logged twice
        assert!(ledger.log_attempt(attempt).is_err());
        assert_eq!(ledger.obligation(dose).unwrap().reminders.len(), 1);
    }

    #[test]
    fn test_racing_outcomes_have_one_winner() {
        for _ in 0..20 {
            let (ledger, id) = setup();
            let ledger = Arc::new(ledger);
            let dose = open_ids(&ledger, id)[0];
            let barrier = Arc::new(Barrier::new(3));

            let handles: Vec<_> = [Outcome::Taken, Outcome::Skipped, Outcome::Missed]
                .into_iter()
                .map(|outcome| {
                    let ledger = Arc::clone(&ledger);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        ledger.record_outcome(dose, outcome, utc(1, 8, 1), utc(1, 8, 1))
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1);
            assert!(results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, Error::InvalidTransition { .. })));
        }
    }

    #[test]
    fn test_remind_racing_outcome_keeps_state_machine() {
        for _ in 0..20 {
            let (ledger, id) = setup();
            let ledger = Arc::new(ledger);
            let dose = open_ids(&ledger, id)[0];
            let barrier = Arc::new(Barrier::new(2));

            let remind = {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ledger.mark_reminded(dose, utc(1, 8, 0))
                })
            };
            let take = {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ledger.record_outcome(dose, Outcome::Taken, utc(1, 8, 0), utc(1, 8, 0))
                })
            };
            let reminded = remind.join().unwrap();
            take.join().unwrap().unwrap();

            let o = ledger.obligation(dose).unwrap();
            assert_eq!(o.status, DoseStatus::Taken);
            match reminded {
                Ok(n) => assert_eq!(o.attempts, n),
                Err(e) => {
                    assert!(matches!(e, Error::InvalidTransition { .. }));
                    assert_eq!(o.attempts, 0);
                }
            }
        }
    }

    #[test]
    fn test_supply_and_refill_once_per_cycle() {
        let ledger = DoseLedger::in_memory();
        let id = ledger.register(definition(4, 2), utc(1, 7, 0)).unwrap();
        ledger.ensure_generated(id, utc(5, 0, 0)).unwrap();
        let ids = open_ids(&ledger, id);

        let refills: Vec<_> = ids
            .iter()
            .take(6)
            .filter_map(|dose| {
                ledger
                    .record_outcome(*dose, Outcome::Taken, utc(1, 9, 0), utc(1, 9, 0))
                    .unwrap()
                    .refill
            })
            .collect();

        assert_eq!(refills.len(), 1);
        assert_eq!(refills[0].remaining, 2);
        assert_eq!(ledger.prescription(id).unwrap().supply, 0);

        assert_eq!(ledger.replenish(id, 10, utc(2, 9, 0)).unwrap(), 10);
        let refill = ledger
            .record_outcome(ids[6], Outcome::Taken, utc(2, 9, 0), utc(2, 9, 0))
            .unwrap()
            .refill;
        assert!(refill.is_none());
    }

    #[test]
    fn test_amendment_is_audited_and_adjusts_supply() {
        let (ledger, id) = setup();
        let dose = open_ids(&ledger, id)[0];

        let amend = ledger.amend_outcome(dose, Outcome::Taken, None, "typo", utc(1, 9, 0));
        assert!(matches!(amend, Err(Error::InvalidTransition { .. })));

        ledger
            .record_outcome(dose, Outcome::Taken, utc(1, 8, 5), utc(1, 8, 5))
            .unwrap();
        assert_eq!(ledger.prescription(id).unwrap().supply, 29);

        let res = ledger
            .amend_outcome(dose, Outcome::Skipped, None, "tapped the wrong button", utc(1, 9, 0))
            .unwrap();
        assert_eq!(res.obligation.status, DoseStatus::Skipped);
        assert_eq!(res.obligation.amendments.len(), 1);
        assert_eq!(res.obligation.amendments[0].from, DoseStatus::Taken);
        assert_eq!(ledger.prescription(id).unwrap().supply, 30);

        let same = ledger.amend_outcome(dose, Outcome::Skipped, None, "again", utc(1, 9, 0));
        assert!(matches!(same, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn test_amendment_restores_only_what_was_deducted() {
        let ledger = DoseLedger::in_memory();
        let mut def = definition(1, 0);
        def.dosage.amount = 2;
        let id = ledger.register(def, utc(1, 7, 0)).unwrap();
        ledger.ensure_generated(id, utc(2, 0, 0)).unwrap();
        let dose = open_ids(&ledger, id)[0];

        let res = ledger
            .record_outcome(dose, Outcome::Taken, utc(1, 8, 5), utc(1, 8, 5))
            .unwrap();
        assert_eq!(res.obligation.consumed, 1);
        assert_eq!(ledger.prescription(id).unwrap().supply, 0);

        ledger
            .amend_outcome(dose, Outcome::Skipped, None, "spat it out", utc(1, 9, 0))
            .unwrap();
        assert_eq!(ledger.prescription(id).unwrap().supply, 1);
        assert_eq!(ledger.obligation(dose).unwrap().consumed, 0);

        // And back again: the clamp applies once more
        let res = ledger
            .amend_outcome(dose, Outcome::Taken, Some(utc(1, 8, 5)), "took it after all", utc(1, 9, 30))
            .unwrap();
        assert_eq!(res.obligation.consumed, 1);
        assert_eq!(ledger.prescription(id).unwrap().supply, 0);
    }

    #[test]
    fn test_rule_edit_does_not_touch_generated_doses() {
        let (ledger, id) = setup();
        let before: Vec<_> = ledger
            .obligations(&Subject::Prescription(id), utc(1, 0, 0), utc(3, 0, 0))
            .unwrap()
            .into_iter()
            .map(|o| o.scheduled_at)
            .collect();

        let rule = DosingRule {
            frequency: Frequency::Daily {
                times: vec![NaiveTime::from_hms_opt(12, 0, 0).unwrap()],
            },
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: None,
        };
        // Asking for an edit from day one still only applies after the horizon
        let effective = ledger.edit_rule(id, rule, utc(1, 0, 0)).unwrap();
        assert_eq!(effective, utc(3, 0, 0));

        ledger.ensure_generated(id, utc(5, 0, 0)).unwrap();
        let after: Vec<_> = ledger
            .obligations(&Subject::Prescription(id), utc(1, 0, 0), utc(5, 0, 0))
            .unwrap()
            .into_iter()
            .map(|o| o.scheduled_at)
            .collect();

        assert_eq!(&after[..4], &before[..]);
        assert_eq!(&after[4..], &[utc(3, 12, 0), utc(4, 12, 0)]);
    }

    #[test]
    fn test_invalid_registration_and_edit() {
        let ledger = DoseLedger::in_memory();
        let mut bad = definition(10, 2);
        bad.rule.frequency = Frequency::Daily { times: vec![] };
        assert!(matches!(
            ledger.register(bad, utc(1, 7, 0)),
            Err(Error::InvalidRule(_))
        ));

        let id = ledger.register(definition(10, 2), utc(1, 7, 0)).unwrap();
        let backwards = DosingRule {
            frequency: Frequency::Interval {
                every_minutes: -5,
                anchor: NaiveTime::MIN,
            },
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: None,
        };
        assert!(matches!(
            ledger.edit_rule(id, backwards, utc(1, 7, 0)),
            Err(Error::InvalidRule(_))
        ));

        let mut endless = definition(10, 2);
        endless.rule.frequency = Frequency::Interval {
            every_minutes: 1_000_000_000_000,
            anchor: NaiveTime::MIN,
        };
        assert!(matches!(
            ledger.register(endless, utc(1, 7, 0)),
            Err(Error::InvalidRule(_))
        ));
        // Nothing was journaled and the ledger is still usable
        assert_eq!(ledger.prescriptions().unwrap().len(), 1);
        assert!(ledger.ensure_generated_all(utc(3, 0, 0)).unwrap() > 0);
    }

    #[test]
    fn test_archive_keeps_history_and_stops_generation() {
        let (ledger, id) = setup();
        let ids = open_ids(&ledger, id);
        ledger
            .record_outcome(ids[0], Outcome::Taken, utc(1, 8, 0), utc(1, 8, 0))
            .unwrap();

        ledger.archive(id, utc(1, 12, 0)).unwrap();
        let remaining = open_ids(&ledger, id);
        assert_eq!(remaining, vec![ids[0]]);
        assert_eq!(ledger.ensure_generated(id, utc(10, 0, 0)).unwrap(), 0);
        assert!(ledger.due(&Subject::Prescription(id), utc(9, 0, 0)).unwrap().is_empty());
        assert!(matches!(ledger.obligation(ids[1]), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_due_and_next() {
        let (ledger, id) = setup();
        let due = ledger
            .due(&Subject::Owner("patient-1".into()), utc(1, 20, 0))
            .unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].prescription_id, id);

        let next = ledger.next_due("patient-1", utc(1, 9, 0)).unwrap().unwrap();
        assert_eq!(next.scheduled_at, utc(1, 20, 0));

        let day = ledger
            .day_views("patient-1", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
            .unwrap();
        assert_eq!(day.len(), 2);
        assert!(ledger.due(&Subject::Owner("nobody".into()), utc(2, 0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_tolerates_clock_going_backwards() {
        let (ledger, _) = setup();
        let first = ledger.sweep_overdue(utc(2, 10, 0), Duration::minutes(60));
        assert_eq!(first.missed.len(), 3);
        let second = ledger.sweep_overdue(utc(1, 0, 0), Duration::minutes(60));
        assert!(second.missed.is_empty());
        assert_eq!(second.errors, 0);
    }

    #[test]
    fn test_journal_replay_restores_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ledger.jsonl");

        let (id, dose) = {
            let ledger = DoseLedger::open(&path).unwrap();
            let id = ledger.register(definition(10, 2), utc(1, 7, 0)).unwrap();
            ledger.ensure_generated(id, utc(3, 0, 0)).unwrap();
            let dose = open_ids(&ledger, id)[0];
            ledger.mark_reminded(dose, utc(1, 8, 0)).unwrap();
            ledger
                .record_outcome(dose, Outcome::Taken, utc(1, 8, 5), utc(1, 8, 5))
                .unwrap();
            ledger.sweep_overdue(utc(2, 10, 0), Duration::minutes(60));
            (id, dose)
        };

        let ledger = DoseLedger::open(&path).unwrap();
        let o = ledger.obligation(dose).unwrap();
        assert_eq!(o.status, DoseStatus::Taken);
        assert_eq!(o.attempts, 1);
        assert_eq!(ledger.prescription(id).unwrap().supply, 9);
        assert_eq!(open_ids(&ledger, id).len(), 4);
        // Regeneration after replay creates nothing new
        assert_eq!(ledger.ensure_generated(id, utc(3, 0, 0)).unwrap(), 0);

        let missed = ledger
            .obligations(&Subject::Prescription(id), utc(1, 0, 0), utc(3, 0, 0))
            .unwrap()
            .into_iter()
            .filter(|o| o.status == DoseStatus::Missed)
            .count();
        assert_eq!(missed, 2);
    }

    #[test]
    fn test_compaction_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ledger.jsonl");
        let ledger = DoseLedger::open(&path).unwrap();
        let id = ledger.register(definition(10, 2), utc(1, 7, 0)).unwrap();
        ledger.ensure_generated(id, utc(3, 0, 0)).unwrap();
        let dose = open_ids(&ledger, id)[0];
        ledger
            .record_outcome(dose, Outcome::Skipped, utc(1, 8, 5), utc(1, 8, 5))
            .unwrap();

        let written = ledger.compact_into(&JsonlJournal::new(&path)).unwrap();
        assert_eq!(written, 2);

        let reopened = DoseLedger::open(&path).unwrap();
        assert_eq!(reopened.status(dose).unwrap(), DoseStatus::Skipped);
        assert_eq!(open_ids(&reopened, id).len(), 4);
    }

    #[test]
    fn test_shared_ledger_follows_other_writers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ledger.jsonl");
        let follower = DoseLedger::open_shared(&path).unwrap();

        let (id, dose) = {
            let writer = DoseLedger::open(&path).unwrap();
            let id = writer.register(definition(10, 2), utc(1, 7, 0)).unwrap();
            writer.ensure_generated(id, utc(3, 0, 0)).unwrap();
            (id, open_ids(&writer, id)[0])
        };

        {
            let _sync = follower.sync().unwrap();
            assert_eq!(open_ids(&follower, id).len(), 4);
            assert_eq!(follower.mark_reminded(dose, utc(1, 8, 0)).unwrap(), 1);
        }

        {
            let writer = DoseLedger::open(&path).unwrap();
            assert_eq!(writer.obligation(dose).unwrap().attempts, 1);
            writer
                .record_outcome(dose, Outcome::Taken, utc(1, 8, 5), utc(1, 8, 5))
                .unwrap();
        }

        let _sync = follower.sync().unwrap();
        let o = follower.obligation(dose).unwrap();
        assert_eq!(o.status, DoseStatus::Taken);
        // Its own reminder was not applied a second time
        assert_eq!(o.attempts, 1);
        assert_eq!(follower.prescription(id).unwrap().supply, 9);
        assert!(matches!(
            follower.mark_reminded(dose, utc(1, 8, 15)),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_shared_ledger_reloads_after_compaction() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ledger.jsonl");
        let writer = DoseLedger::open(&path).unwrap();
        let id = writer.register(definition(10, 2), utc(1, 7, 0)).unwrap();
        writer.ensure_generated(id, utc(3, 0, 0)).unwrap();
        let dose = open_ids(&writer, id)[0];

        let follower = DoseLedger::open_shared(&path).unwrap();
        assert_eq!(follower.status(dose).unwrap(), DoseStatus::Pending);

        writer
            .record_outcome(dose, Outcome::Skipped, utc(1, 8, 5), utc(1, 8, 5))
            .unwrap();
        writer.compact_into(&JsonlJournal::new(&path)).unwrap();

        let _sync = follower.sync().unwrap();
        assert_eq!(follower.status(dose).unwrap(), DoseStatus::Skipped);
        assert_eq!(open_ids(&follower, id).len(), 4);
    }
}
