//! The adherence engine: the surface the UI/CRUD layer talks to.
//!
//! Wires the ledger, clock, notifier and reminder scheduler together.
//! Every call reads "now" from the injected clock; query calls first bring
//! the ledger up to date (generation horizon and overdue sweep) so results
//! never lag behind wall-clock time. Each public call runs inside
//! [`DoseLedger::sync`], so an engine on a shared journal sees what other
//! processes recorded.

use crate::adherence::{self, AdherenceRecord, AdherenceWindow};
use crate::clock::Clock;
use crate::ledger::{DoseLedger, SweepReport};
use crate::notify::{DeliveryChannel, Notifier};
use crate::scheduler::{ReminderScheduler, TickReport};
use crate::{
    Config, DoseObligation, DosingRule, Notice, ObligationId, ObligationView, Outcome,
    Prescription, PrescriptionDefinition, PrescriptionId, Result, Subject,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::future::Future;
use std::sync::Arc;

/// What a maintenance pass did
#[derive(Clone, Debug, Default)]
pub struct Maintenance {
    pub generated: usize,
    pub sweep: SweepReport,
}

pub struct AdherenceEngine {
    ledger: Arc<DoseLedger>,
    clock: Arc<dyn Clock>,
    notifier: Arc<Notifier>,
    scheduler: Arc<ReminderScheduler>,
    config: Config,
}

impl AdherenceEngine {
    pub fn new(
        ledger: Arc<DoseLedger>,
        clock: Arc<dyn Clock>,
        channel: Arc<dyn DeliveryChannel>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.reminder_policy();
        let notifier = Arc::new(Notifier::new(
            channel,
            policy.delivery_timeout,
            policy.transport_retries,
        ));
        let scheduler = Arc::new(ReminderScheduler::new(
            Arc::clone(&ledger),
            Arc::clone(&notifier),
            policy,
        ));
        Ok(Self {
            ledger,
            clock,
            notifier,
            scheduler,
            config,
        })
    }

    /// Open the journal under the configured data directory
    pub fn open(
        config: Config,
        clock: Arc<dyn Clock>,
        channel: Arc<dyn DeliveryChannel>,
    ) -> Result<Self> {
        let ledger = Arc::new(DoseLedger::open(&config.journal_path())?);
        Self::new(ledger, clock, channel, config)
    }

    /// Follow a journal that other processes write to (the reminder loop)
    pub fn open_shared(
        config: Config,
        clock: Arc<dyn Clock>,
        channel: Arc<dyn DeliveryChannel>,
    ) -> Result<Self> {
        let ledger = Arc::new(DoseLedger::open_shared(&config.journal_path())?);
        Self::new(ledger, clock, channel, config)
    }

    pub fn ledger(&self) -> &Arc<DoseLedger> {
        &self.ledger
    }

    pub fn scheduler(&self) -> &Arc<ReminderScheduler> {
        &self.scheduler
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Materialize obligations up to now + the configured horizon
    pub fn extend_horizon(&self) -> Result<usize> {
        let _sync = self.ledger.sync()?;
        self.generate()
    }

    /// Extend generation to the horizon and sweep overdue doses
    pub fn maintain(&self) -> Result<Maintenance> {
        let _sync = self.ledger.sync()?;
        self.refresh()
    }

    fn generate(&self) -> Result<usize> {
        let up_to = self.now() + self.config.horizon();
        self.ledger.ensure_generated_all(up_to)
    }

    fn refresh(&self) -> Result<Maintenance> {
        let generated = self.generate()?;
        let sweep = self.ledger.sweep_overdue(self.now(), self.config.grace());
        Ok(Maintenance { generated, sweep })
    }

    pub fn register_prescription(
        &self,
        definition: PrescriptionDefinition,
    ) -> Result<PrescriptionId> {
        let _sync = self.ledger.sync()?;
        let now = self.now();
        let id = self.ledger.register(definition, now)?;
        self.ledger.ensure_generated(id, now + self.config.horizon())?;
        Ok(id)
    }

    pub fn edit_rule(
        &self,
        id: PrescriptionId,
        rule: DosingRule,
        effective_from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let _sync = self.ledger.sync()?;
        let effective = self.ledger.edit_rule(id, rule, effective_from)?;
        self.ledger
            .ensure_generated(id, self.now() + self.config.horizon())?;
        Ok(effective)
    }

    pub fn replenish(&self, id: PrescriptionId, quantity: u32) -> Result<u32> {
        let _sync = self.ledger.sync()?;
        self.ledger.replenish(id, quantity, self.now())
    }

    pub fn archive(&self, id: PrescriptionId) -> Result<()> {
        let _sync = self.ledger.sync()?;
        self.ledger.archive(id, self.now())
    }

    pub fn prescription(&self, id: PrescriptionId) -> Result<Prescription> {
        let _sync = self.ledger.sync()?;
        self.ledger.prescription(id)
    }

    pub fn prescriptions(&self) -> Result<Vec<Prescription>> {
        let _sync = self.ledger.sync()?;
        self.ledger.prescriptions()
    }

    /// Open doses scheduled at or before `as_of`
    pub fn get_due_obligations(
        &self,
        subject: &Subject,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<ObligationView>> {
        let _sync = self.ledger.sync()?;
        self.refresh()?;
        self.ledger.due(subject, as_of)
    }

    /// Record what happened to a dose
    ///
    /// `actual_time` defaults to now. A dose past its grace window is swept
    /// to Missed first, so reporting it fails. A refill notice raised by a
    /// Taken dose is queued for the scheduler to publish; this call never
    /// waits on delivery.
    pub fn report_outcome(
        &self,
        id: ObligationId,
        outcome: Outcome,
        actual_time: Option<DateTime<Utc>>,
    ) -> Result<DoseObligation> {
        let _sync = self.ledger.sync()?;
        let now = self.now();
        let prescription = self.ledger.obligation(id)?.prescription_id;
        self.ledger
            .sweep_prescription(prescription, now, self.config.grace());
        let resolution = self
            .ledger
            .record_outcome(id, outcome, actual_time.unwrap_or(now), now)?;
        if let Some(refill) = resolution.refill {
            self.notifier.enqueue(Notice::RefillNeeded(refill));
        }
        Ok(resolution.obligation)
    }

    /// Correct an already resolved dose, keeping an audit record
    pub fn amend_outcome(
        &self,
        id: ObligationId,
        outcome: Outcome,
        actual_time: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<DoseObligation> {
        let _sync = self.ledger.sync()?;
        let now = self.now();
        let actual_time = match outcome {
            Outcome::Taken => Some(actual_time.unwrap_or(now)),
            Outcome::Missed | Outcome::Skipped => actual_time,
        };
        let resolution = self
            .ledger
            .amend_outcome(id, outcome, actual_time, reason, now)?;
        if let Some(refill) = resolution.refill {
            self.notifier.enqueue(Notice::RefillNeeded(refill));
        }
        Ok(resolution.obligation)
    }

    /// Adherence over `window`; overdue doses are swept first
    pub fn get_adherence(
        &self,
        subject: &Subject,
        window: &AdherenceWindow,
    ) -> Result<AdherenceRecord> {
        let _sync = self.ledger.sync()?;
        let now = self.now();
        let grace = self.config.grace();
        match subject {
            Subject::Prescription(id) => {
                self.ledger.sweep_prescription(*id, now, grace);
            }
            Subject::Owner(_) => {
                self.ledger.sweep_overdue(now, grace);
            }
        }
        let obligations = self.ledger.obligations(subject, window.start, window.end)?;
        Ok(adherence::calculate(
            &obligations,
            window,
            self.config.on_time(),
        ))
    }

    /// Everything scheduled for `owner` on a local calendar day
    pub fn schedule(&self, owner: &str, date: NaiveDate) -> Result<Vec<ObligationView>> {
        let _sync = self.ledger.sync()?;
        self.refresh()?;
        self.ledger.day_views(owner, date)
    }

    pub fn next_due(&self, owner: &str) -> Result<Option<ObligationView>> {
        let _sync = self.ledger.sync()?;
        self.refresh()?;
        self.ledger.next_due(owner, self.now())
    }

    /// Dose history in `[from, to)`
    pub fn history(
        &self,
        subject: &Subject,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DoseObligation>> {
        let _sync = self.ledger.sync()?;
        self.refresh()?;
        self.ledger.obligations(subject, from, to)
    }

    /// Maintenance followed by one scheduler pass
    pub async fn tick(&self) -> Result<TickReport> {
        self.maintain()?;
        self.scheduler.tick(self.now()).await
    }

    /// Publish queued refill/escalation notices now
    pub async fn flush_notices(&self) -> usize {
        self.scheduler.publish().await
    }

    /// Tick on the configured period until `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let period = std::time::Duration::from_secs(self.config.reminders.tick_seconds);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!("Reminder loop started (every {:?})", period);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Reminder loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) if report != TickReport::default() => {
                            tracing::info!("Tick: {:?}", report);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Tick failed: {}", e),
                    }
                }
            }
        }

        let flushed = self.flush_notices().await;
        if flushed > 0 {
            tracing::info!("Published {} notices on shutdown", flushed);
        }
        Ok(())
    }
}
