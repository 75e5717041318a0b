//! Reminder scheduler.
//!
//! Every open dose the scheduler knows about carries a small state machine
//! ([`ReminderState`]) and at most one entry in a timer queue ordered by
//! fire time. A tick adopts newly due doses, pops expired timers, and
//! dispatches deliveries in parallel without holding any lock. Before each
//! fire the ledger re-checks the dose's status (`mark_reminded` fails on a
//! terminal dose), which is what cancels the remaining offsets once an
//! outcome has been reported. Ledger work happens inside
//! [`DoseLedger::sync`], so outcomes recorded by other processes are seen
//! before each fire; deliveries run outside it.
//!
//! Attempt slots index the configured offsets. They usually match the
//! ledger's attempt count, but a dose adopted late (after a restart) skips
//! the slots whose successors are already due.

use crate::config::ReminderPolicy;
use crate::ledger::{DoseLedger, ReminderTarget};
use crate::notify::{escalation_message, refill_message, reminder_message, Notifier};
use crate::{
    Channel, DeliveryResult, Error, Escalation, Message, Notice, ObligationId, ReminderAttempt,
    Result,
};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;

/// Where a tracked dose is in its reminder lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReminderState {
    /// Waiting for the timer of offset slot `next_attempt`
    Armed { next_attempt: u32 },
    /// A delivery for slot `attempt` is running
    InFlight { attempt: u32 },
    /// Attempts used up; waiting for the escalation timer
    Exhausted,
}

#[derive(Clone, Copy, Debug)]
struct Tracked {
    state: ReminderState,
    scheduled_at: DateTime<Utc>,
}

/// What a popped timer asks for
#[derive(Debug)]
enum Action {
    Remind { obligation: ObligationId, slot: u32 },
    Escalate { obligation: ObligationId },
}

#[derive(Default)]
struct Timers {
    queue: BinaryHeap<Reverse<(DateTime<Utc>, ObligationId)>>,
    tracked: HashMap<ObligationId, Tracked>,
    /// Escalated but not yet resolved by the sweep
    escalated: HashSet<ObligationId>,
}

impl Timers {
    /// Start tracking open doses that have no state machine yet
    fn adopt(
        &mut self,
        targets: &HashMap<ObligationId, ReminderTarget>,
        policy: &ReminderPolicy,
        now: DateTime<Utc>,
    ) -> usize {
        self.escalated.retain(|id| targets.contains_key(id));

        let mut adopted = 0;
        for target in targets.values() {
            let id = target.obligation_id;
            if self.tracked.contains_key(&id) || self.escalated.contains(&id) {
                continue;
            }
            let mut next_attempt = target.attempts + 1;
            while policy
                .fire_at(target.scheduled_at, next_attempt + 1)
                .is_some_and(|at| at <= now)
            {
                next_attempt += 1;
            }
            let (state, fire_at) = match policy.fire_at(target.scheduled_at, next_attempt) {
                Some(at) => (ReminderState::Armed { next_attempt }, at),
                None => (
                    ReminderState::Exhausted,
                    escalation_time(policy, target.scheduled_at, target.attempts, now),
                ),
            };
            self.tracked.insert(
                id,
                Tracked {
                    state,
                    scheduled_at: target.scheduled_at,
                },
            );
            self.queue.push(Reverse((fire_at, id)));
            adopted += 1;
        }
        adopted
    }

    /// Pop every expired timer and move its dose to the next state
    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Some(Reverse((fire_at, id))) = self.queue.peek().copied() {
            if fire_at > now {
                break;
            }
            self.queue.pop();
            let Some(tracked) = self.tracked.get_mut(&id) else {
                continue;
            };
            match tracked.state {
                ReminderState::Armed { next_attempt } => {
                    tracked.state = ReminderState::InFlight {
                        attempt: next_attempt,
                    };
                    actions.push(Action::Remind {
                        obligation: id,
                        slot: next_attempt,
                    });
                }
                ReminderState::Exhausted => {
                    self.tracked.remove(&id);
                    self.escalated.insert(id);
                    actions.push(Action::Escalate { obligation: id });
                }
                // Stale timer; a delivery is already running
                ReminderState::InFlight { .. } => {}
            }
        }
        actions
    }

    /// Arm the slot after `slot`, or the escalation timer once slots run out
    fn advance(
        &mut self,
        id: ObligationId,
        slot: u32,
        policy: &ReminderPolicy,
        now: DateTime<Utc>,
    ) {
        let Some(tracked) = self.tracked.get_mut(&id) else {
            return;
        };
        let next_attempt = slot + 1;
        let fire_at = match policy.fire_at(tracked.scheduled_at, next_attempt) {
            Some(at) => {
                tracked.state = ReminderState::Armed { next_attempt };
                at
            }
            None => {
                tracked.state = ReminderState::Exhausted;
                escalation_time(policy, tracked.scheduled_at, slot, now)
            }
        };
        self.queue.push(Reverse((fire_at, id)));
    }

    fn forget(&mut self, id: ObligationId) {
        self.tracked.remove(&id);
    }
}

fn escalation_time(
    policy: &ReminderPolicy,
    scheduled_at: DateTime<Utc>,
    last_slot: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match policy.fire_at(scheduled_at, last_slot) {
        Some(last) => last + policy.escalate_after,
        None => now + policy.escalate_after,
    }
}

/// A finished delivery, recorded once the ledger is synced again
struct Delivery {
    obligation: ObligationId,
    slot: u32,
    /// Attempt number handed out by the ledger
    attempt: u32,
    channel: Channel,
    result: DeliveryResult,
}

/// Counts from one scheduler tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub adopted: usize,
    pub dispatched: usize,
    pub delivered: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub escalated: usize,
    pub published: usize,
    pub errors: usize,
}

/// Timer-driven reminder delivery with retry and escalation
pub struct ReminderScheduler {
    ledger: Arc<DoseLedger>,
    notifier: Arc<Notifier>,
    policy: ReminderPolicy,
    timers: Mutex<Timers>,
}

impl ReminderScheduler {
    pub fn new(ledger: Arc<DoseLedger>, notifier: Arc<Notifier>, policy: ReminderPolicy) -> Self {
        Self {
            ledger,
            notifier,
            policy,
            timers: Mutex::new(Timers::default()),
        }
    }

    fn timers(&self) -> Result<MutexGuard<'_, Timers>> {
        self.timers.lock().map_err(|_| Error::LockPoisoned)
    }

    /// State of a dose's reminder machine, if the scheduler is tracking it
    pub fn state(&self, id: ObligationId) -> Option<ReminderState> {
        self.timers
            .lock()
            .ok()
            .and_then(|t| t.tracked.get(&id).map(|tracked| tracked.state))
    }

    /// Run one scheduling pass at `now`
    ///
    /// Deliveries started here finish before the tick returns. Delivery
    /// failures never surface as errors; they are logged as attempts.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut deliveries = JoinSet::new();
        let mut dispatched = Vec::new();

        {
            let _sync = self.ledger.sync()?;
            let targets: HashMap<_, _> = self
                .ledger
                .reminder_targets(now)?
                .into_iter()
                .map(|t| (t.obligation_id, t))
                .collect();

            let actions = {
                let mut timers = self.timers()?;
                report.adopted = timers.adopt(&targets, &self.policy, now);
                timers.pop_due(now)
            };

            for action in actions {
                match action {
                    Action::Remind { obligation, slot } => {
                        let Some(target) = targets.get(&obligation) else {
                            self.timers()?.forget(obligation);
                            report.cancelled += 1;
                            continue;
                        };
                        let attempt = match self.ledger.mark_reminded(obligation, now) {
                            Ok(n) => n,
                            Err(Error::InvalidTransition { .. }) | Err(Error::NotFound { .. }) => {
                                tracing::debug!("Reminder for {} cancelled", obligation);
                                self.timers()?.forget(obligation);
                                report.cancelled += 1;
                                continue;
                            }
                            Err(e) => {
                                tracing::warn!("Could not mark {} reminded: {}", obligation, e);
                                self.timers()?.forget(obligation);
                                report.errors += 1;
                                continue;
                            }
                        };

                        let message = reminder_message(
                            &target.medication,
                            &target.dosage,
                            &target.local_time,
                            attempt,
                        );
                        let notifier = Arc::clone(&self.notifier);
                        let recipient = target.recipient.clone();
                        let channel = target.channel;
                        deliveries.spawn(async move {
                            let result = match notifier.send(&recipient, &message, channel).await {
                                Ok(()) => DeliveryResult::Delivered,
                                Err(Error::DeliveryFailure { result, .. }) => result,
                                Err(_) => DeliveryResult::Failed,
                            };
                            Delivery {
                                obligation,
                                slot,
                                attempt,
                                channel,
                                result,
                            }
                        });
                        dispatched.push(obligation);
                        report.dispatched += 1;
                    }
                    Action::Escalate { obligation } => {
                        if self.escalate(obligation) {
                            report.escalated += 1;
                        }
                    }
                }
            }
        }

        let mut finished = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(delivery) => finished.push(delivery),
                Err(e) => {
                    tracing::warn!("Reminder delivery task failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        if !finished.is_empty() {
            let _sync = self.ledger.sync()?;
            for delivery in finished {
                dispatched.retain(|id| *id != delivery.obligation);
                self.complete(delivery, now, &mut report)?;
            }
        }

        // Deliveries that never reported back get re-adopted next tick
        if !dispatched.is_empty() {
            let mut timers = self.timers()?;
            for id in dispatched {
                timers.forget(id);
            }
        }

        report.published = self.publish().await;
        Ok(report)
    }

    fn complete(
        &self,
        delivery: Delivery,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let Delivery {
            obligation,
            slot,
            attempt,
            channel,
            result,
        } = delivery;
        match result {
            DeliveryResult::Delivered => report.delivered += 1,
            _ => {
                tracing::warn!(
                    "Reminder {} for {} not delivered: {:?}",
                    attempt,
                    obligation,
                    result
                );
                report.failed += 1;
            }
        }

        let logged = self.ledger.log_attempt(ReminderAttempt {
            obligation_id: obligation,
            attempt,
            channel,
            fired_at: now,
            result,
        });
        if let Err(e) = logged {
            tracing::warn!("Could not log reminder attempt for {}: {}", obligation, e);
            report.errors += 1;
        }

        let open = self
            .ledger
            .status(obligation)
            .map(|s| !s.is_terminal())
            .unwrap_or(false);
        let mut timers = self.timers()?;
        if open {
            timers.advance(obligation, slot, &self.policy, now);
        } else {
            timers.forget(obligation);
        }
        Ok(())
    }

    /// Queue an escalation if the dose is still unresolved
    fn escalate(&self, obligation: ObligationId) -> bool {
        let (prescription, dose) = match self.ledger.context(obligation) {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("Escalation for {} dropped: {}", obligation, e);
                return false;
            }
        };
        if !dose.is_open() {
            return false;
        }
        tracing::info!(
            "Escalating {} for {} after {} reminders",
            prescription.medication,
            prescription.owner,
            dose.attempts
        );
        self.notifier.enqueue(Notice::Escalation(Escalation {
            obligation_id: dose.id,
            prescription_id: prescription.id,
            owner: prescription.owner,
            medication: prescription.medication,
            scheduled_at: dose.scheduled_at,
            attempts: dose.attempts,
        }));
        true
    }

    /// Who receives a notice, on which channel, with what text
    fn route(&self, notice: &Notice) -> Option<(Vec<String>, Channel, Message)> {
        match notice {
            Notice::RefillNeeded(refill) => {
                let prescription = self.ledger.prescription(refill.prescription_id).ok()?;
                let mut recipients = vec![prescription.contacts.address.clone()];
                recipients.extend(prescription.contacts.pharmacy.clone());
                Some((recipients, prescription.contacts.channel, refill_message(refill)))
            }
            Notice::Escalation(escalation) => {
                let prescription = self.ledger.prescription(escalation.prescription_id).ok()?;
                let recipients = if prescription.contacts.emergency.is_empty() {
                    self.policy.escalation_contacts.clone()
                } else {
                    prescription.contacts.emergency.clone()
                };
                Some((
                    recipients,
                    self.policy.escalation_channel,
                    escalation_message(escalation),
                ))
            }
        }
    }

    /// Deliver queued notices; ones nobody received go back in the outbox
    pub async fn publish(&self) -> usize {
        let mut published = 0;
        let mut undelivered = Vec::new();

        for notice in self.notifier.drain() {
            let Some((recipients, channel, message)) = self.route(&notice) else {
                tracing::warn!("No route for notice {:?}, dropping", notice);
                continue;
            };
            if recipients.is_empty() {
                tracing::warn!("No recipients for notice {:?}, dropping", notice);
                continue;
            }

            let mut reached = 0;
            for recipient in &recipients {
                match self.notifier.send(recipient, &message, channel).await {
                    Ok(()) => reached += 1,
                    Err(e) => tracing::warn!("Notice not delivered: {}", e),
                }
            }
            if reached > 0 {
                published += 1;
            } else {
                undelivered.push(notice);
            }
        }

        if !undelivered.is_empty() {
            self.notifier.requeue(undelivered);
        }
        published
    }
}
