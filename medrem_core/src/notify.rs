//! Outbound notifications: delivery channels, retries, and the notice outbox.
//!
//! The engine never talks to a transport directly. Reminders go through a
//! [`Notifier`], which bounds every delivery with a timeout and retries
//! transport failures a fixed number of times. Refill and escalation notices
//! are queued in an outbox and published by the scheduler, so callers that
//! record outcomes never wait on delivery.

use crate::{Channel, DeliveryResult, Error, Escalation, Message, Notice, RefillNeeded, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A transport capable of delivering a message to a recipient
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, recipient: &str, message: &Message, channel: Channel)
        -> DeliveryResult;
}

/// Channel that only writes deliveries to the log
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    async fn deliver(
        &self,
        recipient: &str,
        message: &Message,
        channel: Channel,
    ) -> DeliveryResult {
        tracing::info!(
            "[{}] to {}: {} | {}",
            channel,
            recipient,
            message.subject,
            message.body
        );
        DeliveryResult::Delivered
    }
}

/// One message handed to a [`MemoryChannel`]
#[cfg(test)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sent {
    pub recipient: String,
    pub channel: Channel,
    pub message: Message,
}

/// In-memory channel that records deliveries
///
/// Results can be scripted; once the script runs out every delivery
/// succeeds. An optional delay makes in-flight deliveries observable.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryChannel {
    sent: Mutex<Vec<Sent>>,
    script: Mutex<VecDeque<DeliveryResult>>,
    delay: Option<Duration>,
}

#[cfg(test)]
impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queue results returned by the next deliveries, in order
    pub fn script(&self, results: impl IntoIterator<Item = DeliveryResult>) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(results);
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl DeliveryChannel for MemoryChannel {
    async fn deliver(
        &self,
        recipient: &str,
        message: &Message,
        channel: Channel,
    ) -> DeliveryResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or(DeliveryResult::Delivered);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Sent {
                recipient: recipient.to_string(),
                channel,
                message: message.clone(),
            });
        }
        result
    }
}

/// Timeout and retry wrapper around a delivery channel, plus the notice outbox
pub struct Notifier {
    channel: Arc<dyn DeliveryChannel>,
    timeout: Duration,
    retries: u32,
    outbox: Mutex<VecDeque<Notice>>,
}

impl Notifier {
    pub fn new(channel: Arc<dyn DeliveryChannel>, timeout: Duration, retries: u32) -> Self {
        Self {
            channel,
            timeout,
            retries,
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Deliver with timeout, retrying transport failures
    ///
    /// Returns `DeliveryFailure` carrying the last result once retries are
    /// exhausted.
    pub async fn send(&self, recipient: &str, message: &Message, channel: Channel) -> Result<()> {
        let mut last = DeliveryResult::Failed;
        for try_no in 0..=self.retries {
            last = match tokio::time::timeout(
                self.timeout,
                self.channel.deliver(recipient, message, channel),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => DeliveryResult::TimedOut,
            };
            if last == DeliveryResult::Delivered {
                return Ok(());
            }
            tracing::debug!(
                "Delivery to {} failed ({:?}), try {} of {}",
                recipient,
                last,
                try_no + 1,
                self.retries + 1
            );
        }
        Err(Error::DeliveryFailure {
            recipient: recipient.to_string(),
            result: last,
        })
    }

    /// Queue a notice for the next publish pass
    pub fn enqueue(&self, notice: Notice) {
        match self.outbox.lock() {
            Ok(mut outbox) => outbox.push_back(notice),
            Err(_) => tracing::warn!("Outbox lock poisoned, dropping notice {:?}", notice),
        }
    }

    /// Take every queued notice
    pub fn drain(&self) -> Vec<Notice> {
        self.outbox
            .lock()
            .map(|mut outbox| outbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// Put notices that could not be published back at the front
    pub fn requeue(&self, notices: Vec<Notice>) {
        if let Ok(mut outbox) = self.outbox.lock() {
            for notice in notices.into_iter().rev() {
                outbox.push_front(notice);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.outbox.lock().map(|o| o.len()).unwrap_or(0)
    }
}

/// Reminder text for attempt `attempt` of a dose
pub fn reminder_message(
    medication: &str,
    dosage: &crate::Dosage,
    local_time: &str,
    attempt: u32,
) -> Message {
    let subject = if attempt <= 1 {
        format!("Time for {}", medication)
    } else {
        format!("Reminder {}: {} is due", attempt, medication)
    };
    Message {
        subject,
        body: format!("Take {} of {} (scheduled {})", dosage, medication, local_time),
    }
}

pub fn refill_message(notice: &RefillNeeded) -> Message {
    Message {
        subject: format!("Refill needed: {}", notice.medication),
        body: format!(
            "{} doses of {} left (threshold {})",
            notice.remaining, notice.medication, notice.threshold
        ),
    }
}

pub fn escalation_message(notice: &Escalation) -> Message {
    Message {
        subject: format!("Missed medication: {}", notice.owner),
        body: format!(
            "{} has not confirmed {} scheduled {} after {} reminders",
            notice.owner,
            notice.medication,
            notice.scheduled_at.format("%Y-%m-%d %H:%M UTC"),
            notice.attempts
        ),
    }
}
