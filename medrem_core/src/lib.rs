#![forbid(unsafe_code)]

//! Core of the Medrem medication schedule and adherence engine.
//!
//! This crate provides:
//! - Domain types (prescriptions, dosing rules, dose obligations)
//! - Dosing rule expansion in the owner's time zone
//! - The dose ledger and its JSONL journal
//! - Reminder scheduling with retry and escalation
//! - Adherence statistics and refill monitoring

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod clock;
pub mod schedule;
pub mod journal;
pub mod ledger;
pub mod refill;
pub mod adherence;
pub mod notify;
pub mod scheduler;
pub mod export;
pub mod engine;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use clock::{Clock, ManualClock, SystemClock};
pub use journal::{JournalLock, JsonlJournal, LedgerSink};
pub use ledger::DoseLedger;
pub use adherence::{AdherenceRecord, AdherenceWindow};
pub use notify::{DeliveryChannel, LogChannel};
pub use scheduler::ReminderScheduler;
pub use engine::AdherenceEngine;
