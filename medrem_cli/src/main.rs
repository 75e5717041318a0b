use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use medrem_core::adherence::AdherenceWindow;
use medrem_core::export::export_history;
use medrem_core::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "medrem")]
#[command(about = "Medication schedule and adherence engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pin the clock to an RFC 3339 instant
    #[arg(long, global = true)]
    now: Option<DateTime<Utc>>,
}

/// Scope of a query: one prescription or everything an owner takes
#[derive(Args)]
#[group(required = true, multiple = false)]
struct SubjectArgs {
    #[arg(long)]
    owner: Option<String>,

    #[arg(long)]
    prescription: Option<PrescriptionId>,
}

impl SubjectArgs {
    fn subject(self) -> Subject {
        match (self.prescription, self.owner) {
            (Some(id), _) => Subject::Prescription(id),
            (None, owner) => Subject::Owner(owner.unwrap_or_default()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a prescription from a TOML definition
    Register { file: PathBuf },

    /// List registered prescriptions
    List,

    /// Replace a prescription's dosing rule going forward
    Edit {
        prescription: PrescriptionId,

        /// TOML file holding the new rule
        rule: PathBuf,

        /// Requested effective time (defaults to now)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
    },

    /// Show open doses that are due
    Due {
        #[command(flatten)]
        subject: SubjectArgs,

        #[arg(long)]
        json: bool,
    },

    /// Report what happened to a dose
    Report {
        obligation: ObligationId,

        /// taken, missed or skipped
        outcome: Outcome,

        /// When the dose was actually handled (defaults to now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Correct an already resolved dose
    Amend {
        obligation: ObligationId,

        outcome: Outcome,

        #[arg(long)]
        reason: String,

        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Show adherence statistics
    Adherence {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Look back this many days
        #[arg(long, default_value_t = 30)]
        days: u32,

        #[arg(long)]
        json: bool,
    },

    /// Show an owner's doses for a day and the next one due
    Schedule {
        #[arg(long)]
        owner: String,

        /// Local date (defaults to today in the owner's time zone)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Add supply after a pharmacy refill
    Replenish { prescription: PrescriptionId, quantity: u32 },

    /// Discontinue a prescription, keeping its history
    Archive { prescription: PrescriptionId },

    /// Mark doses past their grace window as missed
    Sweep,

    /// Export dose history to CSV
    Export {
        out: PathBuf,

        #[arg(long)]
        owner: Option<String>,
    },

    /// Rewrite the ledger journal to its minimal form
    Compact,

    /// Run the reminder loop, delivering to the log
    Run {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    medrem_core::logging::init_with_level("warn");

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }

    let clock: Arc<dyn Clock> = match cli.now {
        Some(now) => Arc::new(ManualClock::new(now)),
        None => Arc::new(SystemClock),
    };

    // The long-running loop locks the journal per batch and follows what
    // other commands append; everything else holds it until exit
    let follow = matches!(cli.command, Commands::Run { once: false });
    let _lock = if follow {
        None
    } else {
        Some(JournalLock::acquire(&config.journal_path())?)
    };
    let engine = if follow {
        AdherenceEngine::open_shared(config, clock, Arc::new(LogChannel))?
    } else {
        AdherenceEngine::open(config, clock, Arc::new(LogChannel))?
    };
    let generated = engine.extend_horizon()?;
    tracing::debug!("Generated {} obligations", generated);

    match cli.command {
        Commands::Register { file } => cmd_register(&engine, &file),
        Commands::List => cmd_list(&engine),
        Commands::Edit {
            prescription,
            rule,
            from,
        } => cmd_edit(&engine, prescription, &rule, from),
        Commands::Due { subject, json } => cmd_due(&engine, subject.subject(), json),
        Commands::Report {
            obligation,
            outcome,
            at,
        } => {
            let dose = engine.report_outcome(obligation, outcome, at)?;
            println!("Dose {} recorded as {}", dose.id, dose.status);
            flush(&engine).await;
            Ok(())
        }
        Commands::Amend {
            obligation,
            outcome,
            reason,
            at,
        } => {
            let dose = engine.amend_outcome(obligation, outcome, at, &reason)?;
            println!("Dose {} amended to {}", dose.id, dose.status);
            flush(&engine).await;
            Ok(())
        }
        Commands::Adherence {
            subject,
            days,
            json,
        } => cmd_adherence(&engine, subject.subject(), days, json),
        Commands::Schedule { owner, date } => cmd_schedule(&engine, &owner, date),
        Commands::Replenish {
            prescription,
            quantity,
        } => {
            let supply = engine.replenish(prescription, quantity)?;
            println!("Supply for {} is now {}", prescription, supply);
            Ok(())
        }
        Commands::Archive { prescription } => {
            engine.archive(prescription)?;
            println!("Archived {}", prescription);
            Ok(())
        }
        Commands::Sweep => {
            let done = engine.maintain()?;
            println!("Marked {} doses missed", done.sweep.missed.len());
            if done.sweep.errors > 0 {
                println!("  {} doses could not be swept (see log)", done.sweep.errors);
            }
            Ok(())
        }
        Commands::Export { out, owner } => cmd_export(&engine, &out, owner),
        Commands::Compact => {
            let journal = JsonlJournal::new(engine.config().journal_path());
            let entries = engine.ledger().compact_into(&journal)?;
            println!("Compacted journal to {} entries", entries);
            Ok(())
        }
        Commands::Run { once } => {
            if once {
                let report = engine.tick().await?;
                println!(
                    "Dispatched {} reminders ({} delivered, {} failed), {} escalations, {} notices",
                    report.dispatched,
                    report.delivered,
                    report.failed,
                    report.escalated,
                    report.published
                );
                Ok(())
            } else {
                engine
                    .run(async {
                        let _ = tokio::signal::ctrl_c().await;
                    })
                    .await
            }
        }
    }
}

/// Publish refill notices raised by the command before exiting
async fn flush(engine: &AdherenceEngine) {
    let published = engine.flush_notices().await;
    if published > 0 {
        println!("Sent {} notices", published);
    }
}

fn cmd_register(engine: &AdherenceEngine, file: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(file)?;
    let definition: PrescriptionDefinition = toml::from_str(&contents)?;
    let medication = definition.medication.clone();
    let id = engine.register_prescription(definition)?;
    println!("Registered {} as {}", medication, id);
    Ok(())
}

fn cmd_list(engine: &AdherenceEngine) -> Result<()> {
    let prescriptions = engine.prescriptions()?;
    if prescriptions.is_empty() {
        println!("No prescriptions registered.");
        return Ok(());
    }
    for p in prescriptions {
        println!(
            "{}  {:<12} {:<20} {:<12} supply {:>4}{}",
            p.id,
            p.owner,
            p.medication,
            p.dosage.to_string(),
            p.supply,
            if p.is_archived() { "  (archived)" } else { "" }
        );
    }
    Ok(())
}

fn cmd_edit(
    engine: &AdherenceEngine,
    prescription: PrescriptionId,
    rule: &Path,
    from: Option<DateTime<Utc>>,
) -> Result<()> {
    let contents = std::fs::read_to_string(rule)?;
    let rule: DosingRule = toml::from_str(&contents)?;
    let effective = engine.edit_rule(prescription, rule, from.unwrap_or_else(|| engine.now()))?;
    println!("New rule for {} effective {}", prescription, effective.to_rfc3339());
    Ok(())
}

fn cmd_due(engine: &AdherenceEngine, subject: Subject, json: bool) -> Result<()> {
    let due = engine.get_due_obligations(&subject, engine.now())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&due)?);
        return Ok(());
    }
    if due.is_empty() {
        println!("Nothing due.");
        return Ok(());
    }
    for view in due {
        println!(
            "{}  {}  {} {}  [{}]",
            view.id, view.local_time, view.medication, view.dosage, view.status
        );
    }
    Ok(())
}

fn cmd_adherence(engine: &AdherenceEngine, subject: Subject, days: u32, json: bool) -> Result<()> {
    let window = AdherenceWindow::last_days(engine.now(), days)?;
    let record = engine.get_adherence(&subject, &window)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("Adherence over the last {} days", days);
    println!(
        "  taken {}  missed {}  skipped {}  outstanding {}",
        record.taken, record.missed, record.skipped, record.outstanding
    );
    match record.percentage() {
        Some(pct) => println!("  taken ratio {:.1}% ({} on time)", pct, record.on_time),
        None => println!("  taken ratio n/a (nothing resolved yet)"),
    }
    println!(
        "  streak {} (longest {})",
        record.current_streak, record.longest_streak
    );
    Ok(())
}

fn cmd_schedule(engine: &AdherenceEngine, owner: &str, date: Option<NaiveDate>) -> Result<()> {
    let date = match date {
        Some(date) => date,
        None => {
            let tz = engine
                .prescriptions()?
                .into_iter()
                .find(|p| p.owner == owner)
                .map(|p| p.timezone)
                .unwrap_or(chrono_tz::Tz::UTC);
            engine.now().with_timezone(&tz).date_naive()
        }
    };

    let views = engine.schedule(owner, date)?;
    println!("Schedule for {} on {}", owner, date);
    if views.is_empty() {
        println!("  (nothing scheduled)");
    }
    for view in &views {
        println!(
            "  {}  {} {}  [{}]",
            view.local_time, view.medication, view.dosage, view.status
        );
    }
    match engine.next_due(owner)? {
        Some(next) => println!("Next: {} at {}", next.medication, next.local_time),
        None => println!("Next: nothing pending"),
    }
    Ok(())
}

fn cmd_export(engine: &AdherenceEngine, out: &Path, owner: Option<String>) -> Result<()> {
    let prescriptions: Vec<_> = engine
        .prescriptions()?
        .into_iter()
        .filter(|p| owner.as_ref().map_or(true, |o| &p.owner == o))
        .collect();

    let to = engine.now() + engine.config().horizon();
    let mut obligations = Vec::new();
    for p in &prescriptions {
        obligations.extend(engine.history(
            &Subject::Prescription(p.id),
            DateTime::<Utc>::MIN_UTC,
            to,
        )?);
    }

    let rows = export_history(out, &prescriptions, &obligations)?;
    println!("Exported {} doses to {}", rows, out.display());
    Ok(())
}
