//! forkline - browse and drive branching conversation threads
//!
//! Usage: forkline [--db PATH] <COMMAND>

mod message_format;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use forkline_core::engine::Script;
use forkline_core::run::RunOutcome;
use forkline_core::{
    ChatSession, Config, Database, DecisionKind, MessageGraph, RunStatus, ScriptedEngine,
    ThreadSnapshot, ThreadStatus, ThreadStore, ToolCallRequest,
};
use message_format::{preview, relative_time, role_label, status_marker, thread_title, tool_lines};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "forkline")]
#[command(about = "Branching conversation threads over a checkpointed agent engine")]
#[command(version)]
struct Args {
    /// SQLite database to use instead of the XDG data path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List threads, most recently updated first
    Threads {
        /// Include archived threads
        #[arg(long)]
        all: bool,
    },

    /// Print the active path of a thread
    Show { thread: String },

    /// List the siblings of a message
    Siblings { thread: String, message: String },

    /// Make a message the head of its thread
    Switch { thread: String, message: String },

    /// Set a thread's title
    Rename { thread: String, title: String },

    /// Archive a thread (or restore it with --restore)
    Archive {
        thread: String,
        #[arg(long)]
        restore: bool,
    },

    /// Delete a thread with its messages, interrupts and run history
    Delete { thread: String },

    /// Print the run audit of a thread
    Runs { thread: String },

    /// Write a thread snapshot as JSON
    Export {
        thread: String,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load a JSON snapshot into a thread, replacing its messages
    Import { thread: String, file: PathBuf },

    /// Run a scripted conversation that sends, regenerates, edits and approves a tool call
    Demo { thread: String },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load config")?;
    let _log_guard = forkline_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    let db_path = args.db.clone().unwrap_or_else(Config::database_path);
    tracing::info!(db_path = %db_path.display(), "forkline starting");

    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?
        .with_history_limit(config.persistence.history_limit);
    db.migrate().context("failed to run database migrations")?;
    let store = Arc::new(db);

    match args.command {
        Command::Threads { all } => cmd_threads(store.as_ref(), all),
        Command::Show { thread } => cmd_show(store, &config, &thread),
        Command::Siblings { thread, message } => cmd_siblings(store, &config, &thread, &message),
        Command::Switch { thread, message } => cmd_switch(store, &config, &thread, &message),
        Command::Rename { thread, title } => {
            if !store.rename_thread(&thread, &title)? {
                bail!("thread not found: {thread}");
            }
            println!("Renamed {thread} to \"{title}\"");
            Ok(())
        }
        Command::Archive { thread, restore } => {
            let status = if restore {
                ThreadStatus::Regular
            } else {
                ThreadStatus::Archived
            };
            if !store.set_thread_status(&thread, status)? {
                bail!("thread not found: {thread}");
            }
            println!("{thread} is now {}", status.as_str());
            Ok(())
        }
        Command::Delete { thread } => {
            if !store.delete_thread(&thread)? {
                bail!("thread not found: {thread}");
            }
            println!("Deleted {thread}");
            Ok(())
        }
        Command::Runs { thread } => cmd_runs(store.as_ref(), &thread),
        Command::Export { thread, output } => cmd_export(store.as_ref(), &thread, output.as_deref()),
        Command::Import { thread, file } => cmd_import(store.as_ref(), &config, &thread, &file),
        Command::Demo { thread } => cmd_demo(store, &config, &thread),
    }
}

/// Open an existing thread; read-only commands never create one.
fn open_session(store: Arc<Database>, config: &Config, thread: &str) -> Result<ChatSession> {
    if store.get_thread_info(thread)?.is_none() {
        bail!("thread not found: {thread}");
    }
    // Without a live engine the stored interrupt record is authoritative.
    let engine = Arc::new(ScriptedEngine::from_config(&config.engine));
    let (session, report) = ChatSession::open(thread, store, engine, config)
        .with_context(|| format!("failed to open thread {thread}"))?;
    if !report.orphans.is_empty() {
        eprintln!("warning: {} orphaned message(s) hidden", report.orphans.len());
    }
    if report.head_recomputed {
        eprintln!("warning: stored head was invalid; showing the latest branch");
    }
    Ok(session)
}

fn cmd_threads(store: &Database, all: bool) -> Result<()> {
    let threads: Vec<_> = store
        .list_threads()?
        .into_iter()
        .filter(|info| all || info.status == ThreadStatus::Regular)
        .collect();

    if threads.is_empty() {
        println!("No threads.");
        return Ok(());
    }

    println!("{:<38} {:<30} {:>8}  {:<9} UPDATED", "ID", "TITLE", "MESSAGES", "STATUS");
    for info in &threads {
        println!(
            "{:<38} {:<30} {:>8}  {:<9} {}",
            info.id,
            thread_title(info),
            info.message_count,
            info.status.as_str(),
            relative_time(info.updated_at)
        );
    }
    Ok(())
}

fn cmd_show(store: Arc<Database>, config: &Config, thread: &str) -> Result<()> {
    let session = open_session(store, config, thread)?;
    let path = session.active_path();
    if path.is_empty() {
        println!("Thread {thread} has no messages.");
        return Ok(());
    }

    for msg in path {
        let position = session
            .graph()
            .sibling_position(&msg.id)
            .map(|(index, total)| format!("{index}/{total}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "[{:>5}] {} {} {}",
            position,
            role_label(msg.role),
            msg.id,
            status_marker(&msg.status)
        );
        let text = preview(msg, 200);
        if !text.is_empty() {
            println!("        {text}");
        }
        for line in tool_lines(msg) {
            println!("        {line}");
        }
    }

    if let Some(pending) = session.pending_interrupt() {
        println!();
        println!("Awaiting approval at checkpoint {}:", pending.checkpoint_id);
        for call in &pending.tool_calls {
            println!("  {} {}({})", call.id, call.name, call.arguments);
        }
    }
    Ok(())
}

fn cmd_siblings(store: Arc<Database>, config: &Config, thread: &str, message: &str) -> Result<()> {
    let session = open_session(store, config, thread)?;
    let siblings = session.siblings_of(message);
    if siblings.is_empty() {
        bail!("message not found in {thread}: {message}");
    }

    let active = session.graph().active_ids();
    for (index, msg) in siblings.iter().enumerate() {
        let marker = if active.contains(&msg.id) { "*" } else { " " };
        println!(
            "{} {}/{} {} {} {}",
            marker,
            index + 1,
            siblings.len(),
            msg.id,
            msg.created_at.format("%Y-%m-%d %H:%M:%S"),
            preview(msg, 60)
        );
    }
    Ok(())
}

fn cmd_switch(store: Arc<Database>, config: &Config, thread: &str, message: &str) -> Result<()> {
    let mut session = open_session(store, config, thread)?;
    session
        .switch_branch(message)
        .with_context(|| format!("failed to switch {thread} to {message}"))?;
    session.flush()?;
    println!("Head: {}", session.head().unwrap_or("-"));
    Ok(())
}

fn cmd_runs(store: &Database, thread: &str) -> Result<()> {
    if store.get_thread_info(thread)?.is_none() {
        bail!("thread not found: {thread}");
    }
    let runs = store.list_runs(thread)?;
    if runs.is_empty() {
        println!("No runs recorded for {thread}.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{} {:<10} {:<11} {} -> {}{}",
            run.finished_at.format("%Y-%m-%d %H:%M:%S"),
            run.kind.as_str(),
            run.status.as_str(),
            run.fork_checkpoint_id.as_deref().unwrap_or("fresh"),
            run.result_checkpoint_id.as_deref().unwrap_or("-"),
            run.error.map(|e| format!("  ({e})")).unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_export(store: &Database, thread: &str, output: Option<&Path>) -> Result<()> {
    let snapshot = store
        .load_thread(thread)?
        .with_context(|| format!("thread not found: {thread}"))?;
    let json = serde_json::to_string_pretty(&snapshot).context("failed to encode snapshot")?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("Exported {} message(s) to {}", snapshot.messages.len(), path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_import(store: &Database, config: &Config, thread: &str, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let snapshot: ThreadSnapshot =
        serde_json::from_str(&raw).with_context(|| format!("invalid snapshot in {}", file.display()))?;

    // Admission assigns synthetic ids, so the stored rows are always keyed.
    let (mut graph, report) = MessageGraph::import(&snapshot, config.graph.max_admission_passes);
    if graph.head().is_none() && !graph.is_empty() {
        graph.recompute_head();
    }
    store.initialize_thread(thread)?;
    store.save_thread(thread, &graph.export())?;

    println!(
        "Imported {} message(s) into {} ({} with synthesized ids)",
        report.admitted, thread, report.synthesized_ids
    );
    if !report.orphans.is_empty() {
        println!("Orphaned messages (parent never seen):");
        for id in &report.orphans {
            println!("  {id}");
        }
    }
    if let Some(head) = report.invalid_head {
        println!("Stored head {head} was invalid; head is now {}", graph.head().unwrap_or("-"));
    }
    Ok(())
}

fn cmd_demo(store: Arc<Database>, config: &Config, thread: &str) -> Result<()> {
    if let Some(snapshot) = store.load_thread(thread)? {
        if !snapshot.is_empty() {
            bail!("thread {thread} already has messages; pick a new thread id");
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run_demo(store, config, thread))
}

async fn run_demo(store: Arc<Database>, config: &Config, thread: &str) -> Result<()> {
    let engine = Arc::new(ScriptedEngine::from_config(&config.engine));
    let (mut session, _) = ChatSession::open(thread, store.clone(), engine.clone(), config)?;
    store.rename_thread(thread, "Forkline demo")?;

    engine.push(Script::reply(
        "Why did the scarecrow win an award? Because he was outstanding in his field.",
    ));
    let handle = session.send_text("Tell me a joke.")?;
    let first = report_run(session.drive(handle).await?)?;
    let first_reply = first
        .message_id
        .context("first run produced no assistant message")?;

    engine.push(Script::reply(
        "I told my computer a joke about UDP. I'm not sure it got it.",
    ));
    let handle = session.regenerate(&first_reply)?;
    report_run(session.drive(handle).await?)?;

    let question = session
        .graph()
        .get(&first_reply)
        .and_then(|msg| msg.parent_id.clone())
        .context("first reply has no parent")?;
    engine.push(Script::reply(
        "The borrow checker walks into a bar. The bartender says: who owns this drink?",
    ));
    let handle = session.edit(&question, vec![forkline_core::ContentPart::text(
        "Tell me a joke about Rust.",
    )])?;
    report_run(session.drive(handle).await?)?;

    engine.push(Script::interrupt(
        "I'll clear the stale build artifacts.",
        vec![ToolCallRequest {
            id: "call-clean".to_string(),
            name: "delete_path".to_string(),
            arguments: json!({ "path": "target/" }),
        }],
    ));
    let handle = session.send_text("Now clean up the build directory.")?;
    report_run(session.drive(handle).await?)?;

    session.decide("call-clean", DecisionKind::Approve, None)?;
    println!("approved call-clean");
    let handle = session.submit_decisions()?;
    report_run(session.drive(handle).await?)?;

    session.flush()?;
    println!("demo thread {thread} has {} message(s)", session.graph().len());
    Ok(())
}

fn report_run(outcome: RunOutcome) -> Result<RunOutcome> {
    println!(
        "{} run {}: {}",
        outcome.kind.as_str(),
        outcome.run_id,
        outcome.status.as_str()
    );
    if outcome.status == RunStatus::Errored {
        bail!(
            "{} run failed: {}",
            outcome.kind.as_str(),
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(outcome)
}
