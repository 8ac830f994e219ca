//! Replay command implementation.
//!
//! Builds an in-memory feed from a JSON-lines write script, then runs a watch
//! loop over it against a checkpoint file. The feed is rebuilt identically on
//! every run, so re-running with a longer script resumes from the checkpoint
//! and delivers only the appended writes.

use super::OutputFormat;
use async_trait::async_trait;
use docwatch_engine::{
    BatchHandler, EventHandler, FileTokenStore, LoopOptions, MemoryChangeSource, Projection,
    RetryOptions, StopSignal, WatchHandler, WatchOptions, WatchResult, WatchStats, Watcher,
};
use docwatch_protocol::Event;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Arguments of the replay command.
#[derive(Debug, Clone)]
pub struct ReplayArgs {
    /// Write script path.
    pub script: PathBuf,
    /// Checkpoint file path.
    pub checkpoint: PathBuf,
    /// Collection to watch.
    pub collection: String,
    /// Batch size; `None` selects per-event delivery.
    pub batch: Option<usize>,
    /// Whether to list before tailing.
    pub list_first: bool,
    /// Projected fields; empty means whole documents.
    pub fields: Vec<String>,
    /// Maximum handler invocations per unit.
    pub max_retry: u32,
    /// Delay between invocations, in milliseconds.
    pub retry_delay_ms: u64,
    /// Idle period ending the run, in milliseconds.
    pub idle_ms: u64,
    /// Output format.
    pub format: OutputFormat,
}

/// One line of a write script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    /// Insert a document; `_id` is assigned when missing.
    Insert {
        /// Target collection.
        collection: String,
        /// Document body.
        document: Value,
    },
    /// Set and unset top-level fields.
    Update {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
        /// Fields to set.
        #[serde(default)]
        set: Map<String, Value>,
        /// Fields to remove.
        #[serde(default)]
        unset: Vec<String>,
    },
    /// Replace a whole document.
    Replace {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
        /// New body.
        document: Value,
    },
    /// Delete a document.
    Delete {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
    },
    /// Drop a collection.
    Drop {
        /// Target collection.
        collection: String,
    },
    /// Rename a collection.
    Rename {
        /// Current name.
        collection: String,
        /// New name.
        to: String,
    },
    /// Drop every collection.
    DropDatabase,
}

impl ScriptOp {
    fn apply(&self, source: &MemoryChangeSource) -> WatchResult<()> {
        match self {
            ScriptOp::Insert {
                collection,
                document,
            } => source.insert(collection, document.clone()).map(drop),
            ScriptOp::Update {
                collection,
                id,
                set,
                unset,
            } => source.update(collection, id, set.clone(), unset.clone()),
            ScriptOp::Replace {
                collection,
                id,
                document,
            } => source.replace(collection, id, document.clone()),
            ScriptOp::Delete { collection, id } => source.delete(collection, id),
            ScriptOp::Drop { collection } => source.drop_collection(collection),
            ScriptOp::Rename { collection, to } => source.rename_collection(collection, to),
            ScriptOp::DropDatabase => source.drop_database(),
        }
    }
}

/// Parses a write script. Blank lines and `#` comments are skipped.
pub fn parse_script(text: &str) -> Result<Vec<ScriptOp>, String> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| serde_json::from_str(line).map_err(|e| format!("line {n}: {e}")))
        .collect()
}

/// Applies a script to a fresh in-memory feed.
pub fn build_source(script: &[ScriptOp]) -> WatchResult<MemoryChangeSource> {
    let source = MemoryChangeSource::new();
    for op in script {
        op.apply(&source)?;
    }
    Ok(source)
}

/// Prints every delivered event and tracks when the last one arrived.
struct PrintingHandler {
    format: OutputFormat,
    echo: bool,
    lines: Mutex<Vec<String>>,
    last_delivery: Mutex<Instant>,
}

impl PrintingHandler {
    fn new(format: OutputFormat, echo: bool) -> Arc<Self> {
        Arc::new(Self {
            format,
            echo,
            lines: Mutex::new(Vec::new()),
            last_delivery: Mutex::new(Instant::now()),
        })
    }

    fn idle_for(&self) -> Duration {
        self.last_delivery.lock().elapsed()
    }

    fn record(&self, event: &Event<Value>) -> bool {
        let line = render(event, self.format);
        if self.echo {
            println!("{line}");
        }
        self.lines.lock().push(line);
        *self.last_delivery.lock() = Instant::now();
        false
    }
}

#[async_trait]
impl EventHandler<Value> for PrintingHandler {
    async fn do_add(&self, event: &Event<Value>) -> bool {
        self.record(event)
    }

    async fn do_update(&self, event: &Event<Value>) -> bool {
        self.record(event)
    }

    async fn do_delete(&self, event: &Event<Value>) -> bool {
        self.record(event)
    }
}

#[async_trait]
impl BatchHandler<Value> for PrintingHandler {
    async fn do_batch(&self, events: &[Event<Value>]) -> bool {
        for event in events {
            self.record(event);
        }
        false
    }
}

fn render(event: &Event<Value>, format: OutputFormat) -> String {
    let token = event.token.as_ref().map(|t| t.as_str());
    match format {
        OutputFormat::Json => json!({
            "op": event.operation_type.as_str(),
            "collection": event.collection,
            "id": event.document_id,
            "time": event.cluster_time.to_string(),
            "token": token,
            "document": event.document,
        })
        .to_string(),
        OutputFormat::Text => {
            let mut line = format!(
                "{:<16} {}/{} @{}",
                event.operation_type.as_str(),
                event.collection,
                event.document_id,
                event.cluster_time
            );
            if let Some(doc) = &event.document {
                line.push(' ');
                line.push_str(&doc.to_string());
            }
            line
        }
    }
}

/// Outcome of a replay.
#[derive(Debug)]
pub struct ReplaySummary {
    /// Rendered deliveries, in order.
    pub lines: Vec<String>,
    /// Loop counters at exit.
    pub stats: WatchStats,
}

/// Runs the replay command.
pub fn run(args: &ReplayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(replay(args, true))?;
    let stats = &summary.stats;
    info!(
        listed = stats.listed_documents,
        delivered = stats.events_delivered,
        checkpoints = stats.checkpoints_written,
        "Replay finished"
    );
    Ok(())
}

/// Builds the feed and watches it until it has been idle for `idle_ms`.
pub async fn replay(
    args: &ReplayArgs,
    echo: bool,
) -> Result<ReplaySummary, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(&args.script)?;
    let script = parse_script(&text)?;
    let source = build_source(&script)?;
    info!(
        operations = script.len(),
        sequence = source.last_sequence(),
        "Script applied"
    );

    let mut watch = WatchOptions::collection(args.collection.as_str());
    if !args.fields.is_empty() {
        watch = watch.with_fields(Projection::fields(args.fields.iter().cloned()));
    }

    let printer = PrintingHandler::new(args.format, echo);
    let handler = match args.batch {
        Some(_) => WatchHandler::Batch(Arc::clone(&printer) as Arc<dyn BatchHandler<Value>>),
        None => WatchHandler::Single(Arc::clone(&printer) as Arc<dyn EventHandler<Value>>),
    };
    let stop = StopSignal::new();
    let mut options = LoopOptions::new("replay", watch)
        .with_token_store(Arc::new(FileTokenStore::new(&args.checkpoint)))
        .with_handler(handler)
        .with_retry(RetryOptions::new(
            args.max_retry,
            Duration::from_millis(args.retry_delay_ms),
        ))
        .with_stop(stop.clone());
    if let Some(size) = args.batch {
        options = options.with_batch_size(size);
    }
    if !args.list_first {
        options = options.without_listing();
    }

    let watcher = Watcher::new(source);
    let batched = args.batch.is_some();
    let task = tokio::spawn(async move {
        if batched {
            watcher.run_batch_loop(options).await
        } else {
            watcher.run_single_loop(options).await
        }
    });

    let idle = Duration::from_millis(args.idle_ms);
    let tick = (idle / 4).max(Duration::from_millis(10));
    while !task.is_finished() && printer.idle_for() < idle {
        tokio::time::sleep(tick).await;
    }
    stop.stop();
    let stats = task.await??;

    let lines = std::mem::take(&mut *printer.lines.lock());
    Ok(ReplaySummary { lines, stats })
}
