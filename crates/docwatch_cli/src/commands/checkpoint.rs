//! Checkpoint command implementation.

use super::OutputFormat;
use docwatch_engine::FileTokenStore;
use docwatch_protocol::{StartPoint, Timestamp};
use std::path::Path;

/// Prints the stored start point.
pub fn show(path: &Path, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let point = FileTokenStore::new(path).load()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&point)?),
        OutputFormat::Text => print!("{}", describe(path, &point)),
    }
    Ok(())
}

/// Removes the checkpoint file.
pub fn reset(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    FileTokenStore::new(path).reset()?;
    println!("Checkpoint {} removed", path.display());
    Ok(())
}

/// Replaces the checkpoint with a start time, dropping any stored token.
pub fn set_time(path: &Path, time: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ts: Timestamp = time.parse()?;
    FileTokenStore::new(path).save(&StartPoint {
        token: None,
        token_time: None,
        start_at_time: Some(ts),
    })?;
    println!("Checkpoint {} now starts at {ts}", path.display());
    Ok(())
}

fn describe(path: &Path, point: &StartPoint) -> String {
    let mut out = format!("Checkpoint: {}\n", path.display());
    if point.is_empty() {
        out.push_str("  (empty: the next watch lists from scratch)\n");
        return out;
    }
    if let Some(token) = &point.token {
        out.push_str(&format!("  Token:      {token}\n"));
    }
    if let Some(ts) = point.token_time {
        out.push_str(&format!("  Token time: {ts}\n"));
    }
    if let Some(ts) = point.start_at_time {
        out.push_str(&format!("  Start at:   {ts}\n"));
    }
    out
}
