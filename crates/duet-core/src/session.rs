use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionHandle, SessionId, TaskRecord};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A conversation: identity, append-only task history and the context
/// summary derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    records: Vec<TaskRecord>,
    context_summary: String,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            records: Vec::new(),
            context_summary: String::new(),
        }
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn task_count(&self) -> usize {
        self.records.len()
    }

    pub fn context_summary(&self) -> &str {
        &self.context_summary
    }

    /// The handle the most recent task ended on. A task that lost its
    /// handle leaves `None`, so the next call starts fresh.
    pub fn last_handle(&self) -> Option<&ExecutionHandle> {
        self.records.last().and_then(|r| r.result.handle.as_ref())
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.records.len() as u64
    }

    pub(crate) fn push_record(&mut self, record: TaskRecord) {
        self.last_used_at = record.recorded_at;
        self.records.push(record);
    }

    pub(crate) fn pop_record(&mut self) -> Option<TaskRecord> {
        self.records.pop()
    }

    pub(crate) fn record_mut(&mut self, seq: u64) -> Option<&mut TaskRecord> {
        self.records.iter_mut().find(|r| r.seq == seq)
    }

    pub(crate) fn set_summary(&mut self, summary: String) {
        self.context_summary = summary;
    }
}

// ---------------------------------------------------------------------------
// Context summary
// ---------------------------------------------------------------------------

const FIELD_CHARS: usize = 160;

/// Distill the most recent `window` records into at most `max_chars`
/// characters of planner context.
///
/// Newer records win when the bound is tight: lines are built newest-first
/// and the oldest are dropped, then the survivors are emitted oldest-first.
pub fn summarize(records: &[TaskRecord], window: usize, max_chars: usize) -> String {
    if max_chars == 0 || window == 0 {
        return String::new();
    }
    let start = records.len().saturating_sub(window);
    let mut lines: Vec<String> = Vec::new();
    let mut used = 0usize;

    for record in records[start..].iter().rev() {
        let line = summary_line(record);
        let cost = line.chars().count() + usize::from(!lines.is_empty());
        if used + cost > max_chars {
            if lines.is_empty() {
                lines.push(truncate_chars(&line, max_chars));
            }
            break;
        }
        used += cost;
        lines.push(line);
    }

    lines.reverse();
    lines.join("\n")
}

fn summary_line(record: &TaskRecord) -> String {
    let status = if record.result.success { "ok" } else { "failed" };
    let target = record
        .task
        .target
        .as_deref()
        .map(|t| format!(" {t}"))
        .unwrap_or_default();
    format!(
        "#{} [{status}] {}{target}: {} => {}",
        record.seq,
        record.task.action,
        one_line(&record.request, FIELD_CHARS),
        one_line(&record.result.output, FIELD_CHARS),
    )
}

fn one_line(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&flat, max)
}

/// Truncate on a char boundary, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push('…');
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
