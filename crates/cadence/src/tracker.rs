//! Work-tracker adapter over the `trc` CLI.
//!
//! Stateless: every operation re-invokes the CLI and parses its
//! line-oriented output with regexes. Malformed lines are skipped, never
//! fatal. A non-zero exit whose stderr mentions "not found" is a soft
//! miss (None / empty list); any other non-zero exit is a
//! [`TrackerError::Command`] carrying the stderr.

use crate::process::{run_command, CommandOutput, ProcessError};
use cadence_core::{WorkItem, WorkItemComment};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("trc command failed: {stderr}")]
    Command { stderr: String },
    #[error("could not parse created item id from: {0}")]
    UnparsableCreateOutput(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Open-item lines: `○ trk-abc123 [P2] Task title`.
fn open_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^○\s+(\S+)\s+\[P(\d)\]\s+(.+)$").unwrap())
}

/// Closed-item lines use a filled circle: `● trk-abc123 [P2] Title`.
fn closed_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^●\s+(\S+)\s+\[P(\d)\]\s+(.+)$").unwrap())
}

fn child_of_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+└─\s+child of:\s+(\S+)\s+-\s+").unwrap())
}

fn blocked_by_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+└─\s+blocked by:\s+(\S+)\s+-\s+").unwrap())
}

fn created_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Created issue (\S+):").unwrap())
}

/// Comment lines: `  [2026-01-20 10:30:00] source: text`. The source may
/// contain spaces or hyphens (`orient agent`, `code-reviewer`).
fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+\[([^\]]+)\]\s+([^:]+):\s+(.+)$").unwrap())
}

/// Tracker client bound to a project root.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    project_root: std::path::PathBuf,
}

impl TrackerClient {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Option<String>> {
        let out: CommandOutput = run_command("trc", args, &self.project_root)?;
        if out.success() {
            return Ok(Some(out.stdout));
        }
        if out.stderr.to_lowercase().contains("not found") {
            debug!(args = ?args, "trc reported not found, treating as empty");
            return Ok(None);
        }
        Err(TrackerError::Command {
            stderr: if out.stderr.trim().is_empty() {
                out.stdout.trim().to_string()
            } else {
                out.stderr.trim().to_string()
            },
        })
    }

    /// Probe that the tracker is initialized for this project.
    pub fn is_available(&self) -> bool {
        matches!(self.run(&["list"]), Ok(Some(_)) | Ok(None))
    }

    /// Open, unblocked items, optionally filtered to children of `root_id`.
    pub fn ready_items(&self, root_id: Option<&str>) -> Result<Vec<WorkItem>> {
        let Some(output) = self.run(&["ready"])? else {
            return Ok(Vec::new());
        };
        let mut items = parse_item_list(&output, open_line_re(), "open");
        if let Some(root) = root_id {
            items.retain(|t| t.parent_id.as_deref() == Some(root));
        }
        Ok(items)
    }

    /// Items blocked by dependencies.
    pub fn blocked_items(&self, root_id: Option<&str>) -> Result<Vec<WorkItem>> {
        let Some(output) = self.run(&["list"])? else {
            return Ok(Vec::new());
        };
        let mut items = parse_blocked_items(&output);
        if let Some(root) = root_id {
            items.retain(|t| t.parent_id.as_deref() == Some(root));
        }
        Ok(items)
    }

    /// Closed items.
    pub fn closed_items(&self, root_id: Option<&str>) -> Result<Vec<WorkItem>> {
        let Some(output) = self.run(&["list", "--status", "closed"])? else {
            return Ok(Vec::new());
        };
        let mut items = parse_item_list(&output, closed_line_re(), "closed");
        if let Some(root) = root_id {
            items.retain(|t| t.parent_id.as_deref() == Some(root));
        }
        Ok(items)
    }

    /// Direct children of an item, open and closed.
    pub fn children(&self, parent_id: &str) -> Result<Vec<WorkItem>> {
        let Some(output) = self.run(&["children", parent_id])? else {
            return Ok(Vec::new());
        };
        let mut items = parse_item_list(&output, open_line_re(), "open");
        items.extend(parse_item_list(&output, closed_line_re(), "closed"));
        for item in &mut items {
            item.parent_id.get_or_insert_with(|| parent_id.to_string());
        }
        Ok(items)
    }

    /// Full details of one item, or `None` when the tracker doesn't know it.
    pub fn show(&self, item_id: &str) -> Result<Option<(WorkItem, Vec<WorkItemComment>)>> {
        let Some(output) = self.run(&["show", item_id])? else {
            return Ok(None);
        };
        Ok(parse_show(&output))
    }

    /// Create an item; returns the tracker-assigned id.
    pub fn create(
        &self,
        title: &str,
        description: &str,
        parent: Option<&str>,
    ) -> Result<String> {
        let mut args = vec!["create", title, "--description", description];
        if let Some(parent) = parent {
            args.extend(["--parent", parent]);
        }
        let output = self.run(&args)?.unwrap_or_default();
        created_re()
            .captures(&output)
            .map(|c| c[1].to_string())
            .ok_or(TrackerError::UnparsableCreateOutput(output))
    }

    /// Close an item. Closing an already-closed item is not an error.
    pub fn close(&self, item_id: &str, message: Option<&str>) -> Result<()> {
        let mut args = vec!["close", item_id];
        if let Some(message) = message {
            args.extend(["--message", message]);
        }
        self.run(&args)?;
        Ok(())
    }

    /// Post a comment attributed to `source`.
    pub fn comment(&self, item_id: &str, body: &str, source: &str) -> Result<()> {
        self.run(&["comment", item_id, body, "--source", source])?;
        Ok(())
    }

    /// Move an item under a new parent.
    pub fn reparent(&self, item_id: &str, new_parent: &str) -> Result<()> {
        self.run(&["update", item_id, "--parent", new_parent])?;
        Ok(())
    }
}

fn parse_item_list(output: &str, line_re: &Regex, status: &str) -> Vec<WorkItem> {
    let lines: Vec<&str> = output.lines().collect();
    let mut items = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = line_re.captures(line) else {
            continue;
        };
        let parent_id = lines
            .get(i + 1)
            .and_then(|next| child_of_re().captures(next))
            .map(|c| c[1].to_string());

        items.push(WorkItem {
            id: caps[1].to_string(),
            title: caps[3].to_string(),
            status: status.to_string(),
            priority: caps[2].parse().unwrap_or(2),
            description: None,
            parent_id,
        });
    }
    items
}

fn parse_blocked_items(output: &str) -> Vec<WorkItem> {
    let lines: Vec<&str> = output.lines().collect();
    let mut items = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = open_line_re().captures(line) else {
            continue;
        };
        let Some(blocker) = lines
            .get(i + 1)
            .and_then(|next| blocked_by_re().captures(next))
        else {
            continue;
        };
        items.push(WorkItem {
            id: caps[1].to_string(),
            title: caps[3].to_string(),
            status: "open".to_string(),
            priority: caps[2].parse().unwrap_or(2),
            description: None,
            parent_id: Some(blocker[1].to_string()),
        });
    }
    items
}

/// Parse `trc show` output: a header item line, then `Status:` /
/// `Parent:` / `Description:` sections, then `Comments:`.
fn parse_show(output: &str) -> Option<(WorkItem, Vec<WorkItemComment>)> {
    let mut item: Option<WorkItem> = None;
    let mut comments = Vec::new();
    let mut in_comments = false;
    let mut in_description = false;
    let mut description_lines: Vec<String> = Vec::new();

    for line in output.lines() {
        if item.is_none() {
            for (re, status) in [(open_line_re(), "open"), (closed_line_re(), "closed")] {
                if let Some(caps) = re.captures(line) {
                    item = Some(WorkItem {
                        id: caps[1].to_string(),
                        title: caps[3].to_string(),
                        status: status.to_string(),
                        priority: caps[2].parse().unwrap_or(2),
                        description: None,
                        parent_id: None,
                    });
                    break;
                }
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed == "Comments:" {
            in_comments = true;
            in_description = false;
            continue;
        }
        if in_comments {
            if let Some(caps) = comment_re().captures(line) {
                comments.push(WorkItemComment {
                    timestamp: caps[1].to_string(),
                    source: caps[2].trim().to_string(),
                    text: caps[3].to_string(),
                });
            }
            continue;
        }
        if trimmed == "Description:" {
            in_description = true;
            continue;
        }
        if in_description {
            if trimmed.is_empty() {
                in_description = false;
            } else {
                description_lines.push(trimmed.to_string());
            }
            continue;
        }
        if let Some(status) = trimmed.strip_prefix("Status:") {
            if let Some(item) = item.as_mut() {
                item.status = status.trim().to_string();
            }
        } else if let Some(parent) = trimmed.strip_prefix("Parent:") {
            if let Some(item) = item.as_mut() {
                let parent = parent.trim();
                if !parent.is_empty() {
                    item.parent_id = Some(parent.to_string());
                }
            }
        }
    }

    let mut item = item?;
    if !description_lines.is_empty() {
        item.description = Some(description_lines.join("\n"));
    }
    Some((item, comments))
}
