//! Append-only JSONL capture of agent outputs.
//!
//! One record per completed invocation, in a date-named file under the
//! project's outputs directory. Capture is purely observational: every
//! failure is swallowed so a full disk never takes down a run.

use chrono::Utc;
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prompt summaries are clipped to this many characters.
const PROMPT_SUMMARY_MAX: usize = 100;

#[derive(Debug, Clone)]
pub struct OutputCapture {
    output_dir: PathBuf,
}

impl OutputCapture {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Append one record; returns the file written, or `None` when capture
    /// failed (which is not an error).
    pub fn capture(&self, agent_type: &str, prompt: &str, output: &Value) -> Option<PathBuf> {
        let result = self.try_capture(agent_type, prompt, output);
        if let Err(e) = &result {
            debug!(error = %e, "output capture failed, continuing");
        }
        result.ok()
    }

    fn try_capture(
        &self,
        agent_type: &str,
        prompt: &str,
        output: &Value,
    ) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;

        let now = Utc::now();
        let record = json!({
            "timestamp": now.to_rfc3339(),
            "agent_type": agent_type,
            "prompt_summary": summarize(prompt),
            "output": output,
        });

        let path = self
            .output_dir
            .join(format!("agent_outputs_{}.jsonl", now.format("%Y-%m-%d")));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{record}")?;
        Ok(path)
    }
}

fn summarize(prompt: &str) -> String {
    let flat = prompt.replace('\n', " ");
    if flat.chars().count() <= PROMPT_SUMMARY_MAX {
        flat
    } else {
        flat.chars().take(PROMPT_SUMMARY_MAX).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_one_record_per_capture() {
        let dir = TempDir::new().unwrap();
        let capture = OutputCapture::new(dir.path());

        let path1 = capture
            .capture("planner", "plan the work", &json!({"intent": "x"}))
            .unwrap();
        let path2 = capture
            .capture("executor", "do the work", &json!({"status": "Completed"}))
            .unwrap();
        assert_eq!(path1, path2);

        let content = std::fs::read_to_string(&path1).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["agent_type"], "planner");
        assert_eq!(first["prompt_summary"], "plan the work");
        assert_eq!(first["output"]["intent"], "x");
        assert!(first["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn file_is_date_named() {
        let dir = TempDir::new().unwrap();
        let capture = OutputCapture::new(dir.path());
        let path = capture.capture("verifier", "check", &json!({})).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("agent_outputs_"));
        assert!(name.ends_with(".jsonl"));
    }

    #[test]
    fn long_prompts_are_clipped() {
        let dir = TempDir::new().unwrap();
        let capture = OutputCapture::new(dir.path());
        let long_prompt = "p".repeat(500);
        let path = capture.capture("planner", &long_prompt, &json!({})).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let record: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(record["prompt_summary"].as_str().unwrap().len(), 100);
    }

    #[test]
    fn unwritable_directory_is_swallowed() {
        let capture = OutputCapture::new(Path::new("/proc/no-such-dir/outputs"));
        assert!(capture.capture("planner", "x", &json!({})).is_none());
    }
}
