//! Project identity and per-project paths.
//!
//! A repository is identified by a `.cadence-id` marker file holding one
//! UUID. State lives outside the repo under
//! `~/.cadence/projects/<uuid>/`: the SQLite database, the planner-curated
//! memory file, captured agent outputs, and iteration summaries.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const MARKER_FILENAME: &str = ".cadence-id";
pub const SPEC_FILENAME: &str = "Cadencefile";

/// Memory files beyond this size still work, but curation is overdue.
pub const MEMORY_SIZE_WARNING_THRESHOLD: u64 = 50 * 1024;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no {SPEC_FILENAME} or git repository found from {0}")]
    NoProjectRoot(String),
}

pub type Result<T> = std::result::Result<T, ProjectError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ProjectError + '_ {
    move |source| ProjectError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Walk up from `start` looking for a `Cadencefile`; fall back to the git
/// root when none is found.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(SPEC_FILENAME).exists() {
            return Ok(current);
        }
        if !current.pop() {
            break;
        }
    }
    crate::git::find_repo_root(start)
        .map_err(|_| ProjectError::NoProjectRoot(start.display().to_string()))
}

/// All paths for one project.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub project_root: PathBuf,
    pub project_id: String,
    state_dir: PathBuf,
}

impl ProjectContext {
    /// Resolve the context for `project_root`, creating the marker file
    /// and state directory on first use.
    pub fn resolve(project_root: &Path) -> Result<Self> {
        Self::resolve_in(project_root, &default_state_home())
    }

    /// Like [`Self::resolve`] with an explicit state home (used by tests).
    pub fn resolve_in(project_root: &Path, state_home: &Path) -> Result<Self> {
        let project_id = get_or_create_project_id(project_root)?;
        let state_dir = state_home.join("projects").join(&project_id);
        std::fs::create_dir_all(&state_dir).map_err(io_err(&state_dir))?;
        Ok(Self {
            project_root: project_root.to_path_buf(),
            project_id,
            state_dir,
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    pub fn memory_path(&self) -> PathBuf {
        self.state_dir.join("memory.md")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.state_dir.join("outputs")
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.state_dir.join("summaries")
    }

    /// Read the project memory, empty when the file doesn't exist yet.
    pub fn read_memory(&self) -> Result<String> {
        let path = self.memory_path();
        if !path.exists() {
            return Ok(String::new());
        }
        let content = std::fs::read_to_string(&path).map_err(io_err(&path))?;
        if content.len() as u64 > MEMORY_SIZE_WARNING_THRESHOLD {
            warn!(
                bytes = content.len(),
                "memory file exceeds 50KiB; curation is overdue"
            );
        }
        Ok(content)
    }
}

/// Read the project id from the marker file, creating it atomically if
/// absent.
///
/// Creation writes a temp file in the same directory and hard-links it
/// into place; if the link target already exists another process won the
/// race and its id is used. Filesystems without hard links fall back to
/// rename followed by a re-read, which keeps the "one id wins" property.
pub fn get_or_create_project_id(project_root: &Path) -> Result<String> {
    let marker = project_root.join(MARKER_FILENAME);

    if let Some(existing) = read_marker(&marker)? {
        return Ok(existing);
    }

    let project_id = Uuid::new_v4().to_string();
    let tmp = project_root.join(format!(".cadence-id-{}", std::process::id()));
    std::fs::write(&tmp, format!("{project_id}\n")).map_err(io_err(&tmp))?;

    let outcome = match std::fs::hard_link(&tmp, &marker) {
        Ok(()) => Ok(project_id),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Lost the race; defer to the winner.
            match read_marker(&marker)? {
                Some(winner) => Ok(winner),
                None => {
                    // Marker exists but is empty; last writer wins.
                    std::fs::rename(&tmp, &marker).map_err(io_err(&marker))?;
                    return Ok(project_id);
                }
            }
        }
        Err(_) => {
            // hard_link unsupported here; rename and re-read.
            std::fs::rename(&tmp, &marker).map_err(io_err(&marker))?;
            return Ok(read_marker(&marker)?.unwrap_or(project_id));
        }
    };

    let _ = std::fs::remove_file(&tmp);
    outcome
}

fn read_marker(marker: &Path) -> Result<Option<String>> {
    if !marker.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(marker).map_err(io_err(marker))?;
    let id = content.trim();
    if id.is_empty() {
        Ok(None)
    } else {
        Ok(Some(id.to_string()))
    }
}

/// Ensure `.cadence-id` is listed in the project's `.gitignore`.
///
/// Returns true when an entry was added.
pub fn ensure_marker_in_gitignore(project_root: &Path) -> Result<bool> {
    let gitignore = project_root.join(".gitignore");
    let mut content = if gitignore.exists() {
        std::fs::read_to_string(&gitignore).map_err(io_err(&gitignore))?
    } else {
        String::new()
    };

    if content.lines().any(|l| l.trim() == MARKER_FILENAME) {
        return Ok(false);
    }

    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(MARKER_FILENAME);
    content.push('\n');
    std::fs::write(&gitignore, content).map_err(io_err(&gitignore))?;
    Ok(true)
}

fn default_state_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cadence")
}
