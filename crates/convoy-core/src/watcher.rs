//! Repository watching: recursive file events, filtered through the
//! repository's own ignore rules, feeding the reconcile loop.
//!
//! Filtering is a pure function over a relative path, so the interesting
//! logic is testable without generating real filesystem events. Every
//! surviving event triggers one reconcile call, synchronously on the
//! watcher's handler thread, with no coalescing.

use crate::error::Result;
use crate::paths::GITIGNORE_FILE;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

// ---------------------------------------------------------------------------
// IgnoreSet
// ---------------------------------------------------------------------------

struct IgnorePattern {
    re: Regex,
    negate: bool,
}

/// Gitignore-style pattern set: `*`, `?`, `**`, trailing `/` for
/// directories, leading `/` for root anchoring, `!` for negation. The last
/// matching pattern wins.
pub struct IgnoreSet {
    patterns: Vec<IgnorePattern>,
}

impl IgnoreSet {
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let patterns = lines
            .into_iter()
            .filter_map(IgnorePattern::compile)
            .collect();
        Self { patterns }
    }

    /// Patterns from the repository's ignore file plus the state
    /// directory's relative path (so state writes never retrigger
    /// reconciliation).
    pub fn from_repo(repo_root: &Path, state_rel: Option<&Path>) -> Self {
        let content = std::fs::read_to_string(repo_root.join(GITIGNORE_FILE)).unwrap_or_default();
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        if let Some(rel) = state_rel {
            lines.push(format!("/{}", path_to_slash(rel)));
        }
        Self::from_lines(lines.iter().map(String::as_str))
    }

    pub fn is_ignored(&self, rel: &Path) -> bool {
        let s = path_to_slash(rel);
        let mut ignored = false;
        for p in &self.patterns {
            if p.re.is_match(&s) {
                ignored = !p.negate;
            }
        }
        ignored
    }
}

impl IgnorePattern {
    fn compile(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (negate, line) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let line = line.strip_suffix('/').unwrap_or(line);
        let (anchored, line) = match line.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (line.contains('/'), line),
        };
        if line.is_empty() {
            return None;
        }

        // A pattern matching a directory ignores everything under it.
        let prefix = if anchored { "^" } else { "^(?:.*/)?" };
        let full = format!("{prefix}{}(?:/.*)?$", glob_to_regex(line));
        match Regex::new(&full) {
            Ok(re) => Some(Self { re, negate }),
            Err(e) => {
                tracing::warn!(pattern = line, error = %e, "skipping unusable ignore pattern");
                None
            }
        }
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut re = String::new();
    let bytes = glob.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if bytes.get(i + 1) == Some(&b'*') {
                    if bytes.get(i + 2) == Some(&b'/') {
                        re.push_str("(?:.*/)?");
                        i += 3;
                    } else {
                        re.push_str(".*");
                        i += 2;
                    }
                } else {
                    re.push_str("[^/]*");
                    i += 1;
                }
            }
            b'?' => {
                re.push_str("[^/]");
                i += 1;
            }
            c => {
                let c = c as char;
                if "\\.+()|[]{}^$".contains(c) {
                    re.push('\\');
                }
                re.push(c);
                i += 1;
            }
        }
    }
    re
}

fn path_to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a changed path (relative to the repo root) should trigger
/// reconciliation.
pub fn should_trigger(rel: &Path, state_rel: Option<&Path>, ignores: &IgnoreSet) -> bool {
    if let Some(state_rel) = state_rel {
        if rel.starts_with(state_rel) {
            return false;
        }
    }
    !ignores.is_ignored(rel)
}

// ---------------------------------------------------------------------------
// ConfigWatcher
// ---------------------------------------------------------------------------

pub struct ConfigWatcher {
    watcher: Option<RecommendedWatcher>,
    handle: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Watch `repo_root` recursively; call `on_change` for every qualifying
    /// event, on the watcher's own thread.
    pub fn start<F>(repo_root: &Path, state_dir: &Path, on_change: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let root = repo_root
            .canonicalize()
            .unwrap_or_else(|_| repo_root.to_path_buf());
        let state_abs = state_dir
            .canonicalize()
            .unwrap_or_else(|_| state_dir.to_path_buf());
        let state_rel = state_abs.strip_prefix(&root).ok().map(Path::to_path_buf);
        let ignores = IgnoreSet::from_repo(&root, state_rel.as_deref());

        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let handle = std::thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || handle_events(rx, root, state_rel, ignores, on_change))
            .expect("failed to spawn config watcher thread");

        Ok(Self {
            watcher: Some(watcher),
            handle: Some(handle),
        })
    }

    /// Stop watching and wait for the handler thread to drain and exit.
    pub fn stop(&mut self) {
        // Dropping the watcher closes the event channel, which ends the
        // handler loop.
        self.watcher.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_events<F: Fn()>(
    rx: mpsc::Receiver<notify::Result<Event>>,
    root: PathBuf,
    state_rel: Option<PathBuf>,
    ignores: IgnoreSet,
    on_change: F,
) {
    for res in rx {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "file watch error");
                continue;
            }
        };
        if !is_mutation(&event.kind) {
            continue;
        }
        let triggered = event.paths.iter().any(|path| {
            // Removed paths can no longer be canonicalized; use them as-is.
            let abs = path.canonicalize().unwrap_or_else(|_| path.clone());
            match abs.strip_prefix(&root) {
                Ok(rel) => should_trigger(rel, state_rel.as_deref(), &ignores),
                Err(_) => false,
            }
        });
        if triggered {
            tracing::info!(paths = ?event.paths, "repository changed, reconciling");
            on_change();
        }
    }
}

fn is_mutation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn star_matches_within_one_component() {
        let set = IgnoreSet::from_lines(["*.log"]);
        assert!(set.is_ignored(Path::new("a.log")));
        assert!(set.is_ignored(Path::new("sub/b.log")));
        assert!(!set.is_ignored(Path::new("a.log.txt")));
    }

    #[test]
    fn directory_pattern_covers_contents() {
        let set = IgnoreSet::from_lines(["build/"]);
        assert!(set.is_ignored(Path::new("build")));
        assert!(set.is_ignored(Path::new("build/out/app.bin")));
        assert!(set.is_ignored(Path::new("sub/build/x")));
        assert!(!set.is_ignored(Path::new("builder/x")));
    }

    #[test]
    fn leading_slash_anchors_to_root() {
        let set = IgnoreSet::from_lines(["/node_modules"]);
        assert!(set.is_ignored(Path::new("node_modules/pkg/index.js")));
        assert!(!set.is_ignored(Path::new("app/node_modules/pkg/index.js")));
    }

    #[test]
    fn double_star_crosses_directories() {
        let set = IgnoreSet::from_lines(["**/dist"]);
        assert!(set.is_ignored(Path::new("dist")));
        assert!(set.is_ignored(Path::new("a/b/dist/main.js")));
        assert!(!set.is_ignored(Path::new("distance/x")));
    }

    #[test]
    fn negation_last_match_wins() {
        let set = IgnoreSet::from_lines(["*.log", "!keep.log"]);
        assert!(set.is_ignored(Path::new("other.log")));
        assert!(!set.is_ignored(Path::new("keep.log")));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let set = IgnoreSet::from_lines(["# a comment", "", "target"]);
        assert!(set.is_ignored(Path::new("target/debug/app")));
        assert!(!set.is_ignored(Path::new("src/main.rs")));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let set = IgnoreSet::from_lines(["cache-?"]);
        assert!(set.is_ignored(Path::new("cache-1")));
        assert!(!set.is_ignored(Path::new("cache-12")));
    }

    #[test]
    fn state_dir_never_triggers() {
        let ignores = IgnoreSet::from_lines(std::iter::empty::<&str>());
        let state_rel = Some(Path::new(".convoy-state"));
        assert!(!should_trigger(
            Path::new(".convoy-state/state.json"),
            state_rel,
            &ignores
        ));
        assert!(should_trigger(Path::new(".convoy.yaml"), state_rel, &ignores));
    }

    #[test]
    fn ignored_paths_do_not_trigger() {
        let ignores = IgnoreSet::from_lines(["*.tmp"]);
        assert!(!should_trigger(Path::new("scratch.tmp"), None, &ignores));
        assert!(should_trigger(Path::new("scratch.yaml"), None, &ignores));
    }

    #[test]
    fn from_repo_merges_gitignore_and_state_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "*.bak\n").unwrap();
        let set = IgnoreSet::from_repo(dir.path(), Some(Path::new(".convoy-state")));
        assert!(set.is_ignored(Path::new("old.bak")));
        assert!(set.is_ignored(Path::new(".convoy-state/logs/x.log")));
        assert!(!set.is_ignored(Path::new("app/compose.yaml")));
    }

    #[test]
    fn watcher_fires_on_file_change() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join(".convoy-state");
        std::fs::create_dir_all(&state_dir).unwrap();

        let (tx, rx) = channel();
        let mut watcher = ConfigWatcher::start(dir.path(), &state_dir, move || {
            let _ = tx.send(());
        })
        .unwrap();

        std::fs::write(dir.path().join(".convoy.yaml"), "apps: []\n").unwrap();

        rx.recv_timeout(Duration::from_secs(10))
            .expect("change event observed");
        watcher.stop();
    }
}
