//! Depth-bounded filesystem watching for kubeconfig sources

use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File-level change reported by a watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Added or modified
    Changed(PathBuf),
    /// Unlinked or renamed away
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Changed(path) | WatchEvent::Removed(path) => path,
        }
    }
}

/// File name patterns to skip (editor swap files, backups, dotfiles)
#[derive(Clone, Debug, Default)]
pub struct IgnoreRules {
    patterns: Vec<Regex>,
}

impl IgnoreRules {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        self.patterns.iter().any(|p| p.is_match(&name))
    }
}

/// List the files currently under `root`, `max_depth` levels deep
///
/// A file root yields itself.
pub fn scan(root: &Path, max_depth: usize, ignore: &IgnoreRules) -> Vec<PathBuf> {
    WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| !ignore.is_ignored(path))
        .collect()
}

/// Translate a notify event kind into a file-level event
fn classify(kind: &EventKind, path: &Path) -> Option<WatchEvent> {
    match kind {
        EventKind::Remove(_) => Some(WatchEvent::Removed(path.to_path_buf())),
        EventKind::Modify(ModifyKind::Name(_)) => {
            if path.exists() {
                Some(WatchEvent::Changed(path.to_path_buf()))
            } else {
                Some(WatchEvent::Removed(path.to_path_buf()))
            }
        }
        EventKind::Create(_) | EventKind::Modify(_) => {
            if path.is_dir() {
                None
            } else {
                Some(WatchEvent::Changed(path.to_path_buf()))
            }
        }
        _ => None,
    }
}

/// Which paths below the watched root are reported
#[derive(Clone, Debug)]
struct Scope {
    root: PathBuf,
    /// Root is a single file; its parent directory is watched
    single_file: bool,
    max_depth: usize,
    ignore: IgnoreRules,
}

impl Scope {
    fn accepts(&self, path: &Path) -> bool {
        if self.ignore.is_ignored(path) {
            return false;
        }
        if self.single_file {
            return path == self.root;
        }
        match path.strip_prefix(&self.root) {
            Ok(relative) => {
                let depth = relative.components().count();
                depth >= 1 && depth <= self.max_depth
            }
            Err(_) => false,
        }
    }
}

/// A running watch on one root
///
/// `stop()` releases the OS watch handle; it is idempotent and also runs on
/// drop.
pub struct SourceWatch {
    root: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl SourceWatch {
    pub fn start(
        root: &Path,
        max_depth: usize,
        ignore: IgnoreRules,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Self, notify::Error> {
        let single_file = root.is_file();
        let scope = Scope {
            root: root.to_path_buf(),
            single_file,
            max_depth: max_depth.max(1),
            ignore,
        };

        let (target, mode) = if single_file {
            let parent = root
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            (parent.to_path_buf(), RecursiveMode::NonRecursive)
        } else if scope.max_depth > 1 {
            (root.to_path_buf(), RecursiveMode::Recursive)
        } else {
            (root.to_path_buf(), RecursiveMode::NonRecursive)
        };

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Watch error");
                    return;
                }
            };
            for path in &event.paths {
                if !scope.accepts(path) {
                    continue;
                }
                if let Some(change) = classify(&event.kind, path) {
                    debug!(?change, "Source changed");
                    let _ = tx.send(change);
                }
            }
        })?;
        watcher.watch(&target, mode)?;

        debug!(root = %root.display(), watched = %target.display(), ?mode, "Watching source");
        Ok(Self {
            root: root.to_path_buf(),
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn is_active(&self) -> bool {
        self.watcher.lock().is_some()
    }

    pub fn stop(&self) {
        if self.watcher.lock().take().is_some() {
            debug!(root = %self.root.display(), "Stopped watching source");
        }
    }
}

impl Drop for SourceWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
    use std::time::Duration;

    fn default_ignore() -> IgnoreRules {
        IgnoreRules::new(&[r"^\.".to_string(), r"~$".to_string(), r"\.swp$".to_string()]).unwrap()
    }

    #[test]
    fn test_ignore_rules() {
        let ignore = default_ignore();
        assert!(ignore.is_ignored(Path::new("/kube/.config.swp")));
        assert!(ignore.is_ignored(Path::new("/kube/config~")));
        assert!(ignore.is_ignored(Path::new("/kube/.hidden")));
        assert!(!ignore.is_ignored(Path::new("/kube/config")));
        assert!(IgnoreRules::new(&["(".to_string()]).is_err());
    }

    #[test]
    fn test_scan_respects_depth_and_ignores() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yml"), "").unwrap();
        std::fs::write(dir.path().join("a.yml~"), "").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.yml"), "").unwrap();

        let ignore = default_ignore();
        let shallow = scan(dir.path(), 1, &ignore);
        assert_eq!(shallow, vec![dir.path().join("a.yml")]);

        let mut deep = scan(dir.path(), 2, &ignore);
        deep.sort();
        assert_eq!(
            deep,
            vec![dir.path().join("a.yml"), dir.path().join("nested/b.yml")]
        );

        let single = scan(&dir.path().join("a.yml"), 1, &ignore);
        assert_eq!(single, vec![dir.path().join("a.yml")]);
    }

    #[test]
    fn test_classify() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.yml");
        std::fs::write(&file, "").unwrap();
        let gone = dir.path().join("gone.yml");

        assert_eq!(
            classify(&EventKind::Create(CreateKind::File), &file),
            Some(WatchEvent::Changed(file.clone()))
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content)), &file),
            Some(WatchEvent::Changed(file.clone()))
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File), &gone),
            Some(WatchEvent::Removed(gone.clone()))
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From)), &gone),
            Some(WatchEvent::Removed(gone))
        );
        assert_eq!(classify(&EventKind::Create(CreateKind::Folder), dir.path()), None);
    }

    #[test]
    fn test_scope_depth() {
        let scope = Scope {
            root: PathBuf::from("/kube"),
            single_file: false,
            max_depth: 1,
            ignore: default_ignore(),
        };
        assert!(scope.accepts(Path::new("/kube/config")));
        assert!(!scope.accepts(Path::new("/kube/nested/config")));
        assert!(!scope.accepts(Path::new("/kube/.config.swp")));
        assert!(!scope.accepts(Path::new("/other/config")));
    }

    #[tokio::test]
    async fn test_watch_reports_changes_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch = SourceWatch::start(dir.path(), 1, default_ignore(), tx).unwrap();

        let file = dir.path().join("a.yml");
        std::fs::write(&file, "clusters: []").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path(), file);

        watch.stop();
        watch.stop();
        assert!(!watch.is_active());
    }
}
