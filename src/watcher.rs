//! File-change triggers for configured shares.
//!
//! Each share gets one recursive `notify` watcher. Callbacks run on the
//! notify thread; they filter events down to configuration files and hand
//! the owning application directory to a [`Trigger`] through an unbounded
//! channel. The trigger debounces bursts, re-discovers every touched
//! application and commits the result.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use globset::GlobSet;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::catalog::build_globset;
use crate::discovery::Discovery;
use crate::models::SearchPath;
use crate::store::SnapshotStore;

/// Quiet period after the last event before a burst is processed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// An application directory that saw a configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub search_path: SearchPath,
    pub app_dir: PathBuf,
}

/// The application root owning `changed`: the first directory below `share`.
/// Files directly in the share belong to no application.
pub fn app_root_for(share: &Path, changed: &Path) -> Option<PathBuf> {
    let relative = changed.strip_prefix(share).ok()?;
    let mut components = relative.components();
    let first = match components.next()? {
        Component::Normal(name) => name,
        _ => return None,
    };
    components.next()?;
    Some(share.join(first))
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn share_key(share: &str) -> String {
    share.trim().to_lowercase()
}

/// Registered share watchers, keyed by lower-cased share path.
pub struct WatchRegistry {
    watches: Mutex<HashMap<String, RecommendedWatcher>>,
    filter: GlobSet,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

impl WatchRegistry {
    pub fn new(watch_glob: &str, events: mpsc::UnboundedSender<ChangeEvent>) -> Result<Self> {
        Ok(Self {
            watches: Mutex::new(HashMap::new()),
            filter: build_globset(&[watch_glob.to_string()])?,
            events,
        })
    }

    fn guard(&self) -> Result<MutexGuard<'_, HashMap<String, RecommendedWatcher>>> {
        self.watches
            .lock()
            .map_err(|_| anyhow!("watch registry lock poisoned"))
    }

    /// Start watching the share of `search_path`. Returns `false` when the
    /// share is already watched.
    pub fn watch(&self, search_path: &SearchPath) -> Result<bool> {
        let key = share_key(&search_path.share);
        let mut watches = self.guard()?;
        if watches.contains_key(&key) {
            return Ok(false);
        }

        let share = PathBuf::from(&search_path.share);
        let filter = self.filter.clone();
        let tx = self.events.clone();
        let sp = search_path.clone();
        let root = share.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(share = %root.display(), error = %e, "Watch error");
                        return;
                    }
                };
                if !is_relevant(&event.kind) {
                    return;
                }
                for path in &event.paths {
                    let matched = path
                        .file_name()
                        .is_some_and(|name| filter.is_match(Path::new(name)));
                    if !matched {
                        continue;
                    }
                    if let Some(app_dir) = app_root_for(&root, path) {
                        let _ = tx.send(ChangeEvent {
                            search_path: sp.clone(),
                            app_dir,
                        });
                    }
                }
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(&share, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", share.display()))?;
        info!(share = %share.display(), "Watching share");
        watches.insert(key, watcher);
        Ok(true)
    }

    /// Drop watchers for shares not in `shares`. Returns how many were removed.
    pub fn retain(&self, shares: &[String]) -> Result<usize> {
        let keep: Vec<String> = shares.iter().map(|s| share_key(s)).collect();
        let mut watches = self.guard()?;
        let before = watches.len();
        watches.retain(|key, _| {
            let kept = keep.contains(key);
            if !kept {
                info!(share = %key, "Stopped watching share");
            }
            kept
        });
        Ok(before - watches.len())
    }

    pub fn clear(&self) -> Result<()> {
        let mut watches = self.guard()?;
        if !watches.is_empty() {
            debug!(watchers = watches.len(), "Clearing share watchers");
        }
        watches.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.guard()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Drains change events and turns each debounced burst into per-application
/// re-discovery plus a commit.
#[derive(Clone)]
pub struct Trigger {
    discovery: Discovery,
    store: Arc<SnapshotStore>,
    debounce: Duration,
}

impl Trigger {
    pub fn new(discovery: Discovery, store: Arc<SnapshotStore>) -> Self {
        Self {
            discovery,
            store,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Run until the channel closes or `shutdown` flips to `true`. A burst
    /// already being processed is finished before returning.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let first = tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            if *shutdown.borrow() {
                break;
            }

            // Coalesce by application directory until the burst goes quiet.
            let mut burst: BTreeMap<PathBuf, ChangeEvent> = BTreeMap::new();
            burst.insert(first.app_dir.clone(), first);
            while let Ok(Some(ev)) = tokio::time::timeout(self.debounce, events.recv()).await {
                burst.insert(ev.app_dir.clone(), ev);
            }

            self.fire(burst.into_values().collect()).await;
        }
        debug!("Trigger task stopped");
    }

    /// Re-discover each application on its own blocking task, then wait for
    /// all of them.
    pub async fn fire(&self, changes: Vec<ChangeEvent>) {
        let mut set = JoinSet::new();
        for change in changes {
            let this = self.clone();
            set.spawn_blocking(move || this.handle(&change));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Trigger task aborted");
            }
        }
    }

    fn handle(&self, change: &ChangeEvent) {
        info!(app_dir = %change.app_dir.display(), "Configuration change detected");
        match self.discovery.discover_app(&change.search_path, &change.app_dir) {
            Ok(Some(path)) => debug!(snapshot = %path.display(), "Snapshot refreshed"),
            Ok(None) => debug!(app_dir = %change.app_dir.display(), "Changed directory is not an application"),
            Err(e) => {
                error!(app_dir = %change.app_dir.display(), error = ?e, "Triggered discovery failed");
                return;
            }
        }
        if let Err(e) = self.store.commit_pending_changes() {
            error!(error = ?e, "Commit after file change failed");
        }
    }
}
