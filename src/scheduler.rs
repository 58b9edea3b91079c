//! Long-running duty cycle.
//!
//! Each cycle, while the [`Schedule`] says to work: pull the snapshot
//! repository, run a full discovery pass, commit the results and refresh the
//! share watchers. Between cycles the loop sleeps for the schedule's pause,
//! waking early when [`Scheduler::stop`] is called.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::discovery::{Discovery, DiscoveryReport};
use crate::schedule::Schedule;
use crate::store::{CommitSummary, SnapshotStore};
use crate::watcher::{ChangeEvent, Trigger, WatchRegistry};

/// Result of one completed work cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub remote_merged: bool,
    pub report: DiscoveryReport,
    pub commit: CommitSummary,
    pub watched_shares: usize,
}

pub struct Scheduler {
    schedule: Schedule,
    discovery: Discovery,
    store: Arc<SnapshotStore>,
    watches: Arc<WatchRegistry>,
    trigger: Trigger,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
    shutdown: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        schedule: Schedule,
        discovery: Discovery,
        store: Arc<SnapshotStore>,
        watch_glob: &str,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watches = Arc::new(WatchRegistry::new(watch_glob, tx)?);
        let trigger = Trigger::new(discovery.clone(), store.clone());
        let (shutdown, _) = watch::channel(false);
        let (stopped, _) = watch::channel(true);
        Ok(Self {
            schedule,
            discovery,
            store,
            watches,
            trigger,
            events: Mutex::new(Some(rx)),
            shutdown,
            stopped,
        })
    }

    pub fn from_config(config: &Config, data_dir: &Path) -> Result<Self> {
        Self::new(
            Schedule::from_config(&config.schedule),
            Discovery::from_config(&config.discovery, data_dir),
            Arc::new(SnapshotStore::from_config(&config.store, data_dir)),
            &config.discovery.watch_glob,
        )
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Make sure the data directory is a usable working copy.
    pub async fn init(&self) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.ensure_initialized())
            .await
            .context("store initialisation task failed")??;
        info!(data_dir = %self.store.root().display(), "Snapshot store ready");
        Ok(())
    }

    /// Loop until [`stop`](Self::stop) is called. A failing cycle is logged
    /// and retried after the next pause.
    pub async fn run(&self) -> Result<()> {
        let events = self
            .events
            .lock()
            .map_err(|_| anyhow!("scheduler lock poisoned"))?
            .take();
        let Some(events) = events else {
            bail!("scheduler is already running or has run");
        };
        self.stopped.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            self.stopped.send_replace(true);
            return Ok(());
        }
        let trigger = tokio::spawn(self.trigger.clone().run(events, self.shutdown.subscribe()));
        info!("Scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            if self.schedule.should_work_at(now) {
                match self.cycle().await {
                    Ok(outcome) => info!(
                        report = %outcome.report,
                        commits = outcome.commit.messages.len(),
                        push = ?outcome.commit.push,
                        watched = outcome.watched_shares,
                        "Work cycle finished"
                    ),
                    Err(e) => error!(error = ?e, "Work cycle failed"),
                }
            } else {
                debug!("Asleep, skipping work cycle");
            }

            let now = Utc::now();
            let pause = self.schedule.pause_at(now);
            info!(
                state = ?self.schedule.state_at(now),
                pause_secs = pause.as_secs(),
                "Sleeping"
            );
            tokio::select! {
                _ = tokio::time::sleep(pause) => debug!("Waking"),
                _ = shutdown.changed() => {}
            }
        }

        if let Err(e) = self.watches.clear() {
            warn!(error = %e, "Failed to clear share watchers");
        }
        if let Err(e) = trigger.await {
            error!(error = %e, "Trigger task aborted");
        }
        self.stopped.send_replace(true);
        info!("Scheduler stopped");
        Ok(())
    }

    /// Signal the loop and wait until the in-flight cycle and cleanup have
    /// finished. Returns immediately when the loop is not running.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|done| *done).await;
    }

    /// Pull, discover everything, commit, re-register watchers.
    pub async fn cycle(&self) -> Result<CycleOutcome> {
        let store = self.store.clone();
        let remote_merged = tokio::task::spawn_blocking(move || store.pull())
            .await
            .context("pull task failed")??;

        let report = self.discovery.discover_all().await?;

        let store = self.store.clone();
        let commit = tokio::task::spawn_blocking(move || store.commit_pending_changes())
            .await
            .context("commit task failed")??;

        let watched_shares = self.refresh_watches().await?;
        Ok(CycleOutcome {
            remote_merged,
            report,
            commit,
            watched_shares,
        })
    }

    /// Watch every configured share that exists and drop the rest.
    async fn refresh_watches(&self) -> Result<usize> {
        let catalog = self.discovery.catalog().clone();
        let watches = self.watches.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut shares = Vec::new();
            for sp in catalog.search_paths()? {
                if !Path::new(&sp.share).is_dir() {
                    debug!(share = %sp.share, "share not reachable, not watching");
                    continue;
                }
                if let Err(e) = watches.watch(&sp) {
                    warn!(share = %sp.share, error = %e, "Failed to watch share");
                    continue;
                }
                shares.push(sp.share.clone());
            }
            watches.retain(&shares)?;
            watches.len()
        })
        .await
        .context("watch refresh task failed")?
    }
}
