//! Recursive directory watching: raw OS notifications in, coalesced
//! typed file updates out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use vmfleet_common::{Format, Result};

use crate::update::{Event, FileUpdate};

/// How many raw notifications and pending updates can be buffered. A
/// full channel blocks the producer instead of dropping events: watch
/// loss is worse than latency.
pub const EVENT_BUFFER: usize = 4096;

/// Directory names never descended into or reported on.
const EXCLUDE_DIRS: &[&str] = &[".git"];

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Quiet period after the last raw notification before the batched
    /// events of each path are coalesced and dispatched. One logical
    /// file operation often surfaces as several notifications; batching
    /// turns them back into one update.
    pub dispatch_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(1),
        }
    }
}

/// One-shot suppression of the next matching event. Precondition: one
/// writer per watch storage at a time; the slot holds a single expected
/// event kind, not a counter.
#[derive(Clone, Default)]
pub struct SuspendSlot(Arc<StdMutex<Option<Event>>>);

impl SuspendSlot {
    /// Arms the slot: the very next event of this kind is dropped.
    pub fn suspend(&self, event: Event) {
        *self.0.lock().unwrap() = Some(event);
    }

    fn consume_if_matches(&self, event: Event) -> bool {
        let mut slot = self.0.lock().unwrap();
        if *slot == Some(event) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

/// Watches one directory subtree and emits [`FileUpdate`]s for files
/// matching the recognized manifest suffixes.
pub struct FileWatcher {
    dir: PathBuf,
    suspend: SuspendSlot,
    watcher: Arc<StdMutex<Option<RecommendedWatcher>>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Starts watching `dir` recursively. Returns the watcher, the files
    /// recognized during the initial walk, and the update stream. Must
    /// be called from within a tokio runtime.
    pub fn new(
        dir: &Path,
        opts: WatchOptions,
    ) -> Result<(Self, Vec<PathBuf>, mpsc::Receiver<FileUpdate>)> {
        let mut files = Vec::new();
        walk(dir, &mut files)?;

        let (event_tx, event_rx) = mpsc::channel::<NotifyEvent>(EVENT_BUFFER);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| match res {
                Ok(event) => {
                    // The handler runs on the OS watch thread, so a full
                    // channel blocks it rather than losing the event.
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => warn!("watcher: notification error: {e}"),
            })
            .map_err(notify_err)?;
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .map_err(notify_err)?;
        debug!(?dir, "watcher: watching recursively");

        let watcher = Arc::new(StdMutex::new(Some(watcher)));
        let (update_tx, update_rx) = mpsc::channel(EVENT_BUFFER);
        let suspend = SuspendSlot::default();
        let dispatcher = tokio::spawn(dispatch_loop(
            dir.to_path_buf(),
            opts,
            event_rx,
            update_tx,
            suspend.clone(),
            Arc::clone(&watcher),
        ));

        Ok((
            Self {
                dir: dir.to_path_buf(),
                suspend,
                watcher,
                dispatcher: Some(dispatcher),
            },
            files,
            update_rx,
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn suspend_handle(&self) -> SuspendSlot {
        self.suspend.clone()
    }

    /// Stops the OS watch, waits for the dispatch task to drain, and
    /// thereby closes the update stream. Callers must keep draining the
    /// stream until it closes.
    pub async fn close(mut self) {
        // Dropping the OS watcher also drops the raw event sender; the
        // dispatch loop drains what is buffered and exits.
        self.watcher.lock().unwrap().take();
        if let Some(task) = self.dispatcher.take() {
            let _ = task.await;
        }
    }
}

fn notify_err(e: notify::Error) -> vmfleet_common::Error {
    vmfleet_common::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

fn valid_suffix(path: &Path) -> bool {
    Format::from_path(path).is_some()
}

fn excluded(path: &Path) -> bool {
    path.components()
        .any(|c| EXCLUDE_DIRS.iter().any(|d| c.as_os_str() == *d))
}

/// Collects all recognized files under `dir`, skipping excluded
/// directories.
fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if !excluded(&path) {
                walk(&path, files)?;
            }
        } else if valid_suffix(&path) {
            files.push(path);
        }
    }
    Ok(())
}

async fn dispatch_loop(
    root: PathBuf,
    opts: WatchOptions,
    mut events: mpsc::Receiver<NotifyEvent>,
    updates: mpsc::Sender<FileUpdate>,
    suspend: SuspendSlot,
    watcher: Arc<StdMutex<Option<RecommendedWatcher>>>,
) {
    debug!("watcher: dispatch task started");
    let mut pending: HashMap<PathBuf, Vec<Event>> = HashMap::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let flush_at =
            deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(24 * 3600));
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => {
                    if register(&root, event, &mut pending, &watcher) {
                        deadline = Some(Instant::now() + opts.dispatch_interval);
                    }
                }
                // OS watch stopped: drain what is pending and exit.
                None => break,
            },
            _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                flush(&mut pending, &updates, &suspend).await;
                deadline = None;
            }
        }
    }

    flush(&mut pending, &updates, &suspend).await;
    debug!("watcher: dispatch task stopped");
}

/// Registers the typed events for one raw notification. Returns whether
/// anything was batched (and the flush deadline should be pushed out).
fn register(
    root: &Path,
    event: NotifyEvent,
    pending: &mut HashMap<PathBuf, Vec<Event>>,
    watcher: &Arc<StdMutex<Option<RecommendedWatcher>>>,
) -> bool {
    // A paired rename is a delete of the old path plus a create of the
    // new one.
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if event.paths.len() == 2 {
            let mut registered = false;
            registered |= batch(pending, &event.paths[0], Event::Delete);
            registered |= batch(pending, &event.paths[1], Event::Create);
            return registered;
        }
    }

    let Some(kind) = classify(&event.kind) else {
        return false;
    };

    let mut registered = false;
    for path in event.paths {
        if excluded(&path) {
            continue;
        }

        if kind == Event::Delete && path == root {
            // The watched root itself was replaced or removed; the OS
            // watch is dead, so re-register it on the (new) root.
            rewatch_root(root, watcher);
            continue;
        }
        if kind == Event::Create && path.is_dir() {
            // Recursive mode picks new subdirectories up by itself; no
            // event is emitted for the directory.
            continue;
        }

        registered |= batch(pending, &path, kind);
    }
    registered
}

fn batch(pending: &mut HashMap<PathBuf, Vec<Event>>, path: &Path, event: Event) -> bool {
    if !valid_suffix(path) {
        return false;
    }
    let list = pending.entry(path.to_path_buf()).or_default();
    // Adjacent duplicates carry no extra information.
    if list.last() != Some(&event) {
        list.push(event);
    }
    true
}

fn classify(kind: &EventKind) -> Option<Event> {
    match kind {
        EventKind::Create(_) => Some(Event::Create),
        EventKind::Remove(_) => Some(Event::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(Event::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Event::Create),
        EventKind::Modify(ModifyKind::Name(_)) => None,
        EventKind::Modify(_) => Some(Event::Modify),
        _ => None,
    }
}

fn rewatch_root(root: &Path, watcher: &Arc<StdMutex<Option<RecommendedWatcher>>>) {
    let mut guard = watcher.lock().unwrap();
    if let Some(w) = guard.as_mut() {
        let _ = w.unwatch(root);
        match w.watch(root, RecursiveMode::Recursive) {
            Ok(()) => debug!(?root, "watcher: re-registered watch on root"),
            Err(e) => error!(?root, "watcher: failed to re-register watch: {e}"),
        }
    }
}

async fn flush(
    pending: &mut HashMap<PathBuf, Vec<Event>>,
    updates: &mpsc::Sender<FileUpdate>,
    suspend: &SuspendSlot,
) {
    for (path, events) in pending.drain() {
        for event in coalesce(events) {
            if suspend.consume_if_matches(event) {
                debug!(%event, ?path, "watcher: skipping suspended event");
                continue;
            }
            debug!(%event, ?path, "watcher: sending update");
            let update = FileUpdate {
                event,
                path: path.clone(),
            };
            if updates.send(update).await.is_err() {
                return;
            }
        }
    }
}

/// Rewrites the batched event prefix of one path until no rule applies:
/// DELETE+CREATE+MODIFY → MODIFY, CREATE+MODIFY → CREATE, and
/// CREATE+DELETE cancel out.
fn coalesce(mut events: Vec<Event>) -> Vec<Event> {
    const RULES: &[(&[Event], &[Event])] = &[
        (
            &[Event::Delete, Event::Create, Event::Modify],
            &[Event::Modify],
        ),
        (&[Event::Create, Event::Modify], &[Event::Create]),
        (&[Event::Create, Event::Delete], &[]),
    ];

    'rewrite: loop {
        if events.len() < 2 {
            return events;
        }
        for (input, output) in RULES {
            if events.len() >= input.len() && &events[..input.len()] == *input {
                let mut rewritten = output.to_vec();
                rewritten.extend_from_slice(&events[input.len()..]);
                events = rewritten;
                continue 'rewrite;
            }
        }
        return events;
    }
}
