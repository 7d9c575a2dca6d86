//! # Filesystem Watcher
//!
//! Thin adapter from `notify` events to the engine's [`WatchEvent`] model.
//! Only the five event kinds the mutator consumes are forwarded; everything
//! else (metadata churn, reads) is dropped here. Rename pairs keep the
//! kernel's cookie so the mutator can stitch MOVED_FROM/MOVED_TO back into a
//! single rename.

use crate::error::Result;
use crate::mutator::WatchEvent;
use anyhow::Context;
use log::{trace, warn};
use notify::event::{AccessKind, AccessMode, CreateKind, Event, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::Sender;

/// Starts watching `src` recursively, forwarding translated events into
/// `tx`. The returned watcher must be kept alive for the watch to persist.
pub fn watch(src: &Path, tx: Sender<WatchEvent>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for translated in translate(event) {
                if tx.send(translated).is_err() {
                    // Receiver gone; the process is shutting down.
                    return;
                }
            }
        }
        Err(e) => warn!("watch error: {e}"),
    })
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(src, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", src.display()))?;
    Ok(watcher)
}

fn translate(event: Event) -> Vec<WatchEvent> {
    let cookie = event.attrs.tracker().unwrap_or(0) as u32;
    let Some(path) = event.paths.first().cloned() else {
        return Vec::new();
    };

    match event.kind {
        EventKind::Create(kind) => vec![WatchEvent::Create {
            is_dir: kind == CreateKind::Folder || path.is_dir(),
            path,
        }],
        EventKind::Remove(kind) => vec![WatchEvent::Delete {
            is_dir: kind == RemoveKind::Folder,
            path,
        }],
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            vec![WatchEvent::CloseWrite { path }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![WatchEvent::MovedFrom { path, cookie }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => vec![WatchEvent::MovedTo {
            is_dir: path.is_dir(),
            path,
            cookie,
        }],
        // Some platforms report a rename as one event carrying both paths.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = vec![WatchEvent::MovedFrom { path, cookie }];
            if let Some(to) = event.paths.get(1).cloned() {
                out.push(WatchEvent::MovedTo {
                    is_dir: to.is_dir(),
                    path: to,
                    cookie,
                });
            }
            out
        }
        other => {
            trace!("unhandled event kind: {other:?}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: Vec<PathBuf>) -> Event {
        let mut event = Event::default();
        event.kind = kind;
        event.paths = paths;
        event
    }

    #[test]
    fn create_file_translates() {
        let out = translate(event(
            EventKind::Create(CreateKind::File),
            vec![PathBuf::from("/watched/new.txt")],
        ));
        assert!(matches!(
            out.as_slice(),
            [WatchEvent::Create { is_dir: false, .. }]
        ));
    }

    #[test]
    fn remove_folder_translates() {
        let out = translate(event(
            EventKind::Remove(RemoveKind::Folder),
            vec![PathBuf::from("/watched/gone")],
        ));
        assert!(matches!(
            out.as_slice(),
            [WatchEvent::Delete { is_dir: true, .. }]
        ));
    }

    #[test]
    fn close_write_translates() {
        let out = translate(event(
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
            vec![PathBuf::from("/watched/written.txt")],
        ));
        assert!(matches!(out.as_slice(), [WatchEvent::CloseWrite { .. }]));
    }

    #[test]
    fn rename_both_splits_into_pair() {
        let out = translate(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![PathBuf::from("/watched/old"), PathBuf::from("/watched/new")],
        ));
        assert!(matches!(
            out.as_slice(),
            [
                WatchEvent::MovedFrom { .. },
                WatchEvent::MovedTo { .. }
            ]
        ));
    }

    #[test]
    fn unrelated_events_are_dropped() {
        let out = translate(event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
            vec![PathBuf::from("/watched/file")],
        ));
        assert!(out.is_empty());
    }
}
