use std::path::PathBuf;

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::EventKind;

/// The filesystem activity that triggers commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A file opened for writing was closed.
    CloseWrite,
    /// A file or directory was moved into a watched directory.
    MovedTo,
}

/// One filesystem notification, consumed once by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    /// Translates a raw `notify` event, keeping only close-after-write and
    /// move-into notifications.
    ///
    /// The inotify backend reports a paired rename as `To` followed by `Both`;
    /// only `To` is kept so each move dispatches once.
    pub fn from_notify(event: &notify::Event) -> Vec<FileEvent> {
        let kind = match event.kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => FileEventKind::CloseWrite,
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileEventKind::MovedTo,
            _ => return Vec::new(),
        };

        event
            .paths
            .iter()
            .map(|path| FileEvent { path: path.clone(), kind })
            .collect()
    }
}
