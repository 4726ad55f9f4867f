//! Queue edit actions
//!
//! Every action is a local mutation to the queue performed under the single
//! outer queue lock; the coordinator emits the returned events and persists
//! the queue afterwards. Stopping in-flight downloaders for deleted entries
//! is the coordinator's job, not the editor's.

use crate::error::{Error, Result};
use crate::types::{DeleteStatus, Event, FileId, NzbId};

use super::DownloadQueue;
use super::nzb_info::NzbInfo;

/// One queue edit
#[derive(Clone, Debug)]
pub enum EditAction {
    /// Move the NZB by a signed offset within the queue
    MoveOffset(i64),
    /// Move the NZB to the queue head
    MoveTop,
    /// Move the NZB to the queue tail
    MoveBottom,
    /// Pause all files
    Pause,
    /// Resume all files
    Resume,
    /// Mark the NZB deleted; the coordinator stops its downloaders and
    /// moves it to history once they drain
    Delete,
    /// Change the priority
    SetPriority(i32),
    /// Change the category
    SetCategory(String),
    /// Set (empty value: delete) a post-processing parameter
    SetParameter {
        /// Parameter name
        name: String,
        /// Parameter value; empty deletes
        value: String,
    },
    /// Rename the NZB. Duplicate resolution compares by name, so a rename
    /// can change which of two same-named files wins a later dedup pass.
    SetName(String),
    /// Merge another NZB's files into this one; the source is removed
    Merge {
        /// The NZB to be absorbed
        from: NzbId,
    },
    /// Split the named files out into a new NZB placed after this one
    Split {
        /// Files to move
        file_ids: Vec<FileId>,
        /// Name of the new NZB
        name: String,
    },
    /// Pause one file
    PauseFile(FileId),
    /// Resume one file
    ResumeFile(FileId),
    /// Mark one file deleted; the coordinator stops its downloaders
    DeleteFile(FileId),
}

/// Apply one action to the queue. Returns the events to emit.
pub fn apply(queue: &mut DownloadQueue, id: NzbId, action: EditAction) -> Result<Vec<Event>> {
    let mut events = Vec::new();

    match action {
        EditAction::MoveOffset(offset) => {
            let idx = position(queue, id)?;
            let new_idx = (idx as i64 + offset).clamp(0, queue.queue.len() as i64 - 1) as usize;
            let nzb = queue.queue.remove(idx);
            queue.queue.insert(new_idx, nzb);
        }
        EditAction::MoveTop => {
            let idx = position(queue, id)?;
            let nzb = queue.queue.remove(idx);
            queue.queue.insert(0, nzb);
        }
        EditAction::MoveBottom => {
            let idx = position(queue, id)?;
            let nzb = queue.queue.remove(idx);
            queue.queue.push(nzb);
        }
        EditAction::Pause => {
            let nzb = find_mut(queue, id)?;
            for file in &mut nzb.files {
                file.paused = true;
            }
            nzb.recompute_aggregates();
        }
        EditAction::Resume => {
            let nzb = find_mut(queue, id)?;
            for file in &mut nzb.files {
                file.paused = false;
            }
            nzb.health_paused = false;
            nzb.recompute_aggregates();
        }
        EditAction::Delete => {
            let nzb = find_mut(queue, id)?;
            nzb.deleting = true;
            if nzb.delete_status == DeleteStatus::None {
                nzb.delete_status = DeleteStatus::Manual;
            }
            for file in &mut nzb.files {
                file.deleted = true;
            }
            nzb.recompute_aggregates();
        }
        EditAction::SetPriority(priority) => {
            find_mut(queue, id)?.priority = priority;
        }
        EditAction::SetCategory(category) => {
            find_mut(queue, id)?.category = category;
        }
        EditAction::SetParameter { name, value } => {
            find_mut(queue, id)?.set_parameter(&name, &value);
        }
        EditAction::SetName(name) => {
            if name.is_empty() {
                return Err(Error::Other("NZB name cannot be empty".into()));
            }
            find_mut(queue, id)?.name = name;
        }
        EditAction::Merge { from } => {
            if from == id {
                return Err(Error::Other("cannot merge an NZB into itself".into()));
            }
            // Take the source out first so the two mutable borrows never overlap
            let Some(mut source) = queue.remove(from) else {
                return Err(Error::NotFound(format!("NZB {from}")));
            };
            let target = find_mut(queue, id)?;
            for file in &mut source.files {
                file.nzb_id = id;
            }
            target.files.append(&mut source.files);
            target.completed_files.append(&mut source.completed_files);
            target.messages.append(&mut source.messages);
            target.server_stats.add_list(&source.server_stats);
            target.success_size += source.success_size;
            target.failed_size += source.failed_size;
            target.par_success_size += source.par_success_size;
            target.par_failed_size += source.par_failed_size;
            target.completed_size += source.completed_size;
            target.completed_par_size += source.completed_par_size;
            target.completed_total_articles += source.completed_total_articles;
            target.completed_success_articles += source.completed_success_articles;
            target.completed_failed_articles += source.completed_failed_articles;
            target.recompute_aggregates();
            events.push(Event::NzbDeleted { id: from });
        }
        EditAction::Split { file_ids, name } => {
            if name.is_empty() {
                return Err(Error::Other("split NZB name cannot be empty".into()));
            }
            let new_id = queue.next_nzb_id();
            let idx = position(queue, id)?;
            let source = &mut queue.queue[idx];

            let mut moved = Vec::new();
            let mut remaining = Vec::new();
            for file in source.files.drain(..) {
                if file_ids.contains(&file.id) {
                    moved.push(file);
                } else {
                    remaining.push(file);
                }
            }
            if moved.is_empty() {
                source.files = remaining;
                return Err(Error::Other("no matching files to split".into()));
            }
            source.files = remaining;

            let mut split = NzbInfo::new(
                new_id,
                source.kind,
                format!("{name}.nzb"),
                source.dest_dir.clone(),
            );
            split.name = name;
            split.category = source.category.clone();
            split.priority = source.priority;
            for file in &mut moved {
                file.nzb_id = new_id;
            }
            split.files = moved;
            split.recompute_aggregates();
            source.recompute_aggregates();

            let split_name = split.name.clone();
            queue.queue.insert(idx + 1, split);
            events.push(Event::NzbAdded {
                id: new_id,
                name: split_name,
            });
        }
        EditAction::PauseFile(file_id) => {
            let nzb = find_mut(queue, id)?;
            let file = nzb
                .file_mut(file_id)
                .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
            file.paused = true;
            nzb.recompute_aggregates();
        }
        EditAction::ResumeFile(file_id) => {
            let nzb = find_mut(queue, id)?;
            let file = nzb
                .file_mut(file_id)
                .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
            file.paused = false;
            nzb.recompute_aggregates();
        }
        EditAction::DeleteFile(file_id) => {
            let nzb = find_mut(queue, id)?;
            let file = nzb
                .file_mut(file_id)
                .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
            file.deleted = true;
            // Articles never attempted are written off as missed
            let missed: u64 = file
                .articles
                .iter()
                .filter(|a| !a.is_terminal())
                .map(|a| a.size)
                .sum();
            file.missed_size += missed;
            file.remaining_size = file.remaining_size.saturating_sub(missed);
            nzb.recompute_aggregates();
            events.push(Event::FileDeleted { id, file_id });
        }
    }

    Ok(events)
}

fn position(queue: &DownloadQueue, id: NzbId) -> Result<usize> {
    queue
        .queue
        .iter()
        .position(|n| n.id == id)
        .ok_or_else(|| Error::NotFound(format!("NZB {id}")))
}

fn find_mut(queue: &mut DownloadQueue, id: NzbId) -> Result<&mut NzbInfo> {
    queue
        .find_mut(id)
        .ok_or_else(|| Error::NotFound(format!("NZB {id}")))
}
