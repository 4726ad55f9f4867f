//! Article scheduling: picking the next article to download
//!
//! Evaluated under the queue lock. Selection walks the queue repeatedly:
//! the best candidate file is the one with the greatest
//! `(extra_priority, nzb_priority)` pair (queue order breaks ties); its
//! first `Undefined` article wins. Files whose candidates are exhausted are
//! remembered in a scratch set so the walk terminates.

use std::collections::HashSet;

use crate::queue::{DownloadQueue, FileInfo};
use crate::types::{FileId, NzbId};

/// Pause flags and timing inputs for one scheduling decision
#[derive(Clone, Copy, Debug)]
pub struct ScheduleContext {
    /// Current unix time (seconds)
    pub now: i64,
    /// Articles younger than this many seconds are not scheduled yet
    pub propagation_delay_secs: i64,
    /// Global pause; overridden by force-priority NZBs and extra-priority files
    pub paused: bool,
}

/// The scheduling decision: which article to download next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextArticle {
    /// Owning NZB
    pub nzb_id: NzbId,
    /// Owning file
    pub file_id: FileId,
    /// Part number of the chosen article
    pub part_number: u32,
}

/// Pick the next article to download, lazy-loading article lists on demand.
///
/// `load_articles` populates a file whose partition was shed from memory;
/// returning `false` marks the file unusable for this pass.
pub fn next_article(
    queue: &mut DownloadQueue,
    ctx: &ScheduleContext,
    load_articles: &mut dyn FnMut(&mut FileInfo) -> bool,
) -> Option<NextArticle> {
    let mut checked: HashSet<FileId> = HashSet::new();

    loop {
        let mut best: Option<(bool, i32, usize, usize)> = None;
        for (nzb_idx, nzb) in queue.queue.iter().enumerate() {
            if nzb.deleting {
                continue;
            }
            let pause_ok = !ctx.paused || nzb.force_priority();
            for (file_idx, file) in nzb.files.iter().enumerate() {
                if file.paused || file.deleted || checked.contains(&file.id) {
                    continue;
                }
                if !pause_ok && !file.extra_priority {
                    continue;
                }
                if file.time > ctx.now - ctx.propagation_delay_secs {
                    continue;
                }
                let key = (file.extra_priority, nzb.priority, nzb_idx, file_idx);
                let better = match best {
                    None => true,
                    Some((extra, priority, best_nzb, best_file)) => {
                        (key.0, key.1) > (extra, priority)
                            || ((key.0, key.1) == (extra, priority)
                                && (nzb_idx, file_idx) < (best_nzb, best_file))
                    }
                };
                if better {
                    best = Some(key);
                }
            }
        }

        let (_, _, nzb_idx, file_idx) = best?;
        let nzb_id = queue.queue[nzb_idx].id;
        let file = &mut queue.queue[nzb_idx].files[file_idx];
        let file_id = file.id;

        if !file.articles_loaded && !load_articles(file) {
            tracing::warn!(file_id = %file_id, "failed to load article list, skipping file");
            checked.insert(file_id);
            continue;
        }

        if let Some(article) = file.next_undefined_article() {
            return Some(NextArticle {
                nzb_id,
                file_id,
                part_number: article.part_number,
            });
        }

        checked.insert(file_id);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ArticleInfo, ArticleState, NzbInfo};
    use crate::types::NzbKind;

    fn ctx() -> ScheduleContext {
        ScheduleContext {
            now: 1_000_000,
            propagation_delay_secs: 0,
            paused: false,
        }
    }

    fn no_load(_: &mut FileInfo) -> bool {
        panic!("lazy load must not be needed in this test")
    }

    fn add_nzb(queue: &mut DownloadQueue, priority: i32, parts: u32) -> (NzbId, FileId) {
        let id = queue.next_nzb_id();
        let mut nzb = NzbInfo::new(id, NzbKind::Nzb, format!("{id}.nzb"), "/d".into());
        nzb.priority = priority;
        let file_id = queue.next_file_id();
        let articles = (1..=parts)
            .map(|p| ArticleInfo::new(p, format!("<{id}-{p}@t>"), 100))
            .collect();
        nzb.files.push(FileInfo::new(
            file_id,
            id,
            "s".into(),
            format!("{id}.rar"),
            vec![],
            0,
            articles,
        ));
        nzb.recompute_aggregates();
        queue.add(nzb, false);
        (id, file_id)
    }

    #[test]
    fn picks_the_first_undefined_article_in_queue_order() {
        let mut queue = DownloadQueue::new();
        let (nzb_a, file_a) = add_nzb(&mut queue, 0, 2);
        add_nzb(&mut queue, 0, 2);

        let next = next_article(&mut queue, &ctx(), &mut no_load).unwrap();
        assert_eq!(next.nzb_id, nzb_a);
        assert_eq!(next.file_id, file_a);
        assert_eq!(next.part_number, 1);
    }

    #[test]
    fn higher_priority_nzb_wins_regardless_of_order() {
        let mut queue = DownloadQueue::new();
        add_nzb(&mut queue, 0, 1);
        let (high, _) = add_nzb(&mut queue, 100, 1);

        let next = next_article(&mut queue, &ctx(), &mut no_load).unwrap();
        assert_eq!(next.nzb_id, high);
    }

    #[test]
    fn global_pause_blocks_everything_except_force_priority() {
        let mut queue = DownloadQueue::new();
        add_nzb(&mut queue, 0, 1);
        let paused_ctx = ScheduleContext {
            paused: true,
            ..ctx()
        };
        assert!(next_article(&mut queue, &paused_ctx, &mut no_load).is_none());

        let (forced, _) = add_nzb(&mut queue, crate::types::FORCE_PRIORITY, 1);
        let next = next_article(&mut queue, &paused_ctx, &mut no_load).unwrap();
        assert_eq!(next.nzb_id, forced, "force priority overrides the pause");
    }

    #[test]
    fn extra_priority_file_ignores_global_pause() {
        let mut queue = DownloadQueue::new();
        let (nzb_id, file_id) = add_nzb(&mut queue, 0, 1);
        queue
            .find_mut(nzb_id)
            .unwrap()
            .file_mut(file_id)
            .unwrap()
            .extra_priority = true;

        let paused_ctx = ScheduleContext {
            paused: true,
            ..ctx()
        };
        let next = next_article(&mut queue, &paused_ctx, &mut no_load).unwrap();
        assert_eq!(next.file_id, file_id);
    }

    #[test]
    fn propagation_delay_defers_young_files() {
        let mut queue = DownloadQueue::new();
        let (nzb_id, file_id) = add_nzb(&mut queue, 0, 1);
        // Posted 60 seconds before "now"
        queue
            .find_mut(nzb_id)
            .unwrap()
            .file_mut(file_id)
            .unwrap()
            .time = 1_000_000 - 60;

        let delayed = ScheduleContext {
            propagation_delay_secs: 120,
            ..ctx()
        };
        assert!(
            next_article(&mut queue, &delayed, &mut no_load).is_none(),
            "a file younger than the propagation delay must wait"
        );

        let ready = ScheduleContext {
            propagation_delay_secs: 30,
            ..ctx()
        };
        assert!(next_article(&mut queue, &ready, &mut no_load).is_some());
    }

    #[test]
    fn paused_deleted_and_exhausted_files_are_skipped() {
        let mut queue = DownloadQueue::new();
        let (nzb_a, file_a) = add_nzb(&mut queue, 0, 1);
        let (_, file_b) = add_nzb(&mut queue, 0, 1);

        // Exhaust the first file, pause the second
        {
            let nzb = queue.find_mut(nzb_a).unwrap();
            let file = nzb.file_mut(file_a).unwrap();
            file.set_article_state(1, ArticleState::Running);
        }
        queue.queue[1].files[0].paused = true;
        let _ = file_b;

        assert!(
            next_article(&mut queue, &ctx(), &mut no_load).is_none(),
            "running articles are not re-scheduled and paused files are skipped"
        );
    }

    #[test]
    fn deleting_nzb_is_not_scheduled() {
        let mut queue = DownloadQueue::new();
        let (nzb_id, _) = add_nzb(&mut queue, 0, 1);
        queue.find_mut(nzb_id).unwrap().deleting = true;
        assert!(next_article(&mut queue, &ctx(), &mut no_load).is_none());
    }

    #[test]
    fn lazy_load_is_invoked_for_shed_article_lists() {
        let mut queue = DownloadQueue::new();
        let (_, file_id) = add_nzb(&mut queue, 0, 2);
        {
            let file = &mut queue.queue[0].files[0];
            file.articles.clear();
            file.articles_loaded = false;
        }

        let mut loads = 0;
        let next = next_article(&mut queue, &ctx(), &mut |file| {
            loads += 1;
            file.articles = vec![
                ArticleInfo::new(1, "<r1@t>".into(), 100),
                ArticleInfo::new(2, "<r2@t>".into(), 100),
            ];
            file.articles_loaded = true;
            true
        })
        .unwrap();

        assert_eq!(loads, 1);
        assert_eq!(next.file_id, file_id);
        assert_eq!(next.part_number, 1);
    }

    #[test]
    fn failed_lazy_load_skips_the_file_and_terminates() {
        let mut queue = DownloadQueue::new();
        add_nzb(&mut queue, 0, 1);
        {
            let file = &mut queue.queue[0].files[0];
            file.articles.clear();
            file.articles_loaded = false;
        }
        let mut loads = 0;
        let result = next_article(&mut queue, &ctx(), &mut |_| {
            loads += 1;
            false
        });
        assert!(result.is_none());
        assert_eq!(loads, 1, "a failed load must not be retried in the same pass");
    }
}
