//! Seeding/downloading state and the cumulative activity timers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    files::{apply_priorities, current_pending},
    now_secs,
    pieces::{pending_bitmap, pending_bytes},
    CoreError, CoreState, FileTrackingState, TorrentHandle, TorrentLayout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Idle,
    Downloading,
    Seeding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityStats {
    pub state: ActivityState,
    pub seeding_time: i64,
    pub downloading_time: i64,
    /// Unix seconds, 0 while the selection is incomplete.
    pub completed_date: i64,
    pub activate_date: i64,
    pub pending_bytes: u64,
    pub pending_completed: u64,
    pub completed_pieces: usize,
}

fn classify(handle: &dyn TorrentHandle, pending: &BTreeSet<usize>) -> ActivityState {
    if !handle.is_active() {
        return ActivityState::Idle;
    }
    let (done, total) = pending_bytes(handle, pending);
    if done >= total {
        ActivityState::Seeding
    } else {
        ActivityState::Downloading
    }
}

fn elapsed(tracking: &FileTrackingState, now: i64) -> i64 {
    (now - tracking.activate_date).max(0)
}

/// Runs after a checkbox changed. `previous` is the pending set the engine was working
/// on before the change.
pub(crate) fn on_selection_changed(
    handle: &dyn TorrentHandle,
    tracking: &mut FileTrackingState,
    layout: &TorrentLayout,
    previous: &BTreeSet<usize>,
    now: i64,
) {
    let before = classify(handle, previous);

    let pending = pending_bitmap(handle, layout, &tracking.checks);
    apply_priorities(handle, &pending);

    let (done, total) = pending_bytes(handle, &pending);
    if done < total {
        tracking.completed_date = 0;
        tracking.completed_bitmap.clear();
        if before == ActivityState::Seeding {
            tracking.seeding_time += elapsed(tracking, now);
            tracking.activate_date = now;
            debug!("seeding -> downloading, seeding_time={}", tracking.seeding_time);
        }
    } else {
        if tracking.completed_date == 0 {
            tracking.completed_date = now;
        }
        if before == ActivityState::Downloading {
            tracking.downloading_time += elapsed(tracking, now);
            tracking.activate_date = now;
            debug!("downloading -> seeding, downloading_time={}", tracking.downloading_time);
        }
    }

    // The engine may have shuffled priorities while we were busy.
    apply_priorities(handle, &pending);
}

pub fn torrent_started(state: &mut CoreState, info_hash: &str) -> Result<(), CoreError> {
    torrent_started_at(state, info_hash, now_secs())
}

pub(crate) fn torrent_started_at(state: &mut CoreState, info_hash: &str, now: i64) -> Result<(), CoreError> {
    let rec = state.record_mut(info_hash)?;
    if rec.tracking.running {
        debug!("torrent {} already active", info_hash);
        return Ok(());
    }
    rec.tracking.running = true;
    rec.tracking.activate_date = now;
    info!("torrent {} active", info_hash);
    Ok(())
}

/// Closes the running segment. Call while the engine still reports the torrent active.
pub fn torrent_stopped(state: &mut CoreState, info_hash: &str) -> Result<(), CoreError> {
    torrent_stopped_at(state, info_hash, now_secs())
}

pub(crate) fn torrent_stopped_at(state: &mut CoreState, info_hash: &str, now: i64) -> Result<(), CoreError> {
    let rec = state.record_mut(info_hash)?;
    let handle = rec.handle.clone();
    let tracking = &mut rec.tracking;
    tracking.running = false;
    let Some((_, pending)) = current_pending(handle.as_ref(), tracking) else {
        return Ok(());
    };
    let delta = elapsed(tracking, now);
    match classify(handle.as_ref(), &pending) {
        ActivityState::Seeding => tracking.seeding_time += delta,
        ActivityState::Downloading => tracking.downloading_time += delta,
        ActivityState::Idle => return Ok(()),
    }
    tracking.activate_date = now;
    info!("torrent {} stopped", info_hash);
    Ok(())
}

/// Bookkeeping for a freshly verified piece. Completing the selection closes the
/// downloading segment and stamps the completion date.
pub fn record_piece_completed(state: &mut CoreState, info_hash: &str, piece: usize) -> Result<(), CoreError> {
    record_piece_completed_at(state, info_hash, piece, now_secs())
}

pub(crate) fn record_piece_completed_at(
    state: &mut CoreState,
    info_hash: &str,
    piece: usize,
    now: i64,
) -> Result<(), CoreError> {
    let rec = state.record_mut(info_hash)?;
    let handle = rec.handle.clone();
    let tracking = &mut rec.tracking;
    tracking.completed_bitmap.insert(piece);

    let Some((_, pending)) = current_pending(handle.as_ref(), tracking) else {
        return Ok(());
    };
    let (done, total) = pending_bytes(handle.as_ref(), &pending);
    if done >= total && tracking.completed_date == 0 {
        tracking.completed_date = now;
        if handle.is_active() {
            tracking.downloading_time += elapsed(tracking, now);
            tracking.activate_date = now;
        }
        info!("torrent {} completed its selection", info_hash);
    }
    Ok(())
}

pub fn activity(state: &mut CoreState, info_hash: &str) -> Result<ActivityStats, CoreError> {
    let rec = state.record_mut(info_hash)?;
    let handle = rec.handle.clone();
    let tracking = &mut rec.tracking;
    let (current, (done, total)) = match current_pending(handle.as_ref(), tracking) {
        Some((_, pending)) => (
            classify(handle.as_ref(), &pending),
            pending_bytes(handle.as_ref(), &pending),
        ),
        None => (ActivityState::Idle, (0, 0)),
    };
    Ok(ActivityStats {
        state: current,
        seeding_time: tracking.seeding_time,
        downloading_time: tracking.downloading_time,
        completed_date: tracking.completed_date,
        activate_date: tracking.activate_date,
        pending_bytes: total,
        pending_completed: done,
        completed_pieces: tracking.completed_bitmap.len(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::files::set_file_check_at;
    use crate::testing::{state_with, MockEngine, MockTorrent};
    use crate::{add_torrent_at, SharedState};

    async fn setup(t: Arc<MockTorrent>, now: i64) -> (SharedState, String) {
        let state = state_with(MockEngine::new("0.0.0.0:49000"));
        let hash = {
            let mut guard = state.lock().await;
            add_torrent_at(&mut guard, t, now).expect("add")
        };
        (state, hash)
    }

    #[tokio::test]
    async fn toggles_accumulate_elapsed_time_exactly() {
        // file0 (pieces 0..=2) complete, file1 (pieces 2..=6) missing.
        let t = Arc::new(MockTorrent::new(16, &[40, 60, 20]));
        for p in 0..=2 {
            t.complete_piece(p);
        }
        let start = 1_000;
        let (state, hash) = setup(t.clone(), start).await;
        let mut guard = state.lock().await;

        // Still downloading: file2 is checked and missing.
        set_file_check_at(&mut guard, &hash, 1, false, start + 7).expect("toggle");
        // Only file0 left -> seeding.
        set_file_check_at(&mut guard, &hash, 2, false, start + 9).expect("toggle");
        // Widen again -> downloading.
        set_file_check_at(&mut guard, &hash, 1, true, start + 30).expect("toggle");
        // Narrow -> seeding.
        set_file_check_at(&mut guard, &hash, 1, false, start + 45).expect("toggle");

        let stats = activity(&mut guard, &hash).expect("stats");
        assert_eq!(stats.downloading_time, 9 + 15);
        assert_eq!(stats.seeding_time, 21);
        assert_eq!(stats.seeding_time + stats.downloading_time, 45);
        assert_eq!(stats.activate_date, start + 45);
        assert_eq!(stats.state, ActivityState::Seeding);
    }

    #[tokio::test]
    async fn inactive_engine_does_not_advance_timers() {
        let t = Arc::new(MockTorrent::new(16, &[40, 60]));
        for p in 0..=2 {
            t.complete_piece(p);
        }
        *t.active.lock() = false;
        let (state, hash) = setup(t, 0).await;
        let mut guard = state.lock().await;
        set_file_check_at(&mut guard, &hash, 1, false, 50).expect("toggle");
        set_file_check_at(&mut guard, &hash, 1, true, 90).expect("toggle");
        let stats = activity(&mut guard, &hash).expect("stats");
        assert_eq!(stats.seeding_time, 0);
        assert_eq!(stats.downloading_time, 0);
        assert_eq!(stats.state, ActivityState::Idle);
    }

    #[tokio::test]
    async fn entering_downloading_resets_completion() {
        let t = Arc::new(MockTorrent::new(16, &[40, 60]));
        for p in 0..=2 {
            t.complete_piece(p);
        }
        let (state, hash) = setup(t, 0).await;
        let mut guard = state.lock().await;
        set_file_check_at(&mut guard, &hash, 1, false, 10).expect("toggle");
        record_piece_completed_at(&mut guard, &hash, 2, 12).expect("record");
        let stats = activity(&mut guard, &hash).expect("stats");
        assert_eq!(stats.completed_date, 10);
        assert_eq!(stats.completed_pieces, 1);
        assert_eq!(stats.downloading_time, 10);

        set_file_check_at(&mut guard, &hash, 1, true, 20).expect("toggle");
        let stats = activity(&mut guard, &hash).expect("stats");
        assert_eq!(stats.completed_date, 0);
        assert_eq!(stats.completed_pieces, 0);
        assert_eq!(stats.state, ActivityState::Downloading);
    }

    #[tokio::test]
    async fn completing_selection_closes_downloading_segment() {
        let t = Arc::new(MockTorrent::new(16, &[32]));
        let (state, hash) = setup(t.clone(), 100).await;
        let mut guard = state.lock().await;
        t.complete_piece(0);
        record_piece_completed_at(&mut guard, &hash, 0, 110).expect("record");
        assert_eq!(activity(&mut guard, &hash).expect("stats").completed_date, 0);

        t.complete_piece(1);
        record_piece_completed_at(&mut guard, &hash, 1, 130).expect("record");
        let stats = activity(&mut guard, &hash).expect("stats");
        assert_eq!(stats.completed_date, 130);
        assert_eq!(stats.downloading_time, 30);
        assert_eq!(stats.activate_date, 130);

        // Duplicate reports do not move the completion date.
        record_piece_completed_at(&mut guard, &hash, 1, 150).expect("record");
        assert_eq!(activity(&mut guard, &hash).expect("stats").completed_date, 130);
    }

    #[tokio::test]
    async fn stop_accumulates_running_segment() {
        let t = Arc::new(MockTorrent::new(16, &[32]));
        t.complete_all();
        *t.active.lock() = false;
        let (state, hash) = setup(t.clone(), 0).await;
        let mut guard = state.lock().await;
        *t.active.lock() = true;
        torrent_started_at(&mut guard, &hash, 40).expect("start");
        torrent_stopped_at(&mut guard, &hash, 100).expect("stop");
        *t.active.lock() = false;
        // Stopping twice does not count the idle gap.
        torrent_stopped_at(&mut guard, &hash, 500).expect("stop");
        let stats = activity(&mut guard, &hash).expect("stats");
        assert_eq!(stats.seeding_time, 60);
        assert_eq!(stats.downloading_time, 0);
    }

    #[tokio::test]
    async fn repeated_start_keeps_the_open_segment() {
        let t = Arc::new(MockTorrent::new(16, &[32]));
        t.complete_all();
        *t.active.lock() = false;
        let (state, hash) = setup(t.clone(), 0).await;
        let mut guard = state.lock().await;
        *t.active.lock() = true;
        torrent_started_at(&mut guard, &hash, 0).expect("start");
        torrent_started_at(&mut guard, &hash, 50).expect("start");
        assert_eq!(activity(&mut guard, &hash).expect("stats").activate_date, 0);
        torrent_stopped_at(&mut guard, &hash, 100).expect("stop");
        *t.active.lock() = false;

        let stats = activity(&mut guard, &hash).expect("stats");
        assert_eq!(stats.seeding_time + stats.downloading_time, 100);

        // Stop then start again opens a fresh segment.
        *t.active.lock() = true;
        torrent_started_at(&mut guard, &hash, 300).expect("start");
        torrent_stopped_at(&mut guard, &hash, 310).expect("stop");
        assert_eq!(activity(&mut guard, &hash).expect("stats").seeding_time, 110);
    }

    #[tokio::test]
    async fn stopping_an_unknown_torrent_is_an_error() {
        let state = state_with(MockEngine::new("0.0.0.0:49000"));
        let mut guard = state.lock().await;
        assert_eq!(
            torrent_stopped_at(&mut guard, "ff", 10),
            Err(CoreError::TorrentNotFound("ff".to_string()))
        );
    }
}
