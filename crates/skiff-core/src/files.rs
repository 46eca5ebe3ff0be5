//! File checkboxes, cached file snapshots and piece priority application.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::{
    activity,
    now_secs,
    pieces::{file_completion, pending_bitmap},
    CoreError, CoreState, FileRecord, FileTrackingState, TorrentHandle, TorrentLayout, TorrentRecord,
};

/// Every file starts out checked.
pub(crate) fn ensure_checks(tracking: &mut FileTrackingState, count: usize) {
    if tracking.checks.len() != count {
        tracking.checks = vec![true; count];
    }
}

/// Recomputes the whole snapshot from the engine. Returns the number of files, 0 while
/// metadata is unavailable.
fn rebuild_snapshot(rec: &mut TorrentRecord) -> usize {
    let handle = rec.handle.as_ref();
    let tracking = &mut rec.tracking;
    tracking.files_snapshot.clear();

    let Some(layout) = handle.layout() else {
        return 0;
    };
    ensure_checks(tracking, layout.files.len());

    tracking.files_snapshot = layout
        .files
        .iter()
        .zip(tracking.checks.iter())
        .map(|(span, check)| FileRecord {
            check: *check,
            path: span.path.clone(),
            length: span.length,
            bytes_completed: file_completion(handle, layout.piece_length, span),
        })
        .collect();
    tracking.files_snapshot.len()
}

fn snapshot_is_stale(rec: &TorrentRecord) -> bool {
    match rec.handle.layout() {
        Some(layout) => rec.tracking.files_snapshot.len() != layout.files.len(),
        None => !rec.tracking.files_snapshot.is_empty(),
    }
}

pub fn file_count(state: &mut CoreState, info_hash: &str) -> Result<usize, CoreError> {
    let rec = state.record_mut(info_hash)?;
    Ok(rebuild_snapshot(rec))
}

/// All file records, freshly computed.
pub fn files(state: &mut CoreState, info_hash: &str) -> Result<Vec<FileRecord>, CoreError> {
    let rec = state.record_mut(info_hash)?;
    rebuild_snapshot(rec);
    Ok(rec.tracking.files_snapshot.clone())
}

/// Reads the cached snapshot, rebuilding it first when it is absent or stale.
pub fn get_file(state: &mut CoreState, info_hash: &str, index: usize) -> Result<FileRecord, CoreError> {
    let rec = state.record_mut(info_hash)?;
    if rec.tracking.files_snapshot.is_empty() || snapshot_is_stale(rec) {
        rebuild_snapshot(rec);
    }
    let count = rec.tracking.files_snapshot.len();
    rec.tracking
        .files_snapshot
        .get(index)
        .cloned()
        .ok_or(CoreError::FileIndexOutOfRange { index, count })
}

pub fn set_file_check(
    state: &mut CoreState,
    info_hash: &str,
    index: usize,
    checked: bool,
) -> Result<(), CoreError> {
    set_file_check_at(state, info_hash, index, checked, now_secs())
}

pub(crate) fn set_file_check_at(
    state: &mut CoreState,
    info_hash: &str,
    index: usize,
    checked: bool,
    now: i64,
) -> Result<(), CoreError> {
    let rec = state.record_mut(info_hash)?;
    let handle = rec.handle.clone();
    let layout = handle.layout().ok_or(CoreError::MetadataUnavailable)?;
    let tracking = &mut rec.tracking;

    ensure_checks(tracking, layout.files.len());
    let count = tracking.checks.len();
    if index >= count {
        return Err(CoreError::FileIndexOutOfRange { index, count });
    }

    // What the engine is working on right now.
    let previous = pending_bitmap(handle.as_ref(), &layout, &tracking.checks);

    tracking.checks[index] = checked;
    if let Some(record) = tracking.files_snapshot.get_mut(index) {
        record.check = checked;
    }
    debug!("file {} of {} checked={}", index, info_hash, checked);

    activity::on_selection_changed(handle.as_ref(), tracking, &layout, &previous, now);
    Ok(())
}

/// Cancels every piece, then requests exactly the pending ones.
pub(crate) fn apply_priorities(handle: &dyn TorrentHandle, pending: &BTreeSet<usize>) {
    handle.cancel_pieces(0, handle.num_pieces());
    for &piece in pending {
        handle.download_pieces(piece, piece + 1);
    }
    handle.update_piece_priorities();
}

/// Pending set of the current checks, or `None` while metadata is unavailable.
pub(crate) fn current_pending(
    handle: &dyn TorrentHandle,
    tracking: &mut FileTrackingState,
) -> Option<(TorrentLayout, BTreeSet<usize>)> {
    let layout = handle.layout()?;
    ensure_checks(tracking, layout.files.len());
    let pending = pending_bitmap(handle, &layout, &tracking.checks);
    Some((layout, pending))
}

/// Renaming would need a second metainfo for local storage; refuse instead of silently
/// pretending it worked.
pub fn rename_file(
    state: &mut CoreState,
    info_hash: &str,
    index: usize,
    new_name: &str,
) -> Result<(), CoreError> {
    state.record(info_hash)?;
    warn!(
        "rename of file {} in {} to {:?} requested but not supported",
        index, info_hash, new_name
    );
    Err(CoreError::Unsupported("rename_file"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{state_with, MockEngine, MockTorrent};
    use crate::add_torrent;

    async fn setup(t: Arc<MockTorrent>) -> (crate::SharedState, String) {
        let state = state_with(MockEngine::new("0.0.0.0:49000"));
        let hash = {
            let mut guard = state.lock().await;
            add_torrent(&mut guard, t).expect("add")
        };
        (state, hash)
    }

    #[tokio::test]
    async fn files_default_to_checked() {
        let t = Arc::new(MockTorrent::new(16, &[40, 60, 20]));
        t.complete_piece(0);
        let (state, hash) = setup(t).await;
        let mut guard = state.lock().await;
        assert_eq!(file_count(&mut guard, &hash), Ok(3));
        let first = get_file(&mut guard, &hash, 0).expect("file 0");
        assert!(first.check);
        assert_eq!(first.path, "dir/file0.bin");
        assert_eq!(first.length, 40);
        assert_eq!(
            get_file(&mut guard, &hash, 3),
            Err(CoreError::FileIndexOutOfRange { index: 3, count: 3 })
        );
    }

    #[tokio::test]
    async fn missing_metadata_is_neutral_for_queries() {
        let t = Arc::new(MockTorrent::new(16, &[40]).without_metadata());
        let (state, hash) = setup(t).await;
        let mut guard = state.lock().await;
        assert_eq!(file_count(&mut guard, &hash), Ok(0));
        assert_eq!(files(&mut guard, &hash), Ok(vec![]));
        assert_eq!(
            set_file_check(&mut guard, &hash, 0, false),
            Err(CoreError::MetadataUnavailable)
        );
    }

    #[tokio::test]
    async fn snapshot_is_rebuilt_once_metadata_arrives() {
        let t = Arc::new(MockTorrent::new(16, &[40, 8]));
        let layout = t.layout.lock().take();
        let (state, hash) = setup(t.clone()).await;
        let mut guard = state.lock().await;
        assert!(get_file(&mut guard, &hash, 0).is_err());
        *t.layout.lock() = layout;
        assert_eq!(get_file(&mut guard, &hash, 1).map(|f| f.length), Ok(8));
    }

    #[tokio::test]
    async fn unchecking_cancels_then_requests_remaining_pieces() {
        let t = Arc::new(MockTorrent::new(16, &[40, 60, 20]));
        let (state, hash) = setup(t.clone()).await;
        let mut guard = state.lock().await;
        set_file_check(&mut guard, &hash, 1, false).expect("uncheck");

        assert_eq!(t.prioritized(), vec![0, 1, 2, 6, 7]);
        let calls = t.calls.lock().clone();
        assert_eq!(calls.first().map(String::as_str), Some("cancel 0..8"));
        assert_eq!(calls.last().map(String::as_str), Some("update"));
        assert!(!get_file(&mut guard, &hash, 1).expect("file 1").check);
    }

    #[tokio::test]
    async fn repeated_toggles_mirror_latest_selection() {
        let t = Arc::new(MockTorrent::new(16, &[40, 60, 20]));
        let (state, hash) = setup(t.clone()).await;
        let mut guard = state.lock().await;
        set_file_check(&mut guard, &hash, 0, false).expect("toggle");
        set_file_check(&mut guard, &hash, 2, false).expect("toggle");
        set_file_check(&mut guard, &hash, 0, true).expect("toggle");
        set_file_check(&mut guard, &hash, 1, false).expect("toggle");
        assert_eq!(t.prioritized(), vec![0, 1, 2]);
        set_file_check(&mut guard, &hash, 1, true).expect("toggle");
        // File 2 stays unchecked, so only its exclusive last piece is left out.
        assert_eq!(t.prioritized(), (0..7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn rename_fails_loudly() {
        let t = Arc::new(MockTorrent::new(16, &[40]));
        let (state, hash) = setup(t).await;
        let mut guard = state.lock().await;
        assert_eq!(
            rename_file(&mut guard, &hash, 0, "new.bin"),
            Err(CoreError::Unsupported("rename_file"))
        );
        assert_eq!(
            rename_file(&mut guard, "ff", 0, "new.bin"),
            Err(CoreError::TorrentNotFound("ff".to_string()))
        );
    }
}
