//! Piece/byte arithmetic for per-file completion and the pending piece set.

use std::collections::BTreeSet;

use crate::{FileSpan, TorrentHandle, TorrentLayout};

/// First and last piece touched by `[offset, offset + length)` for completion math.
///
/// The end piece is `floor((offset + length) / piece_length)`, which lies one past the
/// file when the file ends exactly on a piece boundary. [`file_completion`] accounts for it.
pub fn completion_bounds(piece_length: u64, offset: u64, length: u64) -> (usize, usize) {
    if piece_length == 0 {
        return (0, 0);
    }
    let begin = offset / piece_length;
    let end = offset.saturating_add(length) / piece_length;
    (begin as usize, end as usize)
}

/// Half-open piece range a checked file adds to the pending set. Always one piece past
/// the completion end so the piece holding the final byte is never left out.
pub fn pending_bounds(piece_length: u64, offset: u64, length: u64) -> (usize, usize) {
    let (begin, end) = completion_bounds(piece_length, offset, length);
    (begin, end + 1)
}

fn piece_credit(handle: &dyn TorrentHandle, piece: usize) -> u64 {
    let len = handle.piece_length(piece);
    if len > 0 && handle.piece_bytes_completed(piece) >= len {
        1
    } else {
        0
    }
}

/// Completed bytes of one file.
///
/// Pieces strictly inside the file are counted exactly. The bytes in the boundary pieces
/// (`rest`) are shared with the neighbours and credited as a whole: both boundary pieces
/// complete credits all of `rest`, one of them credits half, none credits nothing. A file
/// with a single boundary piece (contained in one piece, or ending on a piece boundary)
/// counts that piece for both halves.
pub fn file_completion(handle: &dyn TorrentHandle, piece_length: u64, span: &FileSpan) -> u64 {
    let num_pieces = handle.num_pieces();
    if span.length == 0 || piece_length == 0 || num_pieces == 0 {
        return 0;
    }
    let (begin, end) = completion_bounds(piece_length, span.offset, span.length);
    if begin >= num_pieces {
        return 0;
    }

    let mut done = 0u64;
    let mut mid = 0u64;
    for piece in (begin + 1)..end.min(num_pieces) {
        done += handle.piece_bytes_completed(piece);
        mid += handle.piece_length(piece);
    }
    let rest = span.length.saturating_sub(mid);

    let file_end = span.offset.saturating_add(span.length);
    let end_is_boundary = end > begin && end < num_pieces && (end as u64) * piece_length < file_end;
    let value = if end_is_boundary {
        piece_credit(handle, begin) + piece_credit(handle, end)
    } else {
        2 * piece_credit(handle, begin)
    };

    if value > 0 {
        done += rest / (2 / value);
    }
    done
}

/// Pieces required by the checked files. A missing flag counts as checked.
pub fn pending_bitmap(
    handle: &dyn TorrentHandle,
    layout: &TorrentLayout,
    checks: &[bool],
) -> BTreeSet<usize> {
    let num_pieces = handle.num_pieces();
    let mut bitmap = BTreeSet::new();
    for (i, file) in layout.files.iter().enumerate() {
        if !checks.get(i).copied().unwrap_or(true) {
            continue;
        }
        let (begin, end) = pending_bounds(layout.piece_length, file.offset, file.length);
        bitmap.extend(begin..end.min(num_pieces));
    }
    bitmap
}

/// `(completed, total)` bytes over the pieces of `bitmap`.
pub fn pending_bytes(handle: &dyn TorrentHandle, bitmap: &BTreeSet<usize>) -> (u64, u64) {
    bitmap.iter().fold((0, 0), |(done, total), &piece| {
        (
            done + handle.piece_bytes_completed(piece),
            total + handle.piece_length(piece),
        )
    })
}
