//! Date-range chunker.
//!
//! Splits a [`SearchWindow`] into consecutive [`DateChunk`]s of a fixed
//! length so the archive can be queried one period at a time. Chunks are
//! contiguous and non-overlapping; the last one is clipped to the window end.

use chrono::Duration;

use crate::error::PipelineError;
use crate::models::{DateChunk, SearchWindow};

/// Split `window` into chunks of `size`, in chronological order.
///
/// The union of the returned chunks is exactly `[window.start, window.end)`.
pub fn chunk_window(window: &SearchWindow, size: Duration) -> Result<Vec<DateChunk>, PipelineError> {
    if size <= Duration::zero() {
        return Err(PipelineError::InvalidChunkSize(size));
    }

    let mut chunks = Vec::new();
    let mut cursor = window.start();
    while cursor < window.end() {
        let next = cursor
            .checked_add_signed(size)
            .map_or(window.end(), |t| t.min(window.end()));
        chunks.push(DateChunk {
            start: cursor,
            end: next,
        });
        cursor = next;
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn window(y0: i32, m0: u32, d0: u32, y1: i32, m1: u32, d1: u32) -> SearchWindow {
        SearchWindow::new(
            Utc.with_ymd_and_hms(y0, m0, d0, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(y1, m1, d1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn last_chunk_is_clipped() {
        let chunks = chunk_window(&window(2021, 1, 1, 2021, 2, 15), Duration::days(30)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start, Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(chunks[0].end, Utc.with_ymd_and_hms(2021, 1, 31, 0, 0, 0).unwrap());
        assert_eq!(chunks[1].start, Utc.with_ymd_and_hms(2021, 1, 31, 0, 0, 0).unwrap());
        assert_eq!(chunks[1].end, Utc.with_ymd_and_hms(2021, 2, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn chunks_tile_window_exactly() {
        let w = window(2020, 3, 1, 2021, 3, 1);
        let chunks = chunk_window(&w, Duration::days(7)).unwrap();
        assert_eq!(chunks.first().unwrap().start, w.start());
        assert_eq!(chunks.last().unwrap().end, w.end());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }
        let covered = chunks
            .iter()
            .fold(Duration::zero(), |acc, c| acc + (c.end - c.start));
        assert_eq!(covered, w.end() - w.start());
    }

    #[test]
    fn window_shorter_than_chunk_is_one_chunk() {
        let w = window(2022, 5, 1, 2022, 5, 3);
        let chunks = chunk_window(&w, Duration::days(30)).unwrap();
        assert_eq!(chunks, vec![DateChunk { start: w.start(), end: w.end() }]);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let w = window(2022, 1, 1, 2022, 1, 21);
        let chunks = chunk_window(&w, Duration::days(10)).unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn rejects_non_positive_size() {
        let w = window(2022, 1, 1, 2022, 2, 1);
        assert!(matches!(
            chunk_window(&w, Duration::zero()),
            Err(PipelineError::InvalidChunkSize(_))
        ));
        assert!(chunk_window(&w, Duration::days(-1)).is_err());
    }
}
