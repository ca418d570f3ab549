//! Dispatch cursor: tracks the pipeline's position in the chain.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// The dispatcher's current position in the chain.
///
/// The cursor knows:
/// - Which block was last fully processed (handlers ran, store flushed)
/// - Which block was last handed to the fetch-ahead buffer
/// - The chain's finalized and best heights as last observed
///
/// Heights only move forward, except through [`DispatchCursor::rewind_to`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCursor {
    pub latest_processed_height: Option<u64>,
    pub latest_buffered_height: Option<u64>,
    pub finalized_height: u64,
    pub best_height: u64,
}

impl DispatchCursor {
    /// Create a cursor that will resume at `start_height`.
    pub fn resume_from(start_height: u64) -> Self {
        let previous = start_height.checked_sub(1);
        Self {
            latest_processed_height: previous,
            latest_buffered_height: previous,
            ..Default::default()
        }
    }

    /// The next height that has not been handed to the buffer yet.
    pub fn next_buffer_height(&self) -> u64 {
        self.latest_buffered_height.map_or(0, |h| h + 1)
    }

    /// The next height that has not been processed yet.
    pub fn next_process_height(&self) -> u64 {
        self.latest_processed_height.map_or(0, |h| h + 1)
    }

    /// Record that `height` was fully processed.
    pub fn advance_processed(&mut self, height: u64) -> Result<(), IndexerError> {
        if let Some(current) = self.latest_processed_height {
            if height <= current {
                return Err(IndexerError::Other(format!(
                    "processed height may not move from {current} back to {height} without a rewind"
                )));
            }
        }
        self.latest_processed_height = Some(height);
        if self.latest_buffered_height.map_or(true, |b| b < height) {
            self.latest_buffered_height = Some(height);
        }
        Ok(())
    }

    /// Record that every height up to `height` has been handed to the buffer.
    pub fn advance_buffered(&mut self, height: u64) {
        if self.latest_buffered_height.map_or(true, |b| b < height) {
            self.latest_buffered_height = Some(height);
        }
    }

    /// Update the observed chain heights. The finalized height never decreases.
    pub fn update_chain(&mut self, finalized_height: u64, best_height: u64) {
        self.finalized_height = self.finalized_height.max(finalized_height);
        self.best_height = best_height;
    }

    /// Lower the cursor to `height` (fork resolution / retroactive datasource).
    pub fn rewind_to(&mut self, height: u64) {
        if self.latest_processed_height.map_or(false, |p| p > height) {
            self.latest_processed_height = Some(height);
        }
        self.latest_buffered_height = Some(height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_positions() {
        let cursor = DispatchCursor::resume_from(100);
        assert_eq!(cursor.latest_processed_height, Some(99));
        assert_eq!(cursor.next_buffer_height(), 100);
        assert_eq!(cursor.next_process_height(), 100);

        let genesis = DispatchCursor::resume_from(0);
        assert_eq!(genesis.latest_processed_height, None);
        assert_eq!(genesis.next_buffer_height(), 0);
    }

    #[test]
    fn processed_is_monotonic() {
        let mut cursor = DispatchCursor::resume_from(10);
        cursor.advance_processed(10).unwrap();
        cursor.advance_processed(12).unwrap();
        assert!(cursor.advance_processed(11).is_err());
        assert_eq!(cursor.latest_processed_height, Some(12));
        assert_eq!(cursor.latest_buffered_height, Some(12));
    }

    #[test]
    fn rewind_lowers_both_heights() {
        let mut cursor = DispatchCursor::resume_from(10);
        cursor.advance_buffered(20);
        cursor.advance_processed(15).unwrap();
        cursor.rewind_to(12);
        assert_eq!(cursor.latest_processed_height, Some(12));
        assert_eq!(cursor.latest_buffered_height, Some(12));
        cursor.advance_processed(13).unwrap();
    }

    #[test]
    fn finalized_never_decreases() {
        let mut cursor = DispatchCursor::default();
        cursor.update_chain(50, 55);
        cursor.update_chain(48, 56);
        assert_eq!(cursor.finalized_height, 50);
        assert_eq!(cursor.best_height, 56);
    }
}
