//! Engine cursor: tracks how far the stream has been emitted.

use serde::{Deserialize, Serialize};

/// The engine's in-memory position in the chain.
///
/// The cursor knows:
/// - Which block was last emitted
/// - Whether that block was emitted in full (a backfill window covered it) or
///   only partly (a live event from it was emitted; siblings may follow)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last block any event was emitted from, or last block scanned.
    pub position: u64,
    /// `true` if every event of `position` has been emitted.
    pub complete: bool,
}

impl Cursor {
    /// Cursor after a fully processed block.
    pub fn complete(position: u64) -> Self {
        Self {
            position,
            complete: true,
        }
    }

    /// Cursor that still has to scan `position` itself.
    pub fn partial(position: u64) -> Self {
        Self {
            position,
            complete: false,
        }
    }

    /// Record a fully scanned range ending at `position`.
    pub fn advance_complete(&mut self, position: u64) {
        if position >= self.position {
            *self = Self::complete(position);
        }
    }

    /// Record a single live event at `position`.
    pub fn advance_partial(&mut self, position: u64) {
        if position > self.position {
            *self = Self::partial(position);
        }
    }

    /// First block a catch-up scan must include.
    pub fn next_block(&self) -> u64 {
        if self.complete {
            self.position.saturating_add(1)
        } else {
            self.position
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_cursor_resumes_after_position() {
        let cursor = Cursor::complete(500);
        assert_eq!(cursor.next_block(), 501);
    }

    #[test]
    fn partial_cursor_rescans_position() {
        let mut cursor = Cursor::complete(100);
        cursor.advance_partial(105);
        assert_eq!(cursor.next_block(), 105);

        // a second event in the same block keeps it partial
        cursor.advance_partial(105);
        assert_eq!(cursor, Cursor::partial(105));

        cursor.advance_complete(110);
        assert_eq!(cursor.next_block(), 111);
    }

    #[test]
    fn cursor_never_rewinds() {
        let mut cursor = Cursor::complete(200);
        cursor.advance_partial(150);
        cursor.advance_complete(180);
        assert_eq!(cursor, Cursor::complete(200));
    }
}
