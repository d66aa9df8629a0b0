//! Ingestion progress, kept free of I/O so every transition is unit-testable.
//!
//! ```text
//!   latest_processed   hole    segment   hole    segment (live)
//! ─────────●┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄●═══════●┄┄┄┄┄┄┄┄┄┄●══════●──▶
//!                                                   current
//! ```
//!
//! Accepted heads are kept as ordered segments of consecutive heights; the
//! last one is the live run. Holes between `latest_processed` and the first
//! segment are closed by historic backfills. A segment is folded into
//! `latest_processed` once the hole below it is closed: earlier segments as
//! soon as the backfill lands, the live run on the following head.
//!
//! `latest_processed <= current` holds whenever `current` is set: heads at or
//! below `latest_processed` are reported as [`HeadUpdate::Behind`] and leave
//! `current` untouched.

use std::collections::VecDeque;

use chainfeed_core::{BlockHeight, FeedError};
use serde::Serialize;

/// Result of a head observation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadUpdate {
    /// The head moved forward.
    Accepted,
    /// The head repeated the current one (reconnection replay); nothing changed.
    Duplicate,
    /// The head is at or below `latest_processed` (node lagging behind the
    /// checkpoint); nothing changed.
    Behind,
}

/// Where a live log belongs relative to the tracked heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPlacement {
    /// Its block is a streamed head: deliver it.
    Deliver,
    /// Its block is above the current head: keep it until that head arrives.
    Hold,
    /// Its block is processed or inside a hole a backfill covers: drop it.
    Covered,
}

/// Read-only copy of the state, published to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorSnapshot {
    pub current_block: Option<BlockHeight>,
    pub first_streamed_block: Option<BlockHeight>,
    pub latest_processed_block: BlockHeight,
}

/// Block processor state. Owned and mutated by one task only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorState {
    current: Option<BlockHeight>,
    first_streamed: Option<BlockHeight>,
    latest_processed: BlockHeight,
    /// Inclusive `(start, end)` runs of streamed heads above `latest_processed`,
    /// ascending and separated by at least one missing height.
    segments: VecDeque<(BlockHeight, BlockHeight)>,
}

impl ProcessorState {
    /// State of a processor for which every block up to `start` is processed.
    pub fn new(start: BlockHeight) -> Self {
        Self {
            current: None,
            first_streamed: None,
            latest_processed: start,
            segments: VecDeque::new(),
        }
    }

    pub fn current_block(&self) -> Option<BlockHeight> {
        self.current
    }

    /// Height of the first accepted head; set once.
    pub fn first_streamed_block(&self) -> Option<BlockHeight> {
        self.first_streamed
    }

    pub fn latest_processed_block(&self) -> BlockHeight {
        self.latest_processed
    }

    /// First height of the current run of consecutive heads, if it is not folded yet.
    pub fn live_run_start(&self) -> Option<BlockHeight> {
        self.segments.back().map(|(start, _)| *start)
    }

    pub fn snapshot(&self) -> ProcessorSnapshot {
        ProcessorSnapshot {
            current_block: self.current,
            first_streamed_block: self.first_streamed,
            latest_processed_block: self.latest_processed,
        }
    }

    /// Record a new head.
    ///
    /// A head below `current_block` fails with [`FeedError::OutOfOrderHeight`]
    /// and leaves the state untouched.
    pub fn observe_head(&mut self, height: BlockHeight) -> Result<HeadUpdate, FeedError> {
        match self.current {
            Some(current) if height < current => {
                return Err(FeedError::OutOfOrderHeight {
                    current,
                    received: height,
                })
            }
            Some(current) if height == current => return Ok(HeadUpdate::Duplicate),
            None if height <= self.latest_processed => return Ok(HeadUpdate::Behind),
            _ => {}
        }

        self.fold(true);

        let extends_live_run = matches!(
            self.segments.back(),
            Some((_, end)) if end.next() == Some(height)
        );
        if extends_live_run {
            if let Some((_, end)) = self.segments.back_mut() {
                *end = height;
            }
        } else {
            self.segments.push_back((height, height));
        }
        self.current = Some(height);
        self.first_streamed.get_or_insert(height);
        Ok(HeadUpdate::Accepted)
    }

    /// Fold every leading segment that directly continues `latest_processed`.
    /// The live run is only folded when `include_live` is set.
    fn fold(&mut self, include_live: bool) {
        while let Some(&(start, end)) = self.segments.front() {
            let is_live = self.segments.len() == 1;
            if (is_live && !include_live) || self.latest_processed.next() != Some(start) {
                break;
            }
            self.latest_processed = end;
            self.segments.pop_front();
        }
    }

    /// `true` when at least one block lies between `latest_processed` and the first segment.
    pub fn needs_historic_backfill(&self) -> bool {
        self.backfill_range().is_some()
    }

    /// Inclusive range the next backfill must cover.
    pub fn backfill_range(&self) -> Option<(BlockHeight, BlockHeight)> {
        let &(boundary, _) = self.segments.front()?;
        if self.latest_processed.blocks_between(boundary) == 0 {
            return None;
        }
        let from = self.latest_processed.next()?;
        let to = boundary.prev()?;
        Some((from, to))
    }

    /// Apply a successful backfill of `[from, to]`.
    ///
    /// Returns `false`, leaving the state untouched, if the range no longer
    /// continues `latest_processed` or reaches into a streamed segment.
    /// Segments completed by the backfill are folded, except the live run.
    pub fn apply_backfill(&mut self, from: BlockHeight, to: BlockHeight) -> bool {
        let continues = self.latest_processed.next() == Some(from);
        let below_segments = self.segments.front().is_some_and(|&(start, _)| to < start);
        if !continues || !below_segments || to < from {
            return false;
        }
        self.latest_processed = to;
        self.fold(false);
        true
    }

    /// Decide what to do with a live log of `block`.
    pub fn place_log(&self, block: BlockHeight) -> LogPlacement {
        if block <= self.latest_processed {
            return LogPlacement::Covered;
        }
        match self.current {
            None => LogPlacement::Hold,
            Some(current) if block > current => LogPlacement::Hold,
            Some(_) => {
                let streamed = self
                    .segments
                    .iter()
                    .any(|&(start, end)| start <= block && block <= end);
                if streamed {
                    LogPlacement::Deliver
                } else {
                    LogPlacement::Covered
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u64) -> BlockHeight {
        BlockHeight::new(n)
    }

    fn streaming(latest: u64, heads: &[u64]) -> ProcessorState {
        let mut state = ProcessorState::new(h(latest));
        for &n in heads {
            state.observe_head(h(n)).unwrap();
        }
        state
    }

    #[test]
    fn initialize_leaves_heads_unset() {
        let state = ProcessorState::new(h(50));
        assert_eq!(state.latest_processed_block(), h(50));
        assert_eq!(state.current_block(), None);
        assert_eq!(state.first_streamed_block(), None);
        assert!(!state.needs_historic_backfill());
    }

    #[test]
    fn current_follows_non_decreasing_heads() {
        let mut state = ProcessorState::new(h(0));
        let mut seen = Vec::new();
        for n in [10, 11, 11, 12, 15, 20] {
            state.observe_head(h(n)).unwrap();
            seen.push(state.current_block().unwrap().get());
        }
        assert_eq!(seen, vec![10, 11, 11, 12, 15, 20]);
    }

    #[test]
    fn lower_head_is_rejected_without_change() {
        let mut state = streaming(0, &[10, 11, 12]);
        let before = state.clone();
        let err = state.observe_head(h(11)).unwrap_err();
        assert!(matches!(
            err,
            FeedError::OutOfOrderHeight { current, received } if current == h(12) && received == h(11)
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn duplicate_head_is_a_no_op() {
        let mut state = streaming(0, &[10]);
        let before = state.clone();
        assert_eq!(state.observe_head(h(10)).unwrap(), HeadUpdate::Duplicate);
        assert_eq!(state, before);
    }

    #[test]
    fn first_streamed_is_set_once() {
        let state = streaming(0, &[7, 8, 30, 31]);
        assert_eq!(state.first_streamed_block(), Some(h(7)));
    }

    #[test]
    fn gap_of_four_blocks_triggers_backfill() {
        let mut state = streaming(100, &[105]);
        assert!(state.needs_historic_backfill());
        assert_eq!(state.backfill_range(), Some((h(101), h(104))));

        assert!(state.apply_backfill(h(101), h(104)));
        assert_eq!(state.latest_processed_block(), h(104));
        assert!(!state.needs_historic_backfill());
    }

    #[test]
    fn adjacent_head_needs_no_backfill() {
        let state = streaming(104, &[105]);
        assert!(!state.needs_historic_backfill());
        assert_eq!(state.backfill_range(), None);
    }

    #[test]
    fn heads_behind_checkpoint_leave_current_unset() {
        let mut state = ProcessorState::new(h(100));
        for n in [90, 91, 100] {
            assert_eq!(state.observe_head(h(n)).unwrap(), HeadUpdate::Behind);
        }
        assert_eq!(state.current_block(), None);
        assert_eq!(state.first_streamed_block(), None);
        assert!(!state.needs_historic_backfill());

        assert_eq!(state.observe_head(h(101)).unwrap(), HeadUpdate::Accepted);
        assert_eq!(state.first_streamed_block(), Some(h(101)));
        assert!(state.latest_processed_block() <= state.current_block().unwrap());
    }

    #[test]
    fn latest_never_passes_current() {
        let mut state = ProcessorState::new(h(50));
        for n in [40, 60, 61, 70, 71, 90] {
            state.observe_head(h(n)).unwrap();
            while let Some((from, to)) = state.backfill_range() {
                assert!(state.apply_backfill(from, to));
            }
            if let Some(current) = state.current_block() {
                assert!(state.latest_processed_block() <= current);
            }
        }
        assert_eq!(state.latest_processed_block(), h(89));
    }

    #[test]
    fn jump_during_open_gap_keeps_earlier_heads() {
        let mut state = streaming(50, &[60, 61, 70]);
        assert_eq!(state.backfill_range(), Some((h(51), h(59))));

        assert!(state.apply_backfill(h(51), h(59)));
        assert_eq!(state.latest_processed_block(), h(61));
        assert_eq!(state.backfill_range(), Some((h(62), h(69))));

        assert!(state.apply_backfill(h(62), h(69)));
        assert_eq!(state.latest_processed_block(), h(69));
        assert_eq!(state.backfill_range(), None);
        state.observe_head(h(71)).unwrap();
        assert_eq!(state.latest_processed_block(), h(70));
    }

    #[test]
    fn live_logs_are_placed_by_streamed_heads() {
        let state = streaming(50, &[60, 61, 70]);
        assert_eq!(state.place_log(h(50)), LogPlacement::Covered);
        assert_eq!(state.place_log(h(55)), LogPlacement::Covered);
        assert_eq!(state.place_log(h(61)), LogPlacement::Deliver);
        assert_eq!(state.place_log(h(65)), LogPlacement::Covered);
        assert_eq!(state.place_log(h(70)), LogPlacement::Deliver);
        assert_eq!(state.place_log(h(71)), LogPlacement::Hold);
        assert_eq!(ProcessorState::new(h(5)).place_log(h(6)), LogPlacement::Hold);
    }

    #[test]
    fn live_run_folds_once_gap_is_closed() {
        let mut state = streaming(50, &[60]);
        assert_eq!(state.backfill_range(), Some((h(51), h(59))));

        // No folding while the gap is open.
        state.observe_head(h(61)).unwrap();
        assert_eq!(state.latest_processed_block(), h(50));

        assert!(state.apply_backfill(h(51), h(59)));
        state.observe_head(h(62)).unwrap();
        assert_eq!(state.latest_processed_block(), h(61));
        assert!(!state.needs_historic_backfill());
    }

    #[test]
    fn discontinuity_starts_a_new_run() {
        let mut state = streaming(59, &[60, 61, 62]);
        assert_eq!(state.latest_processed_block(), h(61));

        state.observe_head(h(70)).unwrap();
        assert_eq!(state.latest_processed_block(), h(62));
        assert_eq!(state.live_run_start(), Some(h(70)));
        assert_eq!(state.first_streamed_block(), Some(h(60)));
        assert_eq!(state.backfill_range(), Some((h(63), h(69))));
    }

    #[test]
    fn stale_backfill_is_rejected() {
        let mut state = streaming(100, &[105]);
        assert!(state.apply_backfill(h(101), h(104)));
        assert!(!state.apply_backfill(h(101), h(104)), "already applied");

        let mut state = streaming(100, &[105]);
        assert!(!state.apply_backfill(h(101), h(105)), "reaches into the live run");
        assert!(!state.apply_backfill(h(102), h(104)), "leaves a hole");
        assert_eq!(state.latest_processed_block(), h(100));
    }

    #[test]
    fn backfill_before_any_head_is_rejected() {
        let mut state = ProcessorState::new(h(10));
        assert!(!state.apply_backfill(h(11), h(12)));
    }
}
