// =============================================================================
// Fill Sequencer — per-position reorder buffer for exchange fills
// =============================================================================
//
// The exchange numbers the fills of one position from 1. Fills arriving ahead
// of a gap are held back until the gap closes; a fill whose number was already
// applied is a duplicate from at-least-once delivery. If the buffer grows past
// its bound the gap is given up on and everything buffered is released in
// sequence order.
// =============================================================================

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::FillEvent;

#[derive(Debug)]
pub struct FillSequencer {
    next_expected: u64,
    pending: BTreeMap<u64, FillEvent>,
    max_pending: usize,
}

impl FillSequencer {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_expected: 1,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one fill; returns the fills that may now be applied, in order.
    /// Unsequenced fills pass straight through.
    pub fn accept(&mut self, fill: FillEvent) -> EngineResult<Vec<FillEvent>> {
        let Some(seq) = fill.sequence else {
            return Ok(vec![fill]);
        };

        if seq < self.next_expected || self.pending.contains_key(&seq) {
            return Err(EngineError::StaleEvent {
                symbol: fill.handle.symbol.clone(),
                detail: format!("duplicate fill sequence {seq} for {}", fill.handle),
            });
        }

        if seq > self.next_expected {
            debug!(
                handle = %fill.handle,
                seq,
                expected = self.next_expected,
                "fill ahead of sequence, buffering"
            );
            let symbol = fill.handle.symbol.clone();
            self.pending.insert(seq, fill);
            if self.pending.len() > self.max_pending {
                warn!(
                    symbol = %symbol,
                    expected = self.next_expected,
                    buffered = self.pending.len(),
                    "fill gap never closed, flushing buffered fills in order"
                );
                return Ok(self.flush());
            }
            return Ok(Vec::new());
        }

        let mut ready = vec![fill];
        self.next_expected += 1;
        while let Some(next) = self.pending.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected += 1;
        }
        Ok(ready)
    }

    fn flush(&mut self) -> Vec<FillEvent> {
        let drained = std::mem::take(&mut self.pending);
        if let Some(last) = drained.keys().next_back() {
            self.next_expected = last + 1;
        }
        drained.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderHandle;

    fn fill(seq: Option<u64>) -> FillEvent {
        FillEvent {
            handle: OrderHandle::new("BTCUSDT", format!("o-{}", seq.unwrap_or(0))),
            fill_price: 100.0,
            filled_size: 1.0,
            timestamp: 0,
            sequence: seq,
        }
    }

    fn seqs(fills: &[FillEvent]) -> Vec<u64> {
        fills.iter().filter_map(|f| f.sequence).collect()
    }

    #[test]
    fn in_order_fills_pass_through() {
        let mut s = FillSequencer::new(8);
        assert_eq!(seqs(&s.accept(fill(Some(1))).unwrap()), vec![1]);
        assert_eq!(seqs(&s.accept(fill(Some(2))).unwrap()), vec![2]);
    }

    #[test]
    fn gap_is_buffered_until_filled() {
        let mut s = FillSequencer::new(8);
        assert!(s.accept(fill(Some(2))).unwrap().is_empty());
        assert!(s.accept(fill(Some(3))).unwrap().is_empty());
        assert_eq!(s.pending_len(), 2);
        assert_eq!(seqs(&s.accept(fill(Some(1))).unwrap()), vec![1, 2, 3]);
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn duplicates_are_stale() {
        let mut s = FillSequencer::new(8);
        s.accept(fill(Some(1))).unwrap();
        assert!(s.accept(fill(Some(1))).unwrap_err().is_stale());

        s.accept(fill(Some(3))).unwrap();
        assert!(s.accept(fill(Some(3))).unwrap_err().is_stale());
    }

    #[test]
    fn overflow_flushes_in_order() {
        let mut s = FillSequencer::new(2);
        assert!(s.accept(fill(Some(4))).unwrap().is_empty());
        assert!(s.accept(fill(Some(3))).unwrap().is_empty());
        assert_eq!(seqs(&s.accept(fill(Some(5))).unwrap()), vec![3, 4, 5]);
        // Late arrival of the missing fill is now stale.
        assert!(s.accept(fill(Some(1))).unwrap_err().is_stale());
        assert_eq!(seqs(&s.accept(fill(Some(6))).unwrap()), vec![6]);
    }

    #[test]
    fn unsequenced_fills_apply_immediately() {
        let mut s = FillSequencer::new(2);
        s.accept(fill(Some(2))).unwrap();
        assert_eq!(s.accept(fill(None)).unwrap().len(), 1);
        assert_eq!(s.pending_len(), 1);
    }
}
