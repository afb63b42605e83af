//! The order in which boards are polled after an external interrupt.
//!
//! Boards which recently had something to say are kept at the front of the
//! list (the active partition) so they are found quickly next time.  While
//! a sweep runs, boards are only marked active or passive.  The list is
//! re-partitioned afterwards, moving only the boards whose status changed.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};

use crate::constants::MAX_BOARD_COUNT;

const ACTIVE: u8 = 0x80;
const ID_MASK: u8 = 0x3F;

/// The outcome of moving the poll cursor on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollStep {
    /// Poll this board next.
    Board(u8),
    /// Every board has been polled.
    Exhausted,
}

pub struct PollList {
    // The second half is scratch space for rearranging.
    list: [u8; 2 * MAX_BOARD_COUNT],
    // None while the poll sentinel is outstanding, before the first board
    // is polled.
    cursor: Option<usize>,
    active_count: usize,
    needs_rearrange: bool,
}

impl Default for PollList {
    fn default() -> Self {
        Self::new()
    }
}

impl PollList {
    /// Creates a list with every board passive, in board id order.
    pub const fn new() -> Self {
        let mut list = [0; 2 * MAX_BOARD_COUNT];
        let mut i = 0;
        while i < MAX_BOARD_COUNT {
            list[i] = i as u8;
            i += 1;
        }
        Self {
            list,
            cursor: None,
            active_count: 0,
            needs_rearrange: false,
        }
    }

    /// Marks every board passive and restores board id order.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Prepares for a new sweep, starting with the poll sentinel.  Changes
    /// left over from the previous sweep are applied first.
    pub fn start_sweep(&mut self) {
        self.rearrange();
        self.cursor = None;
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Whether the poll sentinel, rather than a board, is outstanding.
    pub fn on_sentinel(&self) -> bool {
        self.cursor.is_none()
    }

    /// The board under the cursor.
    pub fn current_board(&self) -> Option<u8> {
        match self.cursor {
            Some(cur) if cur < MAX_BOARD_COUNT => Some(self.list[cur] & ID_MASK),
            _ => None,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn needs_rearrange(&self) -> bool {
        self.needs_rearrange
    }

    /// Marks the board under the cursor as active or passive.  Flags the
    /// list for rearrangement if the board is now in the wrong partition.
    pub fn mark_active(&mut self, active: bool) {
        let Some(cur) = self.cursor.filter(|&cur| cur < MAX_BOARD_COUNT) else {
            return;
        };

        if active {
            self.list[cur] |= ACTIVE;
        } else {
            self.list[cur] &= !ACTIVE;
        }

        if active && cur >= self.active_count {
            debug!("Board {=u8:#x} active", self.list[cur] & ID_MASK);
            self.needs_rearrange = true;
        } else if !active && cur < self.active_count {
            debug!("Board {=u8:#x} passive", self.list[cur] & ID_MASK);
            self.needs_rearrange = true;
        }
    }

    /// Moves the cursor to the next board.
    pub fn advance(&mut self) -> PollStep {
        let next = self.cursor.map_or(0, |cur| cur.saturating_add(1));
        self.cursor = Some(next.min(MAX_BOARD_COUNT));
        match self.current_board() {
            Some(board) => PollStep::Board(board),
            None => PollStep::Exhausted,
        }
    }

    /// Re-partitions the list into `[active | passive]`, if any board
    /// changed status.  Only the part of the list polled so far (or the
    /// active partition, if larger) is examined.
    ///
    /// Resulting order: unchanged active, newly active, newly passive,
    /// unchanged passive, then boards not yet polled.
    pub fn rearrange(&mut self) {
        if !self.needs_rearrange {
            return;
        }
        self.needs_rearrange = false;

        let polled = self.cursor.map_or(0, |cur| cur.saturating_add(1));
        let n = polled.min(MAX_BOARD_COUNT).max(self.active_count);
        let active_count = self.active_count;

        let mut new_active = 0;
        let mut new_passive = 0;
        let mut j = MAX_BOARD_COUNT;

        // Newly active, from the old passive partition.
        for i in active_count..n {
            if self.list[i] & ACTIVE != 0 {
                self.list[j] = self.list[i];
                j += 1;
                new_active += 1;
            }
        }

        // Newly passive, from the old active partition.
        for i in 0..active_count {
            if self.list[i] & ACTIVE == 0 {
                self.list[j] = self.list[i];
                j += 1;
                new_passive += 1;
            }
        }

        // Unchanged passive.
        for i in active_count..n {
            if self.list[i] & ACTIVE == 0 {
                self.list[j] = self.list[i];
                j += 1;
            }
        }

        // Unchanged active are compacted in place at the front, then the
        // scratch area follows them.
        let mut k = 0;
        for i in 0..active_count {
            if self.list[i] & ACTIVE != 0 {
                self.list[k] = self.list[i];
                k += 1;
            }
        }
        self.list.copy_within(MAX_BOARD_COUNT..j, k);

        self.active_count = active_count + new_active - new_passive;
        debug!(
            "Active boards {}+{}-{}",
            active_count, new_active, new_passive
        );
    }

    /// Board ids in the active partition, in poll order.
    pub fn active_boards(&self) -> impl Iterator<Item = u8> + '_ {
        self.list[..self.active_count].iter().map(|b| b & ID_MASK)
    }

    /// Board ids in the passive partition, in poll order.
    pub fn passive_boards(&self) -> impl Iterator<Item = u8> + '_ {
        self.list[self.active_count..MAX_BOARD_COUNT]
            .iter()
            .map(|b| b & ID_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sweeps the whole list, marking boards for which `is_active` is true.
    fn sweep(list: &mut PollList, is_active: impl Fn(u8) -> bool) {
        list.start_sweep();
        while let PollStep::Board(board) = list.advance() {
            list.mark_active(is_active(board));
        }
        list.rearrange();
    }

    fn check_partition(list: &PollList) {
        let flagged = list.list[..MAX_BOARD_COUNT]
            .iter()
            .filter(|b| *b & ACTIVE != 0)
            .count();
        assert_eq!(flagged, list.active_count());
        assert!(list.list[..list.active_count].iter().all(|b| b & ACTIVE != 0));
        assert!(
            list.list[list.active_count..MAX_BOARD_COUNT]
                .iter()
                .all(|b| b & ACTIVE == 0)
        );
        let mut ids: Vec<u8> = list.active_boards().chain(list.passive_boards()).collect();
        ids.sort();
        assert_eq!(ids, (0..MAX_BOARD_COUNT as u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_new_list() {
        let list = PollList::new();
        assert_eq!(list.active_count(), 0);
        assert!(list.on_sentinel());
        assert_eq!(list.current_board(), None);
        assert_eq!(list.passive_boards().next(), Some(0));
        check_partition(&list);
    }

    #[test]
    fn test_advance_and_exhaust() {
        let mut list = PollList::new();
        for board in 0..MAX_BOARD_COUNT as u8 {
            assert_eq!(list.advance(), PollStep::Board(board));
        }
        assert_eq!(list.advance(), PollStep::Exhausted);
        assert_eq!(list.advance(), PollStep::Exhausted);
        assert_eq!(list.current_board(), None);
    }

    #[test]
    fn test_mark_on_sentinel_is_ignored() {
        let mut list = PollList::new();
        list.mark_active(true);
        assert!(!list.needs_rearrange());
    }

    #[test]
    fn test_active_boards_move_to_front_in_order() {
        let mut list = PollList::new();
        sweep(&mut list, |b| b == 7 || b == 3 || b == 40);
        assert_eq!(list.active_count(), 3);
        assert_eq!(list.active_boards().collect::<Vec<_>>(), vec![3, 7, 40]);
        let passive: Vec<u8> = list.passive_boards().take(4).collect();
        assert_eq!(passive, vec![0, 1, 2, 4]);
        check_partition(&list);
    }

    #[test]
    fn test_status_changes_move_between_partitions() {
        let mut list = PollList::new();
        sweep(&mut list, |b| b == 3 || b == 7 || b == 40);

        // 7 goes quiet, 10 becomes active.
        sweep(&mut list, |b| b == 3 || b == 40 || b == 10);
        assert_eq!(list.active_boards().collect::<Vec<_>>(), vec![3, 40, 10]);
        // 7 is the first passive board, as it changed status.
        assert_eq!(list.passive_boards().next(), Some(7));
        check_partition(&list);
    }

    #[test]
    fn test_partial_sweep_rearranges_polled_part() {
        let mut list = PollList::new();
        list.start_sweep();
        for _ in 0..5 {
            list.advance();
        }
        // Board 4 answers with a message, so the sweep ends here.
        list.mark_active(true);
        list.rearrange();
        assert_eq!(list.active_boards().collect::<Vec<_>>(), vec![4]);
        assert_eq!(
            list.passive_boards().take(6).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 5, 6]
        );
        check_partition(&list);
    }

    #[test]
    fn test_partition_invariant_under_many_sweeps() {
        let mut list = PollList::new();
        let mut seed: u32 = 0x1234_5678;
        for _ in 0..50 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let pattern = u64::from(seed) << 32 | u64::from(seed.rotate_left(7));
            sweep(&mut list, |b| pattern & (1 << b) != 0);
            check_partition(&list);
            assert_eq!(list.active_count(), pattern.count_ones() as usize);
        }
    }

    #[test]
    fn test_reset() {
        let mut list = PollList::new();
        sweep(&mut list, |b| b % 2 == 0);
        list.reset();
        assert_eq!(list.active_count(), 0);
        assert_eq!(list.passive_boards().collect::<Vec<_>>(), (0..64).collect::<Vec<u8>>());
    }
}
