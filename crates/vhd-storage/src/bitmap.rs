//! Per-block sector bitmaps (MSB-first) and run coalescing.

pub fn test_bit(map: &[u8], bit: u64) -> bool {
    map.get((bit / 8) as usize)
        .is_some_and(|b| b & (0x80 >> (bit % 8)) != 0)
}

pub fn set_bit(map: &mut [u8], bit: u64) {
    if let Some(b) = map.get_mut((bit / 8) as usize) {
        *b |= 0x80 >> (bit % 8);
    }
}

/// True when the first `bits` bits are all set.
pub fn all_set(map: &[u8], bits: u64) -> bool {
    let full = (bits / 8) as usize;
    if map.len() < bits.div_ceil(8) as usize {
        return false;
    }
    if !map[..full].iter().all(|b| *b == 0xff) {
        return false;
    }
    (full as u64 * 8..bits).all(|bit| test_bit(map, bit))
}

/// Maximal run of consecutive sectors sharing one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: u64,
    pub len: u64,
    pub set: bool,
}

impl Run {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Iterator over maximal runs of `state(i)` for `i` in `start..start + count`.
pub struct Runs<F> {
    state: F,
    next: u64,
    end: u64,
}

impl<F: Fn(u64) -> bool> Iterator for Runs<F> {
    type Item = Run;

    fn next(&mut self) -> Option<Run> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let set = (self.state)(start);
        let mut i = start + 1;
        while i < self.end && (self.state)(i) == set {
            i += 1;
        }
        self.next = i;
        Some(Run {
            start,
            len: i - start,
            set,
        })
    }
}

pub fn runs_by<F: Fn(u64) -> bool>(start: u64, count: u64, state: F) -> Runs<F> {
    Runs {
        state,
        next: start,
        end: start.saturating_add(count),
    }
}

/// Runs of set/unset bits of `map` within `start..start + count`.
pub fn runs(map: &[u8], start: u64, count: u64) -> Runs<impl Fn(u64) -> bool + '_> {
    runs_by(start, count, move |bit| test_bit(map, bit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_msb_first() {
        let mut map = [0u8; 2];
        set_bit(&mut map, 0);
        set_bit(&mut map, 9);
        assert_eq!(map, [0x80, 0x40]);
        assert!(test_bit(&map, 0));
        assert!(!test_bit(&map, 1));
        assert!(!test_bit(&map, 100));
    }

    #[test]
    fn runs_coalesce_equal_states() {
        // sectors 0..3 set, 3..6 clear, 6..8 set
        let map = [0b1110_0011u8];
        let got: Vec<Run> = runs(&map, 0, 8).collect();
        assert_eq!(
            got,
            vec![
                Run { start: 0, len: 3, set: true },
                Run { start: 3, len: 3, set: false },
                Run { start: 6, len: 2, set: true },
            ]
        );
        let got: Vec<Run> = runs(&map, 2, 3).collect();
        assert_eq!(
            got,
            vec![
                Run { start: 2, len: 1, set: true },
                Run { start: 3, len: 2, set: false },
            ]
        );
    }

    #[test]
    fn all_set_checks_partial_bytes() {
        assert!(all_set(&[0xff, 0xe0], 11));
        assert!(!all_set(&[0xff, 0xc0], 11));
        assert!(!all_set(&[0xff], 9));
    }
}
