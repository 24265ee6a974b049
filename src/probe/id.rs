use std::sync::atomic::{AtomicU16, Ordering};

/// Upper bound (exclusive) for allocated identifiers. The window above it
/// is left free for identifiers chosen outside this process.
const ID_CEILING: u16 = 65500;

/// Process-wide rolling allocator of ICMP Echo identifiers.
///
/// Echo replies are demultiplexed on (identifier, sequence), so two live
/// exchanges must never share an identifier. The sequence produced is
/// `1, 2, .., 65499, 1, 2, ..` — zero is never handed out.
#[derive(Debug, Default)]
pub struct IcmpIdSequence {
    counter: AtomicU16,
}

impl IcmpIdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next free identifier.
    pub fn next(&self) -> u16 {
        loop {
            let val = self.counter.load(Ordering::Acquire);
            // Uninitialized counter starts the sequence at 1
            if val == 0 {
                if self
                    .counter
                    .compare_exchange(0, 2, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return 1;
                }
                continue;
            }
            // Rollover: whoever observes the ceiling restarts the sequence
            if val >= ID_CEILING {
                if self
                    .counter
                    .compare_exchange(val, 2, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return 1;
                }
                continue;
            }
            if self
                .counter
                .compare_exchange(val, val + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return val;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence_starts_at_one() {
        let ids = IcmpIdSequence::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn test_rollover_skips_zero() {
        let ids = IcmpIdSequence::new();
        ids.counter.store(65499, Ordering::Release);
        assert_eq!(ids.next(), 65499);
        // Counter now sits at the ceiling; the next call restarts at 1
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn test_concurrent_callers_get_distinct_ids() {
        let ids = Arc::new(IcmpIdSequence::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = ids.clone();
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| ids.next()).collect::<Vec<u16>>()
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert_ne!(id, 0);
                assert!(id < ID_CEILING);
                // 4000 < 65499, so no wraparound: all values distinct
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
    }
}
