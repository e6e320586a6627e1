//! Order key generation.
//!
//! Sibling order keys are opaque bytes the engine only ever compares
//! lexicographically. Producers mint them here as the digits of a base-256
//! fraction in (0, 1), canonicalized by forbidding a trailing zero byte.
//! Under that invariant byte order and numeric order agree: a key extended
//! by more digits sorts after the shorter key, exactly as the larger
//! fraction should.
//!
//! Keys stay dense. Splitting an interval halves the first digit gap; when
//! two keys differ by a single digit the split keeps the lower digit and
//! recurses into the next position, growing the key by one byte at worst.

const MID: u8 = 0x80;

/// Mints a key strictly between `left` and `right`.
///
/// `None` on the left means "before the first sibling", `None` on the right
/// "after the last". Passed keys must be canonical (no trailing zero) and
/// in order.
pub fn between(left: Option<&[u8]>, right: Option<&[u8]>) -> Vec<u8> {
    match (left, right) {
        (None, None) => vec![MID],
        (Some(left), None) => after(left),
        (None, Some(right)) => before(right),
        (Some(left), Some(right)) => split(left, right),
    }
}

/// A key above `key`, as short as the headroom allows.
fn after(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    for &digit in key {
        if digit == u8::MAX {
            out.push(digit);
            continue;
        }
        // halve the gap between this digit and the top of its range
        out.push(digit + (u8::MAX - digit) / 2 + 1);
        return out;
    }
    out.push(MID);
    out
}

/// A key between zero and `key`.
fn before(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    for &digit in key {
        if digit < 2 {
            // no room at this position, descend
            out.push(0);
            continue;
        }
        out.push(digit / 2);
        return out;
    }
    out.push(MID);
    out
}

/// A key splitting the open interval (`left`, `right`).
fn split(left: &[u8], right: &[u8]) -> Vec<u8> {
    debug_assert!(left < right);
    let mut out = Vec::with_capacity(right.len() + 1);
    for (i, &hi) in right.iter().enumerate() {
        let lo = left.get(i).copied().unwrap_or(0);
        if hi - lo >= 2 {
            out.push(lo + (hi - lo) / 2);
            return out;
        }
        out.push(lo);
        if hi > lo {
            // adjacent digits: everything prefixed by the lower digit sits
            // below `right`, so only the tail of `left` still constrains
            let rest = left.get(i + 1..).unwrap_or(&[]);
            out.extend_from_slice(&after(rest));
            return out;
        }
    }
    // canonical inputs with left < right never exhaust `right` first
    out.push(MID);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn canonical(key: &[u8]) -> bool {
        key.last() != Some(&0)
    }

    #[test]
    fn first_key_and_neighbours() {
        let first = between(None, None);
        assert_eq!(first, vec![0x80]);
        let later = between(Some(&first), None);
        assert!(later > first);
        let earlier = between(None, Some(&first));
        assert!(!earlier.is_empty() && earlier < first);
        let mid = between(Some(&earlier), Some(&later));
        assert!(earlier < mid && mid < later);
    }

    #[test]
    fn adjacent_digits_descend() {
        // 0x05 and 0x06 leave no single-byte gap
        let key = between(Some(&[0x05]), Some(&[0x06]));
        assert_eq!(key, vec![0x05, 0x80]);
        // a saturated left tail keeps descending
        let key = between(Some(&[0x05, 0xff]), Some(&[0x06]));
        assert_eq!(key, vec![0x05, 0xff, 0x80]);
        assert!(key > vec![0x05, 0xff] && key < vec![0x06]);
    }

    #[test]
    fn top_of_range_extends() {
        let key = between(Some(&[0xff]), None);
        assert_eq!(key, vec![0xff, 0x80]);
        let key = between(None, Some(&[0x00, 0x01]));
        assert!(canonical(&key));
        assert!(key < vec![0x00, 0x01]);
    }

    #[test]
    fn repeated_inserts_stay_ordered() {
        // push a hundred keys at the front, back and every second midpoint
        let mut keys = vec![between(None, None)];
        for i in 0..100 {
            let key = match i % 3 {
                0 => between(None, Some(keys.first().unwrap())),
                1 => between(Some(keys.last().unwrap()), None),
                _ => {
                    let at = keys.len() / 2;
                    between(Some(&keys[at - 1]), Some(&keys[at]))
                }
            };
            match i % 3 {
                0 => keys.insert(0, key),
                1 => keys.push(key),
                _ => keys.insert(keys.len() / 2, key),
            }
        }
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(keys.iter().all(|k| canonical(k)));
    }

    fn arb_key() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 0..6).prop_map(|mut key| {
            while key.last() == Some(&0) {
                key.pop();
            }
            if key.is_empty() {
                key.push(MID);
            }
            key
        })
    }

    proptest! {
        #[test]
        fn after_is_greater(key in arb_key()) {
            let next = after(&key);
            prop_assert!(next > key);
            prop_assert!(canonical(&next));
        }

        #[test]
        fn before_is_smaller(key in arb_key()) {
            let prev = before(&key);
            prop_assert!(!prev.is_empty());
            prop_assert!(prev < key);
            prop_assert!(canonical(&prev));
        }

        #[test]
        fn split_is_strictly_inside(a in arb_key(), b in arb_key()) {
            if a != b {
                let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                let mid = split(&lo, &hi);
                prop_assert!(lo < mid, "{:?} !< {:?}", lo, mid);
                prop_assert!(mid < hi, "{:?} !< {:?}", mid, hi);
                prop_assert!(canonical(&mid));
            }
        }

        #[test]
        fn splitting_halves_converges(seed in arb_key()) {
            // drive a key-pair together and make sure room never runs out
            let mut lo = seed;
            let mut hi = after(&lo);
            for _ in 0..64 {
                let mid = split(&lo, &hi);
                prop_assert!(lo < mid && mid < hi);
                hi = mid;
            }
        }
    }
}
