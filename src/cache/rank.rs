//! Approximate rank selection over access counters.
//!
//! Возвращает «потолок» c: примерно `target` счётчиков строго меньше c,
//! и никогда меньше `target`. Гистограмма на BUCKETS корзин, затем
//! уточнение внутри корзины, где накопленная сумма пересекла target.
//! После MAX_PASSES проходов берётся верхняя граница корзины (перелёт вверх).
//! Равные счётчики на границе выселяются вместе.

const BUCKETS: usize = 64;
const MAX_PASSES: usize = 4;

/// Smallest (approximately) `c` such that at least `target` of `counts` are `< c`.
/// `target == 0` yields the minimum (nothing below it); `target >= len` yields max + 1.
pub fn access_ceiling(counts: &[u64], target: usize) -> u64 {
    let (mut lo, max) = match (counts.iter().min(), counts.iter().max()) {
        (Some(&a), Some(&b)) => (a, b),
        _ => return 0,
    };
    if target == 0 {
        return lo;
    }
    if target >= counts.len() {
        return max.saturating_add(1);
    }
    // Search window [lo, hi): the answer lies in (lo, hi].
    let mut hi = max.saturating_add(1);
    // Count of values strictly below `lo`.
    let mut below = 0usize;

    for _ in 0..MAX_PASSES {
        let width = hi - lo;
        if width <= 1 {
            return hi;
        }
        let step = width.div_ceil(BUCKETS as u64).max(1);
        let mut hist = [0usize; BUCKETS];
        for &c in counts {
            if c >= lo && c < hi {
                hist[((c - lo) / step) as usize] += 1;
            }
        }
        let mut acc = below;
        let mut found = None;
        for (i, n) in hist.iter().enumerate() {
            if acc + n >= target {
                found = Some(i);
                break;
            }
            acc += n;
        }
        let i = match found {
            Some(i) => i,
            None => return hi,
        };
        let b_lo = lo + step * i as u64;
        let b_hi = (b_lo + step).min(hi);
        if step == 1 {
            // Exact: values equal to b_lo complete the target.
            return b_lo + 1;
        }
        lo = b_lo;
        hi = b_hi;
        below = acc;
    }
    hi
}

#[cfg(test)]
mod tests {
    use super::*;

    fn below(counts: &[u64], c: u64) -> usize {
        counts.iter().filter(|&&x| x < c).count()
    }

    #[test]
    fn small_exact() {
        assert_eq!(access_ceiling(&[1, 2], 1), 2);
        assert_eq!(access_ceiling(&[2, 1], 1), 2);
        assert_eq!(access_ceiling(&[5, 5, 5, 5], 2), 6);
        assert_eq!(access_ceiling(&[3, 9], 0), 3);
        assert_eq!(access_ceiling(&[3, 9], 2), 10);
        assert_eq!(access_ceiling(&[], 3), 0);
    }

    #[test]
    fn wide_ranges_never_undershoot() {
        let mut rng = oorandom::Rand64::new(0x5eed);
        for _ in 0..50 {
            let n = 1 + (rng.rand_u64() % 500) as usize;
            let counts: Vec<u64> = (0..n).map(|_| rng.rand_u64() % 1_000_000_000).collect();
            let target = (n / 2).max(1);
            let c = access_ceiling(&counts, target);
            assert!(below(&counts, c) >= target);
            // approximate, but never wildly over
            assert!(below(&counts, c) <= n);
        }
    }

    #[test]
    fn dense_range_is_exact() {
        let counts: Vec<u64> = (0..40).collect();
        for target in 1..40 {
            let c = access_ceiling(&counts, target);
            assert_eq!(below(&counts, c), target);
        }
    }
}
