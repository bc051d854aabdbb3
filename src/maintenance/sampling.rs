use bitvec::{bitvec, vec::BitVec};
use rand::Rng;
use rand_distr::{Binomial, Distribution};

use crate::error::{KdeError, Result};

/// Draws from Binomial(n, p). `p` is clamped to [0, 1].
pub fn binomial(rng: &mut impl Rng, n: u64, p: f64) -> Result<u64> {
    let distribution = Binomial::new(n, p.clamp(0.0, 1.0))
        .map_err(|e| KdeError::InvalidArgument(format!("binomial({}, {}): {}", n, p, e)))?;
    Ok(distribution.sample(rng))
}

/// How many sample slots a newly inserted row takes over, so the sample stays
/// a uniform sample of the grown table.
pub fn replacement_count(rng: &mut impl Rng, sample_size: usize, rows_in_table: u64) -> Result<usize> {
    let p = if rows_in_table == 0 { 1.0 } else { 1.0 / rows_in_table as f64 };
    Ok(binomial(rng, sample_size as u64, p)? as usize)
}

/// Robert Floyd's algorithm: `m` distinct positions out of `n`, each subset
/// equally likely, in `m` draws.
pub fn floyd_sample(rng: &mut impl Rng, n: usize, m: usize) -> BitVec {
    let mut chosen = bitvec![0; n];
    let m = m.min(n);
    for j in (n - m + 1)..=n {
        let t = rng.gen_range(1..=j);
        if chosen[t - 1] {
            chosen.set(j - 1, true);
        } else {
            chosen.set(t - 1, true);
        }
    }
    chosen
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn floyd_picks_exactly_m() {
        let mut rng = StdRng::seed_from_u64(7);
        for (n, m) in [(10, 0), (10, 3), (10, 10), (1, 1), (1000, 17)] {
            let chosen = floyd_sample(&mut rng, n, m);
            assert_eq!(chosen.len(), n);
            assert_eq!(chosen.count_ones(), m, "n = {}, m = {}", n, m);
        }
        // More than there is selects everything
        assert_eq!(floyd_sample(&mut rng, 5, 9).count_ones(), 5);
    }

    #[test]
    fn floyd_is_roughly_uniform() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut hits = [0u32; 8];
        for _ in 0..8000 {
            for position in floyd_sample(&mut rng, 8, 2).iter_ones() {
                hits[position] += 1;
            }
        }
        // Every position is expected 2000 times
        for (position, count) in hits.iter().enumerate() {
            assert!((1800..2200).contains(count), "position {}: {}", position, count);
        }
    }

    #[test]
    fn replacement_count_tracks_table_size() {
        let mut rng = StdRng::seed_from_u64(9);
        // Empty table, the first row takes every slot
        assert_eq!(replacement_count(&mut rng, 64, 0).unwrap(), 64);
        assert_eq!(replacement_count(&mut rng, 64, 1).unwrap(), 64);
        let total: usize = (0..2000).map(|_| replacement_count(&mut rng, 100, 1000).unwrap()).sum();
        // 2000 draws with mean 0.1
        assert!((150..250).contains(&total), "{}", total);
    }

    #[test]
    fn binomial_clamps_probability() {
        let mut rng = StdRng::seed_from_u64(10);
        assert_eq!(binomial(&mut rng, 10, 0.0).unwrap(), 0);
        assert_eq!(binomial(&mut rng, 10, 2.0).unwrap(), 10);
    }
}
