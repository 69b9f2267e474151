use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

/// Anything a selector can weigh.
pub trait Weighted {
    fn weight(&self) -> u32;
}

impl<T: Weighted + ?Sized> Weighted for Arc<T> {
    fn weight(&self) -> u32 {
        (**self).weight()
    }
}

/// Endpoint selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SelectType {
    /// Uniform pick
    Random,
    /// Pick proportional to declared weight
    #[default]
    WeightedRandom,
    /// Rotating cursor over the candidates
    RoundRobin,
    /// Fixed position in the candidate list
    Specified,
}

impl SelectType {
    /// Stable numeric code, used in option fingerprints.
    pub fn code(&self) -> i32 {
        match self {
            SelectType::Random => 0,
            SelectType::WeightedRandom => 1,
            SelectType::RoundRobin => 2,
            SelectType::Specified => 3,
        }
    }
}

impl fmt::Display for SelectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectType::Random => "random",
            SelectType::WeightedRandom => "weighted-random",
            SelectType::RoundRobin => "round-robin",
            SelectType::Specified => "specified",
        };
        f.write_str(name)
    }
}

impl FromStr for SelectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(SelectType::Random),
            "weighted-random" => Ok(SelectType::WeightedRandom),
            "round-robin" => Ok(SelectType::RoundRobin),
            "specified" => Ok(SelectType::Specified),
            other => Err(format!("unknown select type '{}'", other)),
        }
    }
}

/// Picks at most one candidate per call, with a policy fixed at construction.
///
/// Selection never modifies the candidate list. Only round-robin keeps state
/// (its cursor); since the list may change between calls the rotation is
/// best-effort fairness, not a strict guarantee.
#[derive(Debug)]
pub struct Selector {
    kind: SelectType,
    index: Option<usize>,
    cursor: AtomicUsize,
}

impl Selector {
    /// `index` is only consulted by [`SelectType::Specified`].
    pub fn new(kind: SelectType, index: Option<usize>) -> Self {
        Self {
            kind,
            index,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> SelectType {
        self.kind
    }

    pub fn select<'a, T: Weighted>(&self, candidates: &'a [T]) -> Option<&'a T> {
        self.select_with(candidates, &mut rand::thread_rng())
    }

    /// Same as [`select`](Self::select) with a caller-provided random source.
    pub fn select_with<'a, T: Weighted, R: Rng + ?Sized>(
        &self,
        candidates: &'a [T],
        rng: &mut R,
    ) -> Option<&'a T> {
        if candidates.is_empty() {
            return None;
        }
        match self.kind {
            SelectType::Random => candidates.get(rng.gen_range(0..candidates.len())),
            SelectType::WeightedRandom => weighted_random(candidates, rng),
            SelectType::RoundRobin => {
                let next = self.cursor.fetch_add(1, Ordering::Relaxed);
                candidates.get(next % candidates.len())
            }
            SelectType::Specified => self.index.and_then(|index| candidates.get(index)),
        }
    }
}

fn weighted_random<'a, T, R>(candidates: &'a [T], rng: &mut R) -> Option<&'a T>
where
    T: Weighted,
    R: Rng + ?Sized,
{
    let total: u64 = candidates.iter().map(|c| u64::from(c.weight())).sum();
    if total == 0 {
        return None;
    }

    let draw = rng.gen_range(0..total);
    let mut acc = 0u64;
    for candidate in candidates {
        acc += u64::from(candidate.weight());
        if draw < acc {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[derive(Debug, PartialEq)]
    struct Node {
        name: &'static str,
        weight: u32,
    }

    impl Weighted for Node {
        fn weight(&self) -> u32 {
            self.weight
        }
    }

    fn nodes(weights: &[(&'static str, u32)]) -> Vec<Node> {
        weights
            .iter()
            .map(|&(name, weight)| Node { name, weight })
            .collect()
    }

    #[test]
    fn test_empty_candidates() {
        let empty: Vec<Node> = Vec::new();
        for kind in [
            SelectType::Random,
            SelectType::WeightedRandom,
            SelectType::RoundRobin,
            SelectType::Specified,
        ] {
            assert!(Selector::new(kind, Some(0)).select(&empty).is_none());
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let list = nodes(&[("a", 1), ("b", 1), ("c", 1)]);
        let selector = Selector::new(SelectType::RoundRobin, None);
        let picked: Vec<_> = (0..6)
            .map(|_| selector.select(&list).unwrap().name)
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_survives_shrinking_list() {
        let selector = Selector::new(SelectType::RoundRobin, None);
        let three = nodes(&[("a", 1), ("b", 1), ("c", 1)]);
        selector.select(&three);
        selector.select(&three);
        let one = nodes(&[("a", 1)]);
        assert_eq!(selector.select(&one).unwrap().name, "a");
    }

    #[test]
    fn test_specified_by_position() {
        let list = nodes(&[("a", 1), ("b", 1)]);
        assert_eq!(
            Selector::new(SelectType::Specified, Some(1))
                .select(&list)
                .unwrap()
                .name,
            "b"
        );
        assert!(Selector::new(SelectType::Specified, Some(2))
            .select(&list)
            .is_none());
        assert!(Selector::new(SelectType::Specified, None)
            .select(&list)
            .is_none());
    }

    #[test]
    fn test_weighted_zero_total() {
        let list = nodes(&[("a", 0), ("b", 0)]);
        assert!(Selector::new(SelectType::WeightedRandom, None)
            .select(&list)
            .is_none());
    }

    #[test]
    fn test_weighted_skips_zero_weight() {
        let list = nodes(&[("a", 0), ("b", 5), ("c", 0)]);
        let selector = Selector::new(SelectType::WeightedRandom, None);
        for _ in 0..100 {
            assert_eq!(selector.select(&list).unwrap().name, "b");
        }
    }

    #[test]
    fn test_weighted_converges_to_weight_share() {
        let list = nodes(&[("a", 10), ("b", 30), ("c", 60)]);
        let selector = Selector::new(SelectType::WeightedRandom, None);
        let mut rng = StdRng::seed_from_u64(7);
        const SAMPLES: usize = 100_000;

        let mut counts = [0usize; 3];
        for _ in 0..SAMPLES {
            let picked = selector.select_with(&list, &mut rng).unwrap();
            let slot = list.iter().position(|n| n == picked).unwrap();
            counts[slot] += 1;
        }

        for (node, count) in list.iter().zip(counts) {
            let expected = node.weight as f64 / 100.0;
            let observed = count as f64 / SAMPLES as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "{}: observed {:.4}, expected {:.4}",
                node.name,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_random_hits_everyone() {
        let list = nodes(&[("a", 1), ("b", 1), ("c", 1)]);
        let selector = Selector::new(SelectType::Random, None);
        let mut rng = StdRng::seed_from_u64(1);
        let mut seen = [false; 3];
        for _ in 0..300 {
            let picked = selector.select_with(&list, &mut rng).unwrap();
            seen[list.iter().position(|n| n == picked).unwrap()] = true;
        }
        assert_eq!(seen, [true; 3]);
    }

    #[test]
    fn test_select_type_display_and_default() {
        assert_eq!(SelectType::default(), SelectType::WeightedRandom);
        assert_eq!(SelectType::RoundRobin.to_string(), "round-robin");
        assert_eq!(SelectType::Specified.code(), 3);
        assert_eq!("round-robin".parse::<SelectType>(), Ok(SelectType::RoundRobin));
        assert!("fastest".parse::<SelectType>().is_err());
    }
}
