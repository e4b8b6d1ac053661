//! Length enforcement for a (context, question+answer) token pair.
//!
//! One token is dropped per iteration until both sides fit their budgets.
//! Side selection per iteration: a side over its own budget wins (a before
//! b), then the configured `trunc_seg` hint, then the longer side — the
//! comparison is a strict `>` on the a-side length, so equal-length sides
//! trim b. End selection: the front with probability 0.5, unless
//! `always_truncate_tail` pins every drop to the tail.

use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;

/// Which side of the pair a policy hint names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncSide {
    A,
    B,
}

/// Truncation policy knobs, deserialized from the `truncate_config` key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TruncateConfig {
    /// Always drop from the tail instead of coin-flipping front vs. tail.
    #[serde(default)]
    pub always_truncate_tail: bool,
    /// Preferred side to trim when neither side violates its own budget.
    #[serde(default)]
    pub trunc_seg: Option<TruncSide>,
}

/// Front/tail drop counts for one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SideStats {
    pub front: usize,
    pub tail: usize,
}

impl SideStats {
    pub fn total(&self) -> usize {
        self.front + self.tail
    }
}

/// Drop counts per side, tracked for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncateStats {
    pub a: SideStats,
    pub b: SideStats,
}

/// Trim `tokens_a` / `tokens_b` until both satisfy their budgets, returning
/// the trimmed sequences and per-side drop counts.
///
/// Terminates for every input: each iteration removes one token from a
/// non-empty side, and empty sides always satisfy a `usize` budget.
pub fn truncate_token_pair(
    mut tokens_a: Vec<String>,
    mut tokens_b: Vec<String>,
    max_len_a: usize,
    max_len_b: usize,
    config: &TruncateConfig,
    rng: &mut StdRng,
) -> (Vec<String>, Vec<String>, TruncateStats) {
    let mut stats = TruncateStats::default();
    loop {
        if tokens_a.len() <= max_len_a && tokens_b.len() <= max_len_b {
            break;
        }
        let side = if max_len_a > 0 && tokens_a.len() > max_len_a {
            TruncSide::A
        } else if max_len_b > 0 && tokens_b.len() > max_len_b {
            TruncSide::B
        } else if let Some(hint) = config.trunc_seg {
            hint
        } else if tokens_a.len() > tokens_b.len() {
            TruncSide::A
        } else {
            TruncSide::B
        };
        // A hint can name an already-empty side; redirect so progress holds.
        let side = match side {
            TruncSide::A if tokens_a.is_empty() => TruncSide::B,
            TruncSide::B if tokens_b.is_empty() => TruncSide::A,
            side => side,
        };
        let (tokens, side_stats) = match side {
            TruncSide::A => (&mut tokens_a, &mut stats.a),
            TruncSide::B => (&mut tokens_b, &mut stats.b),
        };
        if !config.always_truncate_tail && rng.gen::<f64>() < 0.5 {
            tokens.remove(0);
            side_stats.front += 1;
        } else {
            tokens.pop();
            side_stats.tail += 1;
        }
    }
    (tokens_a, tokens_b, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toks(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn removes_only_from_the_over_budget_side() {
        let mut rng = StdRng::seed_from_u64(0);
        let (a, b, stats) = truncate_token_pair(
            toks("a", 8),
            toks("b", 2),
            5,
            3,
            &TruncateConfig::default(),
            &mut rng,
        );
        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 2);
        assert_eq!(stats.a.total(), 3);
        assert_eq!(stats.b.total(), 0);
    }

    #[test]
    fn terminates_within_budgets_for_arbitrary_inputs() {
        let mut rng = StdRng::seed_from_u64(1);
        for (na, nb, ba, bb) in [(0, 0, 0, 0), (10, 10, 0, 0), (50, 1, 7, 7), (3, 40, 2, 2)] {
            let (a, b, _) = truncate_token_pair(
                toks("a", na),
                toks("b", nb),
                ba,
                bb,
                &TruncateConfig::default(),
                &mut rng,
            );
            assert!(a.len() <= ba && b.len() <= bb, "budgets {ba}/{bb} violated");
        }
    }

    #[test]
    fn always_truncate_tail_drops_only_from_the_end() {
        let mut rng = StdRng::seed_from_u64(2);
        let config = TruncateConfig {
            always_truncate_tail: true,
            trunc_seg: None,
        };
        let (a, _, stats) =
            truncate_token_pair(toks("a", 6), toks("b", 1), 4, 4, &config, &mut rng);
        assert_eq!(a, toks("a", 4));
        assert_eq!(stats.a, SideStats { front: 0, tail: 2 });
    }

    #[test]
    fn trunc_seg_hint_picks_the_named_side() {
        // a carries no individual budget, b is within its own, so only the
        // hint decides which side shrinks; without it the tie-break would
        // start on b.
        let mut rng = StdRng::seed_from_u64(3);
        let config = TruncateConfig {
            always_truncate_tail: true,
            trunc_seg: Some(TruncSide::A),
        };
        let (a, b, stats) =
            truncate_token_pair(toks("a", 2), toks("b", 2), 0, 2, &config, &mut rng);
        assert!(a.is_empty());
        assert_eq!(b, toks("b", 2));
        assert_eq!(stats.a.tail, 2);
        assert_eq!(stats.b.total(), 0);
    }

    #[test]
    fn equal_lengths_trim_the_b_side() {
        let mut rng = StdRng::seed_from_u64(4);
        let config = TruncateConfig {
            always_truncate_tail: true,
            trunc_seg: None,
        };
        // b has no individual budget, lengths are equal: the strict `>` on
        // the a-side length sends the drop to b, leaving a untouched.
        let (a, b, stats) =
            truncate_token_pair(toks("a", 1), toks("b", 1), 1, 0, &config, &mut rng);
        assert_eq!(a, toks("a", 1));
        assert!(b.is_empty());
        assert_eq!(stats.a.total(), 0);
        assert_eq!(stats.b.tail, 1);
    }

    #[test]
    fn front_and_tail_drops_both_occur_without_the_tail_flag() {
        let mut rng = StdRng::seed_from_u64(5);
        let (_, _, stats) = truncate_token_pair(
            toks("a", 64),
            toks("b", 0),
            8,
            0,
            &TruncateConfig::default(),
            &mut rng,
        );
        assert_eq!(stats.a.total(), 56);
        assert!(stats.a.front > 0, "coin flip never chose the front");
        assert!(stats.a.tail > 0, "coin flip never chose the tail");
    }
}
