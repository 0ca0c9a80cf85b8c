//! CONVERGE ticket ranking.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

type Blake2b256 = Blake2b<U32>;

/// Rank a CONVERGE ticket: smaller is better, and the expected winner is
/// weighted by power.
///
/// The ticket hash is read as a uniform draw in (0, 1) and mapped through the
/// inverse exponential CDF, so each sender's rank is an exponential variate
/// with rate equal to its scaled power. The minimum across senders is then a
/// power-weighted lottery. Non-positive power ranks last.
pub fn compute_ticket_rank(ticket: &[u8], scaled_power: i64) -> f64 {
    if scaled_power <= 0 {
        return f64::INFINITY;
    }
    let digest = Blake2b256::digest(ticket);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    // Map to (0, 1): the +0.5 offset keeps the draw away from both ln(0)
    // and ln(1).
    let uniform = (u64::from_be_bytes(word) as f64 + 0.5) / (u64::MAX as f64 + 1.0);
    -uniform.ln() / scaled_power as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_is_deterministic() {
        let a = compute_ticket_rank(b"ticket", 100);
        let b = compute_ticket_rank(b"ticket", 100);
        assert_eq!(a, b);
        assert!(a.is_finite());
        assert!(a > 0.0);
    }

    #[test]
    fn test_distinct_tickets_rank_differently() {
        assert_ne!(
            compute_ticket_rank(b"ticket-a", 100),
            compute_ticket_rank(b"ticket-b", 100)
        );
    }

    #[test]
    fn test_more_power_means_smaller_rank_for_same_ticket() {
        let weak = compute_ticket_rank(b"ticket", 10);
        let strong = compute_ticket_rank(b"ticket", 1000);
        assert!(strong < weak);
    }

    #[test]
    fn test_powerless_sender_ranks_last() {
        assert_eq!(compute_ticket_rank(b"ticket", 0), f64::INFINITY);
        assert_eq!(compute_ticket_rank(b"ticket", -1), f64::INFINITY);
    }

    #[test]
    fn test_power_weighted_expectation() {
        // Across many tickets, a participant with 4x the power should win the
        // pairwise comparison roughly 4 out of 5 times.
        let mut strong_wins = 0;
        let trials = 2000;
        for i in 0..trials {
            let strong = compute_ticket_rank(format!("s{i}").as_bytes(), 400);
            let weak = compute_ticket_rank(format!("w{i}").as_bytes(), 100);
            if strong < weak {
                strong_wins += 1;
            }
        }
        let share = strong_wins as f64 / trials as f64;
        assert!((0.72..0.88).contains(&share), "share {share}");
    }
}
