use serde::{Deserialize, Serialize};

/// One option under comparison (a vessel, a bunker port, a route variant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub feasible: bool,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    /// 1-based.
    pub rank: usize,
    pub id: String,
    pub feasible: bool,
    pub cost_usd: f64,
}

/// Rank feasible candidates first, then by ascending cost. Equal candidates
/// keep their input order, so identical inputs always rank the same way.
pub fn rank_candidates(candidates: &[Candidate]) -> Vec<RankedCandidate> {
    let mut indexed: Vec<(usize, &Candidate)> = candidates.iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        b.feasible
            .cmp(&a.feasible)
            .then_with(|| a.cost_usd.total_cmp(&b.cost_usd))
            .then_with(|| ia.cmp(ib))
    });
    indexed
        .into_iter()
        .enumerate()
        .map(|(i, (_, c))| RankedCandidate {
            rank: i + 1,
            id: c.id.clone(),
            feasible: c.feasible,
            cost_usd: c.cost_usd,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(id: &str, feasible: bool, cost: f64) -> Candidate {
        Candidate {
            id: id.into(),
            feasible,
            cost_usd: cost,
        }
    }

    #[test]
    fn test_feasible_before_cheaper_infeasible() {
        let ranked = rank_candidates(&[c("a", false, 10.0), c("b", true, 50.0), c("c", true, 20.0)]);
        let ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(ranked[0].rank, 1);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let input = [c("MV Nordic", true, 412_000.0), c("MV Aurora", true, 412_000.0)];
        let first = rank_candidates(&input);
        for _ in 0..10 {
            assert_eq!(rank_candidates(&input), first);
        }
        assert_eq!(first[0].id, "MV Nordic");
    }
}
