use super::{MatchCandidate, Matchmaker};

/// Groups participants whose server round-trip times are close, so no one
/// player's connection dominates the input delay.
///
/// Candidates without a measurement are compatible with everyone.
#[derive(Debug, Clone, Copy)]
pub struct LatencyMatchmaker {
    max_rtt_diff_ms: u32,
}

impl LatencyMatchmaker {
    pub fn new(max_rtt_diff_ms: u32) -> Self {
        Self { max_rtt_diff_ms }
    }

    fn compatible(&self, a: &MatchCandidate, b: &MatchCandidate) -> bool {
        match (a.rtt_ms, b.rtt_ms) {
            (Some(x), Some(y)) => x.abs_diff(y) <= self.max_rtt_diff_ms,
            _ => true,
        }
    }
}

impl Matchmaker for LatencyMatchmaker {
    fn find_match(
        &mut self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<MatchCandidate>> {
        if group_size == 0 {
            return None;
        }
        // Greedy in arrival order; every member must be within range of
        // every other.
        let mut group: Vec<MatchCandidate> = Vec::with_capacity(group_size);
        for candidate in waiting {
            if group.len() + 1 == group_size {
                break;
            }
            if self.compatible(candidate, arriving)
                && group.iter().all(|m| self.compatible(m, candidate))
            {
                group.push(candidate.clone());
            }
        }
        if group.len() + 1 < group_size {
            return None;
        }
        group.push(arriving.clone());
        Some(group)
    }

    fn name(&self) -> &'static str {
        "latency"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(id: &str, rtt: Option<u32>) -> MatchCandidate {
        MatchCandidate {
            subject_id: id.into(),
            rtt_ms: rtt,
        }
    }

    #[test]
    fn skips_distant_waiters() {
        let mut mm = LatencyMatchmaker::new(50);
        let waiting = [c("far", Some(300)), c("near", Some(60))];
        let group = mm.find_match(&c("new", Some(40)), &waiting, 2).unwrap();
        assert_eq!(group, vec![c("near", Some(60)), c("new", Some(40))]);
    }

    #[test]
    fn no_compatible_waiter_means_wait() {
        let mut mm = LatencyMatchmaker::new(10);
        assert_eq!(
            mm.find_match(&c("new", Some(40)), &[c("far", Some(300))], 2),
            None
        );
    }

    #[test]
    fn members_must_be_pairwise_close() {
        let mut mm = LatencyMatchmaker::new(50);
        // Both are within 50 of the arrival but 80 apart from each other.
        let waiting = [c("low", Some(10)), c("high", Some(90)), c("mid", Some(40))];
        let group = mm.find_match(&c("new", Some(50)), &waiting, 3).unwrap();
        assert_eq!(
            group,
            vec![c("low", Some(10)), c("mid", Some(40)), c("new", Some(50))]
        );
    }

    #[test]
    fn unmeasured_candidates_match_anyone() {
        let mut mm = LatencyMatchmaker::new(5);
        let group = mm.find_match(&c("new", None), &[c("a", Some(500))], 2);
        assert!(group.is_some());
    }
}
