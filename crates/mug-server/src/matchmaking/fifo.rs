use super::{MatchCandidate, Matchmaker};

/// First come, first served: the longest-waiting participants are grouped
/// with the new arrival as soon as there are enough of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoMatchmaker;

impl Matchmaker for FifoMatchmaker {
    fn find_match(
        &mut self,
        arriving: &MatchCandidate,
        waiting: &[MatchCandidate],
        group_size: usize,
    ) -> Option<Vec<MatchCandidate>> {
        let needed = group_size.checked_sub(1)?;
        if waiting.len() < needed {
            return None;
        }
        let mut group: Vec<MatchCandidate> = waiting[..needed].to_vec();
        group.push(arriving.clone());
        Some(group)
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}
