//! Deciding the set of dealers from externally agreed proposals

use crate::{gpa::ProtocolError, PeerIndex};

/// Decides which dealers' sharings are summed into the key
///
/// `proposals` are index sets proposed by distinct members, as decided by an external
/// agreement (e.g. [common subset](crate::acs)). An index is agreed if it appears in at least
/// $f+1$ proposals, so at least one correct member has completed the sharing of that dealer
/// and every correct member eventually completes it too.
///
/// * Proposals shorter than $f+1$ are skipped
/// * Index repeated within a proposal gets no vote from that proposal
/// * Indexes out of `0..n` are ignored
///
/// Returns the agreed indexes in ascending order. Fails with
/// [inconsistency](ProtocolError::inconsistency) if there are fewer than $n-f$ proposals, or
/// fewer than $f+1$ indexes are agreed: such result can't be produced by a correct agreement.
pub fn decide_indexes(
    proposals: &[Vec<PeerIndex>],
    n: usize,
    f: usize,
) -> Result<Vec<PeerIndex>, ProtocolError> {
    if proposals.len() < n - f {
        return Err(ProtocolError::inconsistency(format!(
            "got {} proposals, expected at least {}",
            proposals.len(),
            n - f
        )));
    }

    let mut votes = vec![0usize; n];
    for proposal in proposals {
        if proposal.len() <= f {
            tracing::warn!(len = proposal.len(), "proposal is too short, skipped");
            continue;
        }
        let mut occurrences = vec![0usize; n];
        for &index in proposal {
            match occurrences.get_mut(usize::from(index)) {
                Some(count) => *count += 1,
                None => tracing::warn!(index, "proposed index is out of range"),
            }
        }
        for (index, (votes, count)) in votes.iter_mut().zip(occurrences).enumerate() {
            match count {
                0 => {}
                1 => *votes += 1,
                _ => tracing::warn!(index, "duplicate index within a proposal, not counted"),
            }
        }
    }

    let agreed: Vec<PeerIndex> = (0..n)
        .filter(|j| votes[*j] > f)
        .map(|j| j as PeerIndex)
        .collect();
    if agreed.len() <= f {
        return Err(ProtocolError::inconsistency(format!(
            "only {} indexes agreed, expected at least {}",
            agreed.len(),
            f + 1
        )));
    }
    Ok(agreed)
}
