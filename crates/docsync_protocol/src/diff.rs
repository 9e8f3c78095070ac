//! Revision differ.
//!
//! Decides, per document, whether an incoming revision is already known,
//! extends what we have, or conflicts with it, and computes the revs-diff
//! answer a receiver sends back to an offering peer.

use crate::messages::{MissingRevision, ProposedRevision};
use docsync_core::RevisionId;

/// How a remote revision relates to the local copy of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionStatus {
    /// The revision is already present locally.
    Known,
    /// The revision descends from the local current revision, or the
    /// document does not exist locally.
    Descendant {
        /// The local current revision found in the remote history.
        ancestor: Option<RevisionId>,
    },
    /// Both sides changed the document independently.
    Conflict,
}

impl RevisionStatus {
    /// True unless the revision is already known.
    pub fn needs_transfer(&self) -> bool {
        !matches!(self, RevisionStatus::Known)
    }
}

/// Classifies a remote revision against local state.
///
/// `local_known` holds every revision ID the local document has (any order),
/// `local_current` its current revision, and `remote_history` the remote
/// revision followed by its ancestors, newest first. Only the part of the
/// history present in `remote_history` is compared.
pub fn classify(
    local_known: &[RevisionId],
    local_current: Option<&RevisionId>,
    remote_history: &[RevisionId],
) -> RevisionStatus {
    let Some(remote) = remote_history.first() else {
        return RevisionStatus::Known;
    };
    if local_known.contains(remote) {
        return RevisionStatus::Known;
    }
    match local_current {
        None => RevisionStatus::Descendant { ancestor: None },
        Some(current) if remote_history.contains(current) => RevisionStatus::Descendant {
            ancestor: Some(current.clone()),
        },
        Some(_) => RevisionStatus::Conflict,
    }
}

/// Picks the winning revision among a document's leaves: highest
/// generation, then the lexicographically greatest digest.
pub fn winning_revision<'a, I>(leaves: I) -> Option<&'a RevisionId>
where
    I: IntoIterator<Item = &'a RevisionId>,
{
    leaves.into_iter().max()
}

/// Newest revision in `remote_history` that is also known locally.
pub fn common_ancestor<'a>(
    local_known: &[RevisionId],
    remote_history: &'a [RevisionId],
) -> Option<&'a RevisionId> {
    remote_history.iter().find(|rev| local_known.contains(rev))
}

/// Known revisions that could be ancestors of `remote`: those with a lower
/// generation, newest first.
pub fn possible_ancestors(local_known: &[RevisionId], remote: &RevisionId) -> Vec<RevisionId> {
    let mut ancestors: Vec<RevisionId> = local_known
        .iter()
        .filter(|rev| rev.generation() < remote.generation())
        .cloned()
        .collect();
    ancestors.sort_by(|a, b| b.cmp(a));
    ancestors
}

/// Answers a revs-diff request.
///
/// `known` returns the revisions the receiver has for a document.
pub fn missing_revisions<F>(proposed: &[ProposedRevision], mut known: F) -> Vec<MissingRevision>
where
    F: FnMut(&str) -> Vec<RevisionId>,
{
    proposed
        .iter()
        .filter_map(|offer| {
            let local = known(&offer.doc_id);
            if local.contains(&offer.revision_id) {
                return None;
            }
            Some(MissingRevision {
                doc_id: offer.doc_id.clone(),
                revision_id: offer.revision_id.clone(),
                possible_ancestors: possible_ancestors(&local, &offer.revision_id),
            })
        })
        .collect()
}

/// Trims a history (newest first) so it ends at the first revision the
/// receiver already has, and to at most `max_len` entries.
pub fn trim_history(
    history: &[RevisionId],
    known_ancestors: &[RevisionId],
    max_len: usize,
) -> Vec<RevisionId> {
    let mut trimmed = Vec::new();
    for rev in history.iter().take(max_len.max(1)) {
        trimmed.push(rev.clone());
        if known_ancestors.contains(rev) {
            break;
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rev(s: &str) -> RevisionId {
        s.parse().unwrap()
    }

    #[test]
    fn known_revision_is_skipped() {
        let known = vec![rev("1-aa"), rev("2-bb")];
        assert_eq!(
            classify(&known, Some(&rev("2-bb")), &[rev("2-bb"), rev("1-aa")]),
            RevisionStatus::Known
        );
        assert!(!RevisionStatus::Known.needs_transfer());
    }

    #[test]
    fn missing_document_is_a_descendant() {
        assert_eq!(
            classify(&[], None, &[rev("3-cc")]),
            RevisionStatus::Descendant { ancestor: None }
        );
    }

    #[test]
    fn fast_forward_is_a_descendant() {
        let known = vec![rev("1-aa")];
        assert_eq!(
            classify(&known, Some(&rev("1-aa")), &[rev("3-cc"), rev("2-bb"), rev("1-aa")]),
            RevisionStatus::Descendant {
                ancestor: Some(rev("1-aa"))
            }
        );
    }

    #[test]
    fn independent_edits_conflict() {
        let known = vec![rev("1-aa"), rev("2-xx")];
        // Shared ancestor, but the local head is not in the remote history.
        assert_eq!(
            classify(&known, Some(&rev("2-xx")), &[rev("2-yy"), rev("1-aa")]),
            RevisionStatus::Conflict
        );
        // No shared ancestor within the window.
        assert_eq!(
            classify(&known, Some(&rev("2-xx")), &[rev("5-zz"), rev("4-ww")]),
            RevisionStatus::Conflict
        );
    }

    #[test]
    fn winner_prefers_generation_then_digest() {
        let leaves = [rev("3-aa"), rev("2-zz"), rev("3-ab")];
        assert_eq!(winning_revision(&leaves), Some(&rev("3-ab")));
        assert_eq!(winning_revision(std::iter::empty()), None);
    }

    #[test]
    fn revs_diff_reports_only_missing() {
        let proposed = vec![
            ProposedRevision {
                doc_id: "a".into(),
                revision_id: rev("2-bb"),
            },
            ProposedRevision {
                doc_id: "b".into(),
                revision_id: rev("1-cc"),
            },
        ];
        let missing = missing_revisions(&proposed, |doc_id| match doc_id {
            "a" => vec![rev("1-aa")],
            _ => vec![rev("1-cc")],
        });
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].doc_id, "a");
        assert_eq!(missing[0].possible_ancestors, vec![rev("1-aa")]);
    }

    #[test]
    fn history_stops_at_known_ancestor() {
        let history = [rev("4-dd"), rev("3-cc"), rev("2-bb"), rev("1-aa")];
        assert_eq!(
            trim_history(&history, &[rev("2-bb")], 10),
            vec![rev("4-dd"), rev("3-cc"), rev("2-bb")]
        );
        assert_eq!(trim_history(&history, &[], 2), vec![rev("4-dd"), rev("3-cc")]);
        assert_eq!(
            common_ancestor(&[rev("3-cc"), rev("1-aa")], &history),
            Some(&rev("3-cc"))
        );
    }

    fn arb_rev() -> impl Strategy<Value = RevisionId> {
        (1u64..6, "[a-f]{2}").prop_map(|(g, d)| RevisionId::new(g, d).unwrap())
    }

    proptest! {
        #[test]
        fn winner_is_independent_of_order(mut leaves in prop::collection::vec(arb_rev(), 1..8)) {
            let first = winning_revision(&leaves).cloned();
            leaves.reverse();
            prop_assert_eq!(winning_revision(&leaves).cloned(), first.clone());
            let winner = first.unwrap();
            prop_assert!(leaves.iter().all(|leaf| leaf <= &winner));
        }

        #[test]
        fn classify_never_overwrites_a_divergent_head(
            current in arb_rev(),
            history in prop::collection::vec(arb_rev(), 1..6),
        ) {
            let known = vec![current.clone()];
            let status = classify(&known, Some(&current), &history);
            if matches!(status, RevisionStatus::Descendant { .. }) {
                prop_assert!(history.contains(&current));
            }
        }
    }
}
