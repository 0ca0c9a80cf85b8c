//! CONVERGE phase state: a ticket-ranked value collector for one round.

use crate::error::GpbftError;
use crate::ticket::compute_ticket_rank;
use granite_types::{ActorId, ChainKey, ECChain, Justification, Phase, PowerTable};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

/// One chain proposed at CONVERGE, with the best rank seen for it.
#[derive(Debug, Clone)]
pub struct ConvergeValue {
    pub chain: ECChain,
    pub justification: Justification,
    pub rank: f64,
}

/// Collects CONVERGE proposals of one round, keyed by chain.
#[derive(Debug, Clone)]
pub struct ConvergeState {
    /// Participants from which a message has been received.
    senders: BTreeSet<ActorId>,
    /// Proposals indexed by chain key.
    values: BTreeMap<ChainKey, ConvergeValue>,
    power_table: Arc<PowerTable>,
}

impl ConvergeState {
    pub fn new(power_table: Arc<PowerTable>) -> Self {
        Self {
            senders: BTreeSet::new(),
            values: BTreeMap::new(),
            power_table,
        }
    }

    /// Seed the participant's locally-proposed converge value, so progress
    /// does not depend on the local broadcast being delivered back to self.
    ///
    /// The self value carries no ticket and ranks +∞: any proposal received
    /// in a message outranks it.
    pub fn set_self_value(&mut self, value: &ECChain, justification: &Justification) {
        let key = value.key();
        self.values.entry(key).or_insert_with(|| ConvergeValue {
            chain: value.clone(),
            justification: justification.clone(),
            rank: f64::INFINITY,
        });
    }

    /// Receive a CONVERGE proposal from a sender. Any subsequent proposal
    /// from a sender already seen is ignored. For a chain already proposed,
    /// only a better rank is retained; the first justification sticks.
    pub fn receive(
        &mut self,
        sender: ActorId,
        value: &ECChain,
        ticket: &[u8],
        justification: Justification,
    ) -> Result<(), GpbftError> {
        if value.is_bottom() {
            return Err(GpbftError::BottomVote(Phase::Converge));
        }
        if !self.senders.insert(sender) {
            trace!(%sender, "duplicate sender, CONVERGE proposal ignored");
            return Ok(());
        }
        let sender_power = self.power_table.get(sender);
        let rank = compute_ticket_rank(ticket, sender_power);

        match self.values.entry(value.key()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(ConvergeValue {
                    chain: value.clone(),
                    justification,
                    rank,
                });
            }
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if rank < existing.rank {
                    existing.rank = rank;
                }
            }
        }
        Ok(())
    }

    /// Find the proposal with the best (smallest) ticket rank among those
    /// passing the filter. `None` filter considers all proposals.
    ///
    /// Matching ranks from an equivocation resolve to the first in key
    /// order; either way the protocol converges in a later round.
    pub fn find_best_ticket_proposal(
        &self,
        filter: Option<&dyn Fn(&ConvergeValue) -> bool>,
    ) -> Option<&ConvergeValue> {
        let mut best: Option<&ConvergeValue> = None;
        for value in self.values.values() {
            if let Some(filter) = filter {
                if !filter(value) {
                    continue;
                }
            }
            match best {
                Some(current) if value.rank >= current.rank => {}
                _ => best = Some(value),
            }
        }
        best
    }

    /// Whether a justification of the given phase exists for a chain key.
    pub fn has_justification_of(&self, phase: Phase, key: &ChainKey) -> bool {
        self.get_justification_of(phase, key).is_some()
    }

    /// The justification of the given phase carried by a proposal, if any.
    /// A bottom key asks for any bottom-valued justification of that phase.
    pub fn get_justification_of(&self, phase: Phase, key: &ChainKey) -> Option<&Justification> {
        if key.is_bottom() {
            return self.values.values().map(|v| &v.justification).find(
                |justification| {
                    justification.vote.value.is_bottom() && justification.vote.phase == phase
                },
            );
        }
        self.values
            .get(key)
            .map(|value| &value.justification)
            .filter(|justification| justification.vote.phase == phase)
    }
}
