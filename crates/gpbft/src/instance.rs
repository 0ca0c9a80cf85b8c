//! The per-instance consensus state machine.

use crate::config::GpbftConfig;
use crate::converge::{ConvergeState, ConvergeValue};
use crate::error::GpbftError;
use crate::quorum::{QuorumResult, QuorumState};
use granite_core::{
    Action, Event, Instant, InstanceProgress, MessageBuilder, StateMachine,
};
use granite_types::{
    Aggregate, ChainKey, ECChain, GMessage, Justification, NetworkName, Payload, Phase,
    PowerTable, SupplementalData,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Per-round protocol state.
///
/// State from prior rounds must be maintained to provide justification for
/// values in subsequent rounds.
pub struct RoundState {
    pub(crate) converged: ConvergeState,
    pub(crate) prepared: QuorumState,
    pub(crate) committed: QuorumState,
}

impl RoundState {
    fn new(power_table: Arc<PowerTable>) -> Self {
        Self {
            converged: ConvergeState::new(Arc::clone(&power_table)),
            prepared: QuorumState::new(Arc::clone(&power_table)),
            committed: QuorumState::new(power_table),
        }
    }
}

/// Where a justification comes from when one is required: either a strong
/// quorum found locally (to be aggregated), or one already received.
enum JustificationSource {
    Quorum(QuorumResult),
    Ready(Justification),
}

/// A single consensus instance.
///
/// # State Machine Flow
///
/// 1. **QUALITY** (round 0) → adopt the longest input prefix with a strong
///    quorum of support
/// 2. **PREPARE** → vote the proposal; fall back to bottom without quorum
/// 3. **COMMIT** → a strong quorum for a value decides it; a strong quorum
///    for bottom opens the next round
/// 4. **CONVERGE** (rounds ≥ 1) → power-weighted ticket lottery selects the
///    round's proposal
/// 5. **DECIDE** → collect decisions until a strong quorum terminates the
///    instance with a certificate
///
/// The host drives the instance serially through [`Instance::receive`],
/// [`Instance::receive_many`] and [`Instance::receive_alarm`], injecting
/// virtual time via [`Instance::set_time`] before each call.
pub struct Instance {
    // ═══════════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════════
    config: GpbftConfig,
    network_name: NetworkName,

    /// The power table for the base chain; fixed for the instance.
    power_table: Arc<PowerTable>,

    /// The aggregate signature builder, called when certificates are formed.
    aggregate: Arc<dyn Aggregate>,

    /// The beacon value from the base chain, used for CONVERGE tickets.
    beacon: Vec<u8>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Chain State
    // ═══════════════════════════════════════════════════════════════════════════
    /// The chain input to this instance.
    input: ECChain,

    /// Data all participants must agree on ahead of time. Messages proposing
    /// different supplemental data are discarded.
    supplemental_data: SupplementalData,

    /// Current position: instance id, round and phase.
    current: InstanceProgress,

    /// This instance's proposal for the current round. Set after QUALITY,
    /// changed only at CONVERGE or end-of-round COMMIT. Never bottom.
    proposal: ECChain,

    /// The value to be transmitted at the next phase. May drop to bottom
    /// after PREPARE.
    value: ECChain,

    /// Chains acceptable to decide in this instance: the base chain, every
    /// input prefix that found a QUALITY quorum, and any chain another
    /// participant could have decided. Grows monotonically.
    candidates: HashSet<ChainKey>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Phase State
    // ═══════════════════════════════════════════════════════════════════════════
    /// QUALITY phase accumulator (round 0 only).
    quality: QuorumState,

    /// Per-round state, allocated lazily on first reference.
    rounds: BTreeMap<u64, RoundState>,

    /// DECIDE accumulator, independent of rounds.
    decision: QuorumState,

    /// The final certificate, kept for the host after termination.
    termination_value: Option<Justification>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════════
    /// When the current phase can (QUALITY/PREPARE/COMMIT) or must (CONVERGE)
    /// end.
    phase_timeout: Duration,

    /// When the current phase should rebroadcast to further its progress.
    /// Zero means not yet armed.
    rebroadcast_timeout: Duration,

    /// Rebroadcasts performed in the current phase, driving the backoff.
    rebroadcast_attempts: u32,

    /// Current virtual time, set by the host before each delivery.
    now: Duration,

    // ═══════════════════════════════════════════════════════════════════════════
    // Pending Effects
    // ═══════════════════════════════════════════════════════════════════════════
    /// Actions produced by the current entrypoint, drained on return.
    out: Vec<Action>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.current.id)
            .field("round", &self.current.round)
            .field("phase", &self.current.phase)
            .field("proposal", &self.proposal.to_string())
            .field("value", &self.value.to_string())
            .field("candidates", &self.candidates.len())
            .field("rounds", &self.rounds.len())
            .finish()
    }
}

/// The only spammable messages are COMMITs for bottom: QUALITY is only valid
/// at round zero, and PREPARE/CONVERGE must carry justification beyond round
/// zero. The check below uses the stronger condition of "no justification
/// with round larger than zero".
fn is_spammable(msg: &GMessage) -> bool {
    msg.justification.is_none() && msg.vote.round > 0
}

impl Instance {
    /// Create a new instance around an input chain proposed by the external
    /// chain.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GpbftConfig,
        network_name: NetworkName,
        instance_id: u64,
        input: ECChain,
        supplemental_data: SupplementalData,
        power_table: Arc<PowerTable>,
        aggregate: Arc<dyn Aggregate>,
        beacon: Vec<u8>,
    ) -> Result<Self, GpbftError> {
        input.validate()?;
        if input.is_bottom() {
            return Err(GpbftError::EmptyInput);
        }

        let mut candidates = HashSet::new();
        candidates.insert(input.base_chain().key());

        let mut rounds = BTreeMap::new();
        rounds.insert(0, RoundState::new(Arc::clone(&power_table)));

        Ok(Self {
            config,
            network_name,
            quality: QuorumState::new(Arc::clone(&power_table)),
            decision: QuorumState::new(Arc::clone(&power_table)),
            power_table,
            aggregate,
            beacon,
            proposal: input.clone(),
            input,
            supplemental_data,
            current: InstanceProgress {
                id: instance_id,
                round: 0,
                phase: Phase::Initial,
            },
            value: ECChain::bottom(),
            candidates,
            rounds,
            termination_value: None,
            phase_timeout: Duration::ZERO,
            rebroadcast_timeout: Duration::ZERO,
            rebroadcast_attempts: 0,
            now: Duration::ZERO,
            out: Vec::new(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn id(&self) -> u64 {
        self.current.id
    }

    pub fn round(&self) -> u64 {
        self.current.round
    }

    pub fn phase(&self) -> Phase {
        self.current.phase
    }

    pub fn progress(&self) -> InstanceProgress {
        self.current.clone()
    }

    pub fn input(&self) -> &ECChain {
        &self.input
    }

    pub fn proposal(&self) -> &ECChain {
        &self.proposal
    }

    pub fn is_terminated(&self) -> bool {
        self.current.phase == Phase::Terminated
    }

    /// The decision certificate, available once terminated.
    pub fn termination_value(&self) -> Option<&Justification> {
        self.termination_value.as_ref()
    }

    /// Inject the current virtual time.
    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Entrypoints
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start the instance: broadcast QUALITY and begin listening.
    pub fn start(&mut self) -> Result<Vec<Action>, GpbftError> {
        let result = self.begin_quality();
        self.finish(result)
    }

    /// Receive and process a single message.
    ///
    /// Errors indicate either message invalidation or a fatal protocol
    /// violation; see [`GpbftError`].
    pub fn receive(&mut self, msg: GMessage) -> Result<Vec<Action>, GpbftError> {
        if self.is_terminated() {
            return Err(GpbftError::ReceivedAfterTermination);
        }
        let round = msg.vote.round;
        let result = match self.receive_one(msg) {
            // Further process the message's round only if it may have had an
            // effect. This avoids loading state for dropped messages.
            Ok(true) => self.post_receive(vec![round]),
            Ok(false) => Ok(()),
            Err(error) => Err(error),
        };
        self.finish(result)
    }

    /// Receive and process a batch of queued messages.
    ///
    /// Validation failures are logged and skipped; the batch continues.
    /// Skip-ahead evaluation runs once over the distinct rounds touched, in
    /// descending order.
    pub fn receive_many(&mut self, msgs: Vec<GMessage>) -> Result<Vec<Action>, GpbftError> {
        if self.is_terminated() {
            return Err(GpbftError::ReceivedAfterTermination);
        }
        let mut rounds_received = BTreeSet::new();
        for msg in msgs {
            let round = msg.vote.round;
            match self.receive_one(msg) {
                Ok(true) => {
                    rounds_received.insert(round);
                }
                Ok(false) => {}
                Err(error) if error.is_validation() => {
                    warn!(id = self.current.id, %error, "dropping invalid message");
                }
                Err(error) => return self.finish(Err(error)),
            }
        }
        let rounds: Vec<u64> = rounds_received.into_iter().rev().collect();
        let result = self.post_receive(rounds);
        self.finish(result)
    }

    /// Handle the pending alarm firing.
    pub fn receive_alarm(&mut self) -> Result<Vec<Action>, GpbftError> {
        if self.is_terminated() {
            return Err(GpbftError::ReceivedAfterTermination);
        }
        let result = self.try_current_phase();
        self.finish(result)
    }

    /// Drain buffered actions on success; discard them on error.
    fn finish(&mut self, result: Result<(), GpbftError>) -> Result<Vec<Action>, GpbftError> {
        match result {
            Ok(()) => Ok(std::mem::take(&mut self.out)),
            Err(error) => {
                self.out.clear();
                Err(error)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Message Ingestion
    // ═══════════════════════════════════════════════════════════════════════════

    /// Process a single message. Returns whether it may have changed state.
    fn receive_one(&mut self, msg: GMessage) -> Result<bool, GpbftError> {
        // Check the message is for this instance, to guard against
        // programming error.
        if msg.vote.instance != self.current.id {
            return Err(GpbftError::WrongInstance {
                got: msg.vote.instance,
                expected: self.current.id,
            });
        }
        // Validation that could not be done until the instance started:
        // supplemental data and base chain must match our expectation.
        if msg.vote.supplemental_data != self.supplemental_data {
            return Err(GpbftError::WrongSupplement);
        }
        let base_ok = msg.vote.value.is_bottom()
            || self
                .input
                .base()
                .is_some_and(|base| msg.vote.value.has_base(base));
        if !base_ok {
            return Err(GpbftError::WrongBase);
        }

        if self.current.phase == Phase::Terminated {
            return Ok(false);
        }

        // Ignore CONVERGE and PREPARE messages for prior rounds.
        let for_prior_round = msg.vote.round < self.current.round;
        if for_prior_round && matches!(msg.vote.phase, Phase::Converge | Phase::Prepare) {
            trace!(
                id = self.current.id,
                round = msg.vote.round,
                phase = %msg.vote.phase,
                "dropping message for prior round"
            );
            return Ok(false);
        }

        // Drop messages that belong to rounds beyond the lookahead threshold
        // and carry no justification, i.e. are spammable.
        let beyond_max_lookahead =
            msg.vote.round > self.current.round + self.config.max_lookahead_rounds;
        if beyond_max_lookahead && is_spammable(&msg) {
            trace!(
                id = self.current.id,
                round = msg.vote.round,
                "dropping spammable message beyond lookahead"
            );
            return Ok(false);
        }

        // Equivocations are handled by the accumulators: only the first
        // message per sender counts.
        match msg.vote.phase {
            Phase::Quality => {
                // Receive each prefix of the proposal independently, accepted
                // at any round and phase.
                self.quality.receive_each_prefix(msg.sender, &msg.vote.value);
                // Past the QUALITY phase, late messages can still expand the
                // candidate set (but never rewind the phase).
                if self.current.phase != Phase::Quality {
                    self.update_candidates_from_quality();
                    return Ok(true);
                }
            }
            Phase::Converge => {
                let justification = msg
                    .justification
                    .clone()
                    .ok_or(GpbftError::MissingJustification(Phase::Converge))?;
                let ticket = msg.ticket.clone().unwrap_or_default();
                self.ensure_round(msg.vote.round);
                let round_state = self.round_mut(msg.vote.round)?;
                round_state
                    .converged
                    .receive(msg.sender, &msg.vote.value, &ticket, justification)?;
            }
            Phase::Prepare => {
                self.ensure_round(msg.vote.round);
                let round_state = self.round_mut(msg.vote.round)?;
                round_state
                    .prepared
                    .receive(msg.sender, &msg.vote.value, msg.signature.clone());
                // PREPARE messages beyond round zero carry justification of
                // either COMMIT for bottom or PREPARE for their value from
                // the previous round. Collect them: they can advance the
                // current round as evidence of a strong quorum.
                if let Some(justification) = &msg.justification {
                    round_state
                        .prepared
                        .receive_justification(&msg.vote.value, justification.clone());
                }
            }
            Phase::Commit => {
                self.ensure_round(msg.vote.round);
                let round_state = self.round_mut(msg.vote.round)?;
                round_state
                    .committed
                    .receive(msg.sender, &msg.vote.value, msg.signature.clone());
                // Only justifications of COMMITs for non-bottom values need
                // storing: they can justify a CONVERGE next round, or justify
                // progress from PREPARE in the current round.
                if !msg.vote.value.is_bottom() {
                    if let Some(justification) = &msg.justification {
                        round_state
                            .committed
                            .receive_justification(&msg.vote.value, justification.clone());
                    }
                }
                // A COMMIT phase stays open even after the protocol moves to
                // a new round: a late strong quorum must still decide, in the
                // round the message belongs to.
                if self.current.phase != Phase::Decide {
                    self.try_commit(msg.vote.round)?;
                    // Continue to the current phase only if this COMMIT could
                    // justify the current round's PREPARE.
                    let try_complete_current = self.current.phase == Phase::Prepare
                        && self.current.round == msg.vote.round
                        && !msg.vote.value.is_bottom();
                    if !try_complete_current {
                        return Ok(true);
                    }
                }
            }
            Phase::Decide => {
                if msg.vote.value.is_bottom() {
                    return Err(GpbftError::BottomVote(Phase::Decide));
                }
                let justification = msg
                    .justification
                    .clone()
                    .ok_or(GpbftError::MissingJustification(Phase::Decide))?;
                self.decision
                    .receive(msg.sender, &msg.vote.value, msg.signature.clone());
                if self.current.phase != Phase::Decide {
                    self.skip_to_decide(msg.vote.value.clone(), justification);
                }
            }
            phase => return Err(GpbftError::UnexpectedMessagePhase(phase)),
        }

        // Try to complete the current phase in the current round.
        self.try_current_phase()?;
        Ok(true)
    }

    /// Check for skip-ahead opportunities over the given rounds, which must
    /// be in descending order.
    fn post_receive(&mut self, rounds_received: Vec<u64>) -> Result<(), GpbftError> {
        for round in rounds_received {
            if let Some((chain, justification)) = self.should_skip_to_round(round) {
                return self.skip_to_round(round, chain, justification);
            }
        }
        Ok(())
    }

    /// Whether to skip to a future round, and with what: either a value to
    /// sway to, or a justification of COMMIT for bottom carrying our own
    /// proposal forward.
    fn should_skip_to_round(&self, round: u64) -> Option<(ECChain, Justification)> {
        if round <= self.current.round || self.current.phase == Phase::Decide {
            return None;
        }
        let state = self.rounds.get(&round)?;
        if !state.prepared.received_from_weak_quorum() {
            return None;
        }
        let proposal = state.converged.find_best_ticket_proposal(None)?;
        Some((proposal.chain.clone(), proposal.justification.clone()))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Phase Progression
    // ═══════════════════════════════════════════════════════════════════════════

    /// Attempt to complete the current phase in the current round.
    fn try_current_phase(&mut self) -> Result<(), GpbftError> {
        trace!(id = self.current.id, phase = %self.current.phase, "try phase");
        match self.current.phase {
            Phase::Quality => self.try_quality(),
            Phase::Converge => self.try_converge(),
            Phase::Prepare => self.try_prepare(),
            Phase::Commit => self.try_commit(self.current.round),
            Phase::Decide => self.try_decide(),
            Phase::Terminated => Ok(()),
            Phase::Initial => Err(GpbftError::Invariant("instance has not been started")),
        }
    }

    /// Broadcast this node's QUALITY message and begin the QUALITY phase.
    fn begin_quality(&mut self) -> Result<(), GpbftError> {
        if self.current.phase != Phase::Initial {
            return Err(GpbftError::Invariant(
                "QUALITY can only begin from the initial phase",
            ));
        }
        self.current.phase = Phase::Quality;
        self.notify_progress();
        self.phase_timeout = self.alarm_after_synchrony(self.config.quality_delta_multi);
        self.reset_rebroadcast_params();
        self.broadcast(
            self.current.round,
            Phase::Quality,
            self.proposal.clone(),
            false,
            None,
        );
        Ok(())
    }

    /// Attempt to end the QUALITY phase and begin PREPARE.
    fn try_quality(&mut self) -> Result<(), GpbftError> {
        // Wait either for a strong quorum agreeing on our proposal, or for
        // the timeout to expire.
        let found_quorum = self.quality.has_strong_quorum_for(&self.proposal.key());
        let timeout_expired = self.phase_timeout_elapsed();
        if !found_quorum && !timeout_expired {
            return Ok(());
        }

        // With a strong quorum on the input the proposal stays unchanged;
        // otherwise it becomes the longest input prefix with a strong quorum,
        // down to the bare base.
        self.proposal = self
            .quality
            .find_strong_quorum_value_for_longest_prefix_of(&self.input);
        let proposal = self.proposal.clone();
        self.add_candidate_prefixes(&proposal);
        self.value = self.proposal.clone();
        debug!(
            id = self.current.id,
            proposal = %self.proposal,
            "adopting proposal after QUALITY"
        );
        self.begin_prepare(None)
    }

    /// Update candidates from late-arriving QUALITY messages, based on the
    /// longest input prefix with a strong quorum.
    fn update_candidates_from_quality(&mut self) {
        let longest_prefix = self
            .quality
            .find_strong_quorum_value_for_longest_prefix_of(&self.input);
        if self.add_candidate_prefixes(&longest_prefix) {
            debug!(
                id = self.current.id,
                prefix = %longest_prefix,
                "expanded candidates from late QUALITY quorum"
            );
        }
    }

    /// Begin CONVERGE, justified by the given justification.
    fn begin_converge(&mut self, justification: Justification) -> Result<(), GpbftError> {
        if justification.vote.round != self.current.round - 1 {
            return Err(GpbftError::Invariant(
                "converge justification does not belong to the previous round",
            ));
        }
        self.current.phase = Phase::Converge;
        self.notify_progress();
        self.phase_timeout = self.alarm_after_synchrony(1.0);
        self.reset_rebroadcast_params();

        // Seed the round's converge state with the self proposal: delivery of
        // our own broadcast back to self is not guaranteed.
        self.ensure_round(self.current.round);
        let proposal = self.proposal.clone();
        let round_state = self.round_mut(self.current.round)?;
        round_state.converged.set_self_value(&proposal, &justification);

        self.broadcast(
            self.current.round,
            Phase::Converge,
            proposal,
            true,
            Some(justification),
        );
        Ok(())
    }

    /// Attempt to end the CONVERGE phase and begin PREPARE.
    fn try_converge(&mut self) -> Result<(), GpbftError> {
        // The CONVERGE timeout is exact: it does not wait to hear from a
        // quorum of power.
        if !self.phase_timeout_elapsed() {
            if self.should_rebroadcast() {
                self.try_rebroadcast();
            }
            return Ok(());
        }

        self.ensure_round(self.current.round - 1);
        let winner = {
            let previous_committed = &self
                .rounds
                .get(&(self.current.round - 1))
                .ok_or(GpbftError::Invariant("missing previous round state"))?
                .committed;
            let candidates = &self.candidates;
            // Accept values in the candidate set, and values another
            // participant could possibly have decided in the previous round
            // despite this participant never seeing them as candidates.
            let is_valid_converge_value = |cv: &ConvergeValue| {
                if candidates.contains(&cv.chain.key()) {
                    return true;
                }
                if cv.justification.vote.phase != Phase::Prepare {
                    return false;
                }
                previous_committed.could_reach_strong_quorum_for(&cv.chain.key(), true)
            };
            self.rounds
                .get(&self.current.round)
                .ok_or(GpbftError::Invariant("missing current round state"))?
                .converged
                .find_best_ticket_proposal(Some(&is_valid_converge_value))
                .cloned()
        }
        .ok_or(GpbftError::Invariant("no values at CONVERGE"))?;

        if !self.is_candidate(&winner.chain) {
            // The winner is outside the candidate set: the instance got
            // swayed.
            warn!(
                id = self.current.id,
                from = %self.proposal,
                to = %winner.chain,
                "swayed by CONVERGE"
            );
            self.add_candidate(winner.chain.clone());
        } else {
            debug!(
                id = self.current.id,
                proposal = %winner.chain,
                "adopting proposal after CONVERGE"
            );
        }
        self.proposal = winner.chain.clone();
        self.value = winner.chain;
        self.begin_prepare(Some(winner.justification))
    }

    /// Broadcast this node's PREPARE message and begin the PREPARE phase.
    fn begin_prepare(&mut self, justification: Option<Justification>) -> Result<(), GpbftError> {
        self.current.phase = Phase::Prepare;
        self.notify_progress();
        self.phase_timeout = self.alarm_after_synchrony(1.0);
        self.reset_rebroadcast_params();
        self.broadcast(
            self.current.round,
            Phase::Prepare,
            self.value.clone(),
            false,
            justification,
        );
        Ok(())
    }

    /// Attempt to end the PREPARE phase and begin COMMIT.
    fn try_prepare(&mut self) -> Result<(), GpbftError> {
        self.ensure_round(self.current.round);
        self.ensure_round(self.current.round + 1);
        let proposal_key = self.proposal.key();

        let (found_quorum, quorum_not_possible, phase_complete, found_justification) = {
            let current_round = self
                .rounds
                .get(&self.current.round)
                .ok_or(GpbftError::Invariant("missing current round state"))?;
            let next_round = self
                .rounds
                .get(&(self.current.round + 1))
                .ok_or(GpbftError::Invariant("missing next round state"))?;
            let prepared = &current_round.prepared;
            // A justification of PREPARE for the proposal in current-round
            // COMMITs or next-round PREPARE/CONVERGE messages indicates a
            // strong quorum of PREPARE exists that this participant has not
            // seen itself.
            let found_justification = current_round
                .committed
                .has_justification_of(Phase::Prepare, &proposal_key)
                || next_round
                    .prepared
                    .has_justification_of(Phase::Prepare, &proposal_key)
                || next_round
                    .converged
                    .has_justification_of(Phase::Prepare, &proposal_key);
            (
                prepared.has_strong_quorum_for(&proposal_key),
                !prepared.could_reach_strong_quorum_for(&proposal_key, false),
                self.phase_timeout_elapsed() && prepared.received_from_strong_quorum(),
                found_justification,
            )
        };

        if found_quorum || found_justification {
            self.value = self.proposal.clone();
        } else if quorum_not_possible || phase_complete {
            self.value = ECChain::bottom();
        }

        if found_quorum || found_justification || quorum_not_possible || phase_complete {
            self.begin_commit()
        } else {
            if self.should_rebroadcast() {
                self.try_rebroadcast();
            }
            Ok(())
        }
    }

    /// Broadcast this node's COMMIT message and begin the COMMIT phase.
    fn begin_commit(&mut self) -> Result<(), GpbftError> {
        self.current.phase = Phase::Commit;
        self.notify_progress();
        self.phase_timeout = self.alarm_after_synchrony(1.0);
        self.reset_rebroadcast_params();

        // PREPARE exited either with value == proposal holding a strong
        // quorum of support, or with bottom. Committing bottom needs no
        // justification.
        let justification = if self.value.is_bottom() {
            None
        } else {
            let value_key = self.value.key();
            self.ensure_round(self.current.round + 1);
            let source = {
                let current_round = self
                    .rounds
                    .get(&self.current.round)
                    .ok_or(GpbftError::Invariant("missing current round state"))?;
                let next_round = self
                    .rounds
                    .get(&(self.current.round + 1))
                    .ok_or(GpbftError::Invariant("missing next round state"))?;
                if let Some(quorum) = current_round.prepared.find_strong_quorum_for(&value_key)? {
                    JustificationSource::Quorum(quorum)
                } else if let Some(justification) = current_round
                    .committed
                    .get_justification_of(Phase::Prepare, &value_key)
                {
                    JustificationSource::Ready(justification.clone())
                } else if let Some(justification) = next_round
                    .prepared
                    .get_justification_of(Phase::Prepare, &value_key)
                {
                    JustificationSource::Ready(justification.clone())
                } else if let Some(justification) = next_round
                    .converged
                    .get_justification_of(Phase::Prepare, &value_key)
                {
                    JustificationSource::Ready(justification.clone())
                } else {
                    return Err(GpbftError::Invariant(
                        "commit of non-bottom value without strong quorum of PREPARE",
                    ));
                }
            };
            Some(match source {
                JustificationSource::Quorum(quorum) => self.build_justification(
                    quorum,
                    self.current.round,
                    Phase::Prepare,
                    self.value.clone(),
                )?,
                JustificationSource::Ready(justification) => justification,
            })
        };

        self.broadcast(
            self.current.round,
            Phase::Commit,
            self.value.clone(),
            false,
            justification,
        );
        Ok(())
    }

    /// Attempt to complete the COMMIT phase of the given round.
    ///
    /// Unlike all other phases, COMMIT stays open to new messages even after
    /// the protocol moves to later rounds: a late strong quorum must still
    /// cause a decision, in that round.
    fn try_commit(&mut self, round: u64) -> Result<(), GpbftError> {
        self.ensure_round(round);
        self.ensure_round(round + 1);

        let (quorum_value, phase_complete, found_justification_for_bottom) = {
            let committed = &self
                .rounds
                .get(&round)
                .ok_or(GpbftError::Invariant("missing round state"))?
                .committed;
            let quorum_value = committed.find_strong_quorum_value()?;
            let phase_complete =
                self.phase_timeout_elapsed() && committed.received_from_strong_quorum();
            // A justification of COMMIT for bottom carried by next-round
            // PREPARE or CONVERGE messages indicates a strong quorum of
            // COMMIT for bottom this participant has not seen itself.
            let next_round = self
                .rounds
                .get(&(round + 1))
                .ok_or(GpbftError::Invariant("missing next round state"))?;
            let bottom_key = ChainKey::bottom();
            let found_justification_for_bottom = next_round
                .prepared
                .has_justification_of(Phase::Commit, &bottom_key)
                || next_round
                    .converged
                    .has_justification_of(Phase::Commit, &bottom_key);
            (quorum_value, phase_complete, found_justification_for_bottom)
        };

        match quorum_value {
            Some(value) if !value.is_bottom() => {
                // A strong quorum for a non-bottom value: accept it. A
                // participant may be forced to decide a value that is not its
                // preferred chain; it is accepting the decision, not
                // influencing it.
                self.value = value;
                self.begin_decide(round)
            }
            _ if self.current.round != round || self.current.phase != Phase::Commit => {
                // At another round or phase: nothing further to do here.
                Ok(())
            }
            Some(_) => {
                // Strong quorum for bottom: carry the proposal forward.
                self.begin_next_round()
            }
            None if found_justification_for_bottom => self.begin_next_round(),
            None if phase_complete => {
                // No strong quorum for bottom, so some COMMIT for another
                // value was sent. There can only be one such value, since it
                // must be justified by a strong quorum of PREPAREs. Another
                // participant could have observed a strong quorum for it
                // (votes from ⅓ of honest power plus a ⅓ equivocating
                // adversary), so sway to consider it a candidate.
                let sway = self
                    .rounds
                    .get(&round)
                    .ok_or(GpbftError::Invariant("missing round state"))?
                    .committed
                    .list_values()
                    .find(|value| !value.is_bottom())
                    .cloned();
                if let Some(value) = sway {
                    if !self.is_candidate(&value) {
                        warn!(
                            id = self.current.id,
                            from = %self.proposal,
                            to = %value,
                            "swayed by COMMIT"
                        );
                        self.add_candidate(value.clone());
                    }
                    if value != self.proposal {
                        self.proposal = value;
                        debug!(
                            id = self.current.id,
                            proposal = %self.proposal,
                            "adopting proposal after COMMIT"
                        );
                    }
                }
                self.begin_next_round()
            }
            None => {
                if self.should_rebroadcast() {
                    self.try_rebroadcast();
                }
                Ok(())
            }
        }
    }

    /// Broadcast this node's DECIDE message and begin the DECIDE phase, for
    /// a decision reached in the given round.
    fn begin_decide(&mut self, round: u64) -> Result<(), GpbftError> {
        self.current.phase = Phase::Decide;
        self.notify_progress();
        self.reset_rebroadcast_params();

        let quorum = self
            .rounds
            .get(&round)
            .ok_or(GpbftError::Invariant("missing round state"))?
            .committed
            .find_strong_quorum_for(&self.value.key())?
            .ok_or(GpbftError::Invariant(
                "begin decide without strong quorum for value",
            ))?;
        let justification =
            self.build_justification(quorum, round, Phase::Commit, self.value.clone())?;

        // DECIDE messages always specify round zero: out-of-order delivery
        // can make nodes decide the same value in different rounds, and each
        // node sends a single DECIDE, so the votes must match to aggregate.
        self.broadcast(0, Phase::Decide, self.value.clone(), false, Some(justification));
        Ok(())
    }

    /// Skip straight to DECIDE, without waiting for a strong quorum of
    /// COMMITs in any round. The justification must justify the value.
    fn skip_to_decide(&mut self, value: ECChain, justification: Justification) {
        debug!(
            id = self.current.id,
            round = self.current.round,
            value = %value,
            "skipping to DECIDE"
        );
        self.current.phase = Phase::Decide;
        self.notify_progress();
        self.proposal = value;
        self.value = self.proposal.clone();
        self.reset_rebroadcast_params();
        self.broadcast(0, Phase::Decide, self.value.clone(), false, Some(justification));
    }

    /// Attempt to terminate with a strong quorum of DECIDEs.
    fn try_decide(&mut self) -> Result<(), GpbftError> {
        match self.decision.find_strong_quorum_value()? {
            Some(quorum_value) => {
                let quorum = self
                    .decision
                    .find_strong_quorum_for(&quorum_value.key())?
                    .ok_or(GpbftError::Invariant(
                        "decide quorum value without a quorum of signers",
                    ))?;
                let decision =
                    self.build_justification(quorum, 0, Phase::Decide, quorum_value)?;
                self.terminate(decision);
                Ok(())
            }
            None => {
                self.try_rebroadcast();
                Ok(())
            }
        }
    }

    /// Move to the next round, constructing the CONVERGE justification.
    fn begin_next_round(&mut self) -> Result<(), GpbftError> {
        debug!(
            id = self.current.id,
            round = self.current.round + 1,
            proposal = %self.proposal,
            "moving to next round"
        );
        self.current.round += 1;
        self.ensure_round(self.current.round);

        // The proposal was updated at the end of COMMIT to a value for which
        // a justified COMMIT message was received, if there was one. If there
        // was none, there must have been a strong quorum for bottom instead.
        let bottom_key = ChainKey::bottom();
        let source = {
            let previous_round = self
                .rounds
                .get(&(self.current.round - 1))
                .ok_or(GpbftError::Invariant("missing previous round state"))?;
            let current_round = self
                .rounds
                .get(&self.current.round)
                .ok_or(GpbftError::Invariant("missing current round state"))?;
            if let Some(quorum) = previous_round.committed.find_strong_quorum_for(&bottom_key)? {
                JustificationSource::Quorum(quorum)
            } else if let Some(justification) = current_round
                .prepared
                .get_justification_of(Phase::Commit, &bottom_key)
            {
                JustificationSource::Ready(justification.clone())
            } else if let Some(justification) = current_round
                .converged
                .get_justification_of(Phase::Commit, &bottom_key)
            {
                JustificationSource::Ready(justification.clone())
            } else if let Some(justification) = previous_round
                .committed
                .received_justification_for(&self.proposal.key())
            {
                // A justification received from some participant, possibly
                // this node itself.
                JustificationSource::Ready(justification.clone())
            } else {
                return Err(GpbftError::Invariant(
                    "no justification to begin the next round",
                ));
            }
        };
        let justification = match source {
            JustificationSource::Quorum(quorum) => self.build_justification(
                quorum,
                self.current.round - 1,
                Phase::Commit,
                ECChain::bottom(),
            )?,
            JustificationSource::Ready(justification) => justification,
        };
        self.begin_converge(justification)
    }

    /// Jump ahead to the given round by initiating CONVERGE with the given
    /// justification.
    fn skip_to_round(
        &mut self,
        round: u64,
        chain: ECChain,
        justification: Justification,
    ) -> Result<(), GpbftError> {
        debug!(
            id = self.current.id,
            from = self.current.round,
            to = round,
            "skipping to round"
        );
        self.current.round = round;
        if justification.vote.phase == Phase::Prepare {
            warn!(
                id = self.current.id,
                from = %self.proposal,
                to = %chain,
                "swayed by skip to round"
            );
            self.add_candidate(chain.clone());
            self.proposal = chain;
        }
        self.begin_converge(justification)
    }

    /// Terminate the instance with a decision certificate.
    fn terminate(&mut self, decision: Justification) {
        info!(
            id = self.current.id,
            round = self.current.round,
            value = %decision.vote.value,
            "instance terminated"
        );
        self.current.phase = Phase::Terminated;
        self.notify_progress();
        self.value = decision.vote.value.clone();
        self.termination_value = Some(decision.clone());
        self.reset_rebroadcast_params();
        self.out.push(Action::Decided { decision });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Candidate Set
    // ═══════════════════════════════════════════════════════════════════════════

    /// Whether a chain is acceptable as a proposal to vote for.
    fn is_candidate(&self, chain: &ECChain) -> bool {
        self.candidates.contains(&chain.key())
    }

    /// Add every non-base prefix of a chain (the chain itself included) to
    /// the candidate set. Returns whether anything new was added.
    fn add_candidate_prefixes(&mut self, chain: &ECChain) -> bool {
        let mut added_any = false;
        for length in (1..chain.len()).rev() {
            if self.add_candidate(chain.prefix(length)) {
                added_any = true;
            }
        }
        added_any
    }

    fn add_candidate(&mut self, chain: ECChain) -> bool {
        self.candidates.insert(chain.key())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Round State
    // ═══════════════════════════════════════════════════════════════════════════

    /// Allocate round state on first reference.
    fn ensure_round(&mut self, round: u64) {
        self.rounds
            .entry(round)
            .or_insert_with(|| RoundState::new(Arc::clone(&self.power_table)));
    }

    fn round_mut(&mut self, round: u64) -> Result<&mut RoundState, GpbftError> {
        self.rounds
            .get_mut(&round)
            .ok_or(GpbftError::Invariant("missing round state"))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Broadcast & Justification
    // ═══════════════════════════════════════════════════════════════════════════

    fn broadcast(
        &mut self,
        round: u64,
        phase: Phase,
        value: ECChain,
        create_ticket: bool,
        justification: Option<Justification>,
    ) {
        let payload = Payload::new(
            self.current.id,
            round,
            phase,
            self.supplemental_data.clone(),
            value,
        );
        let builder = MessageBuilder {
            network_name: self.network_name.clone(),
            power_table: Arc::clone(&self.power_table),
            payload,
            justification,
            beacon_for_ticket: create_ticket.then(|| self.beacon.clone()),
        };
        self.out.push(Action::RequestBroadcast { builder });
    }

    /// Build a justification for a value from a quorum result.
    ///
    /// Aggregation failure is fatal: a strong quorum attested the value, so
    /// failing to aggregate it indicates a broken host.
    fn build_justification(
        &self,
        quorum: QuorumResult,
        round: u64,
        phase: Phase,
        value: ECChain,
    ) -> Result<Justification, GpbftError> {
        let signature = quorum.aggregate(self.aggregate.as_ref())?;
        Ok(Justification {
            vote: Payload::new(
                self.current.id,
                round,
                phase,
                self.supplemental_data.clone(),
                value,
            ),
            signers: quorum.signers_bitfield(),
            signature,
        })
    }

    fn notify_progress(&mut self) {
        self.out.push(Action::NotifyProgress {
            progress: self.current.clone(),
        });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Timers & Rebroadcast
    // ═══════════════════════════════════════════════════════════════════════════

    /// Request an alarm after the synchrony delay for the current round, and
    /// return the absolute time at which it fires.
    fn alarm_after_synchrony(&mut self, multiplier: f64) -> Duration {
        let timeout = self.now + self.config.synchrony_delay(self.current.round, multiplier);
        self.out.push(Action::SetAlarm { at: timeout });
        timeout
    }

    fn phase_timeout_elapsed(&self) -> bool {
        self.now >= self.phase_timeout
    }

    fn rebroadcast_timeout_elapsed(&self) -> bool {
        self.now >= self.rebroadcast_timeout
    }

    fn should_rebroadcast(&self) -> bool {
        self.phase_timeout_elapsed()
            || self.current.round > self.config.rebroadcast_immediately_after_round
    }

    fn reset_rebroadcast_params(&mut self) {
        self.rebroadcast_attempts = 0;
        self.rebroadcast_timeout = Duration::ZERO;
    }

    /// Check whether the rebroadcast timeout has elapsed, rebroadcasting and
    /// scheduling the next attempt if so; arm the first timeout otherwise.
    fn try_rebroadcast(&mut self) {
        if self.rebroadcast_attempts == 0 && self.rebroadcast_timeout == Duration::ZERO {
            // First time rebroadcast has become necessary. The offset for the
            // first attempt depends on where the instance stands:
            //  * in DECIDE there is no phase timeout and the last one may be
            //    far in the past, so use the current time;
            //  * past the immediate-rebroadcast round threshold, use the
            //    current time to avoid radio silence while phase timeouts
            //    grow exponentially large;
            //  * otherwise, offset from the phase timeout.
            let offset = if self.current.phase == Phase::Decide
                || self.current.round > self.config.rebroadcast_immediately_after_round
            {
                self.now
            } else {
                self.phase_timeout
            };
            self.rebroadcast_timeout = offset + self.config.rebroadcast_backoff(0);
            if self.phase_timeout_elapsed() {
                // The phase timeout has elapsed, so there is no pending alarm
                // to override.
                debug!(
                    id = self.current.id,
                    at = ?self.rebroadcast_timeout,
                    "scheduled initial rebroadcast"
                );
                self.out.push(Action::SetAlarm {
                    at: self.rebroadcast_timeout,
                });
            } else if self.rebroadcast_timeout < self.phase_timeout {
                // Rebroadcast falls due before the phase does: override the
                // alarm and re-check the phase timeout next cycle.
                debug!(
                    id = self.current.id,
                    at = ?self.rebroadcast_timeout,
                    phase_timeout = ?self.phase_timeout,
                    "scheduled initial rebroadcast before phase timeout"
                );
                self.out.push(Action::SetAlarm {
                    at: self.rebroadcast_timeout,
                });
            } else {
                // The phase alarm fires first and will get here again; reset
                // so arming is re-attempted once the phase expires.
                trace!(
                    id = self.current.id,
                    "deferring rebroadcast arming to the phase alarm"
                );
                self.reset_rebroadcast_params();
            }
        } else if self.rebroadcast_timeout_elapsed() {
            self.rebroadcast();
            self.rebroadcast_attempts += 1;

            // Offset the next attempt from the current time, not the alarm's
            // scheduled time: under slow wakeups a scheduled-time offset can
            // lag permanently behind the clock and rebroadcast without pause.
            self.rebroadcast_timeout =
                self.now + self.config.rebroadcast_backoff(self.rebroadcast_attempts);
            if self.phase_timeout_elapsed() {
                debug!(
                    id = self.current.id,
                    at = ?self.rebroadcast_timeout,
                    attempts = self.rebroadcast_attempts,
                    "scheduled next rebroadcast"
                );
                self.out.push(Action::SetAlarm {
                    at: self.rebroadcast_timeout,
                });
            } else if self.rebroadcast_timeout < self.phase_timeout {
                self.out.push(Action::SetAlarm {
                    at: self.rebroadcast_timeout,
                });
            } else {
                // The phase timeout falls due first; let its alarm run the
                // next cycle.
                self.out.push(Action::SetAlarm {
                    at: self.phase_timeout,
                });
            }
        }
        // Otherwise the rebroadcast timeout is armed but not yet due.
    }

    /// Re-request transmission of messages relevant to the instance's
    /// position: QUALITY plus everything from the current and previous
    /// rounds, or only DECIDE once deciding.
    ///
    /// This rebroadcasts more than strictly required; requests for messages
    /// that were never sent are silently ignored by the host.
    fn rebroadcast(&mut self) {
        match self.current.phase {
            Phase::Quality | Phase::Converge | Phase::Prepare | Phase::Commit => {
                self.rebroadcast_quietly(0, Phase::Quality);
                self.rebroadcast_quietly(self.current.round, Phase::Commit);
                self.rebroadcast_quietly(self.current.round, Phase::Prepare);
                self.rebroadcast_quietly(self.current.round, Phase::Converge);
                if self.current.round > 0 {
                    self.rebroadcast_quietly(self.current.round - 1, Phase::Commit);
                    self.rebroadcast_quietly(self.current.round - 1, Phase::Prepare);
                    self.rebroadcast_quietly(self.current.round - 1, Phase::Converge);
                }
            }
            Phase::Decide => self.rebroadcast_quietly(0, Phase::Decide),
            phase => warn!(
                id = self.current.id,
                %phase,
                "rebroadcast attempted in unexpected phase"
            ),
        }
    }

    fn rebroadcast_quietly(&mut self, round: u64, phase: Phase) {
        let instant = Instant {
            id: self.current.id,
            round,
            phase,
        };
        trace!(id = self.current.id, %instant, "requesting rebroadcast");
        self.out.push(Action::RequestRebroadcast { instant });
    }
}

impl StateMachine for Instance {
    type Error = GpbftError;

    fn set_time(&mut self, now: Duration) {
        Instance::set_time(self, now);
    }

    fn handle(&mut self, event: Event) -> Result<Vec<Action>, GpbftError> {
        match event {
            Event::AlarmFired => self.receive_alarm(),
            Event::MessageReceived { msg } => self.receive(*msg),
            Event::BatchReceived { msgs } => self.receive_many(msgs),
        }
    }
}
