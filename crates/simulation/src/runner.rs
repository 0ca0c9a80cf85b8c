//! Deterministic simulation runner.
//!
//! Owns a set of participants, the global event queue, and the simulated
//! network. The runner plays the host role for every participant: it signs
//! and transmits broadcasts, serves rebroadcast requests from a per-node
//! outbox, keeps the single pending alarm per node, and chains instances
//! together by feeding each decision back as the next instance's base.

use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::signing::{ConcatAggregate, SigningBackend};
use crate::NodeIndex;
use granite_core::{Action, Event, InstanceProgress, MessageBuilder};
use granite_gpbft::{GpbftConfig, GpbftError, Instance};
use granite_types::{
    ActorId, Aggregate, Cid, ECChain, GMessage, Justification, NetworkName, Phase, PowerTable,
    SupplementalData, TipSet,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// One simulated participant: its running instance and the host-side state
/// the runner keeps for it.
struct ParticipantState {
    instance: Instance,
    /// Messages broadcast so far, for rebroadcast replay.
    /// Keyed by (instance, round, phase) as named in rebroadcast requests.
    outbox: HashMap<(u64, u64, Phase), GMessage>,
    /// Queue key of the pending alarm; a new SetAlarm overrides it.
    pending_alarm: Option<EventKey>,
    /// Messages for instances this participant has not reached yet.
    future_messages: BTreeMap<u64, Vec<GMessage>>,
    /// Decision certificates, one per finished instance.
    certs: Vec<Justification>,
    /// Latest reported progress.
    progress: Option<InstanceProgress>,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Fresh broadcasts signed and transmitted.
    pub broadcasts: u64,
    /// Rebroadcast requests served from the outbox.
    pub rebroadcasts: u64,
    /// Point-to-point deliveries scheduled.
    pub messages_sent: u64,
    /// Deliveries dropped by a partition.
    pub dropped_partition: u64,
    /// Deliveries dropped by packet loss.
    pub dropped_loss: u64,
    /// Events discarded because the target node was paused.
    pub dropped_paused: u64,
    /// Messages for instances the node had already finished.
    pub stale_instance_messages: u64,
    /// Messages rejected by instance validation.
    pub invalid_messages: u64,
    /// Deliveries that raced termination.
    pub post_termination_deliveries: u64,
    /// Alarms scheduled.
    pub alarms_set: u64,
    /// Decisions reached across all nodes and instances.
    pub decisions: u64,
    /// Fatal instance errors (should stay zero).
    pub fatal_errors: u64,
}

impl SimulationStats {
    /// Message delivery rate among non-loopback sends.
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.dropped_partition + self.dropped_loss;
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

/// The epoch at which the simulated chain bootstraps.
const BOOTSTRAP_EPOCH: i64 = 950;

/// The chain input to instance zero: a bootstrap base plus one new tipset.
fn bootstrap_input() -> ECChain {
    let base = TipSet {
        epoch: BOOTSTRAP_EPOCH,
        key: vec![0xB0; 12],
        power_table: Cid::dag_cbor_blake2b(b"granite-sim-power"),
        commitments: [0u8; 32],
    };
    ECChain::new(base, [])
        .and_then(|chain| chain.extend([vec![0xB1; 12]]))
        .expect("bootstrap chain is valid")
}

/// The tipset key the simulated chain produces for an instance.
fn next_key(instance: u64) -> Vec<u8> {
    vec![(instance % 251) as u8 + 1; 12]
}

/// The chain input to the instance after a decision: the decided head plus
/// one new tipset built on it.
fn next_input(decided: &ECChain, next_instance: u64) -> ECChain {
    let head = decided.head().expect("decided value is never bottom").clone();
    ECChain::new(head, [])
        .and_then(|chain| chain.extend([next_key(next_instance)]))
        .expect("chain extension from a decided head is valid")
}

fn create_instance(
    config: &GpbftConfig,
    network_name: &NetworkName,
    power_table: &Arc<PowerTable>,
    aggregate: &Arc<ConcatAggregate>,
    id: u64,
    input: ECChain,
) -> Instance {
    let beacon = input.base().expect("input has a base").key.clone();
    let aggregate: Arc<dyn Aggregate> = Arc::clone(aggregate) as Arc<dyn Aggregate>;
    Instance::new(
        config.clone(),
        network_name.clone(),
        id,
        input,
        SupplementalData::default(),
        Arc::clone(power_table),
        aggregate,
        beacon,
    )
    .expect("simulation instance inputs are valid")
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions. Given the
/// same seed, a run produces identical results every time.
pub struct SimulationRunner {
    participants: Vec<ParticipantState>,
    signing: SigningBackend,
    power_table: Arc<PowerTable>,
    aggregate: Arc<ConcatAggregate>,
    consensus_config: GpbftConfig,
    network_name: NetworkName,
    network: SimulatedNetwork,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,
    /// Sequence counter for deterministic ordering.
    sequence: u64,
    /// Current simulation time.
    now: Duration,
    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,
    /// Nodes whose events are currently discarded.
    paused: HashSet<NodeIndex>,

    stats: SimulationStats,
}

impl SimulationRunner {
    /// Create a runner with equal power for every participant.
    pub fn new(network_config: NetworkConfig, consensus_config: GpbftConfig, seed: u64) -> Self {
        let weights = vec![1u64; network_config.num_participants as usize];
        Self::new_weighted(network_config, consensus_config, seed, &weights)
    }

    /// Create a runner with the given storage-power weights.
    pub fn new_weighted(
        network_config: NetworkConfig,
        consensus_config: GpbftConfig,
        seed: u64,
        weights: &[u64],
    ) -> Self {
        assert_eq!(
            weights.len(),
            network_config.num_participants as usize,
            "one weight per participant"
        );
        let network_name = NetworkName::new("granite-sim");
        let signing = SigningBackend::new(seed, network_config.num_participants, network_name.clone());
        let power_table = Arc::new(
            signing
                .power_table(weights)
                .expect("simulation power table is valid"),
        );
        let aggregate = Arc::new(ConcatAggregate);

        let participants = (0..network_config.num_participants)
            .map(|_| ParticipantState {
                instance: create_instance(
                    &consensus_config,
                    &network_name,
                    &power_table,
                    &aggregate,
                    0,
                    bootstrap_input(),
                ),
                outbox: HashMap::new(),
                pending_alarm: None,
                future_messages: BTreeMap::new(),
                certs: Vec::new(),
                progress: None,
            })
            .collect();

        info!(
            participants = network_config.num_participants,
            seed, "created simulation runner"
        );

        Self {
            participants,
            signing,
            power_table,
            aggregate,
            consensus_config,
            network_name,
            network: SimulatedNetwork::new(network_config),
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            paused: HashSet::new(),
            stats: SimulationStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn num_participants(&self) -> u32 {
        self.participants.len() as u32
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// The instance a node is currently running.
    pub fn current_instance(&self, node: NodeIndex) -> u64 {
        self.participants[node as usize].instance.id()
    }

    /// The node's latest reported progress.
    pub fn progress(&self, node: NodeIndex) -> Option<&InstanceProgress> {
        self.participants[node as usize].progress.as_ref()
    }

    /// All decision certificates a node holds, in instance order.
    pub fn certs(&self, node: NodeIndex) -> &[Justification] {
        &self.participants[node as usize].certs
    }

    /// The most recent decision certificate a node holds.
    pub fn latest_cert(&self, node: NodeIndex) -> Option<&Justification> {
        self.participants[node as usize].certs.last()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Control
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start every participant's first instance.
    pub fn start_all(&mut self) {
        for node in 0..self.participants.len() as NodeIndex {
            let idx = node as usize;
            self.participants[idx].instance.set_time(self.now);
            match self.participants[idx].instance.start() {
                Ok(actions) => self.process_actions(node, actions),
                Err(err) => {
                    self.stats.fatal_errors += 1;
                    error!(node, error = %err, "failed to start instance");
                }
            }
        }
    }

    /// Stop delivering events to a node. Messages and alarms addressed to it
    /// are discarded while paused.
    pub fn pause(&mut self, node: NodeIndex) {
        debug!(node, "pausing participant");
        self.paused.insert(node);
    }

    /// Resume a paused node, re-kicking its instance with an immediate alarm
    /// since the pending one may have been discarded.
    pub fn resume(&mut self, node: NodeIndex) {
        if self.paused.remove(&node) {
            debug!(node, "resuming participant");
            let key = self.schedule_event(node, self.now, Event::AlarmFired);
            self.participants[node as usize].pending_alarm = Some(key);
        }
    }

    /// Stand-in for the external certificate exchange: hand every lagging
    /// node the certificates its peers already hold, fast-forwarding it to
    /// the frontier instance.
    pub fn exchange_certificates(&mut self) {
        let mut known: BTreeMap<u64, Justification> = BTreeMap::new();
        for participant in &self.participants {
            for cert in &participant.certs {
                known.entry(cert.vote.instance).or_insert_with(|| cert.clone());
            }
        }
        for node in 0..self.participants.len() as NodeIndex {
            loop {
                let current = self.participants[node as usize].instance.id();
                match known.get(&current) {
                    Some(cert) => {
                        let cert = cert.clone();
                        debug!(node, instance = current, "certificate exchanged");
                        self.advance_instance(node, cert);
                    }
                    None => break,
                }
            }
        }
    }

    /// Run the simulation until no more events remain or the time limit is
    /// reached.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let (key, event) = self
                .event_queue
                .pop_first()
                .expect("checked non-empty above");
            self.now = key.time;
            self.step(key, event);
        }
    }

    /// Run until every listed node holds at least `instances` decision
    /// certificates, or the deadline passes. Returns whether the target was
    /// reached.
    pub fn run_until_nodes_reach(
        &mut self,
        nodes: &[NodeIndex],
        instances: usize,
        deadline: Duration,
    ) -> bool {
        loop {
            if nodes
                .iter()
                .all(|&node| self.participants[node as usize].certs.len() >= instances)
            {
                return true;
            }
            let Some((&key, _)) = self.event_queue.first_key_value() else {
                return false;
            };
            if key.time > deadline {
                return false;
            }
            let (key, event) = self
                .event_queue
                .pop_first()
                .expect("checked non-empty above");
            self.now = key.time;
            self.step(key, event);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Event Processing
    // ═══════════════════════════════════════════════════════════════════════════

    fn step(&mut self, key: EventKey, event: Event) {
        self.stats.events_processed += 1;
        let node = key.node;
        let idx = node as usize;

        if self.paused.contains(&node) {
            self.stats.dropped_paused += 1;
            if self.participants[idx].pending_alarm == Some(key) {
                self.participants[idx].pending_alarm = None;
            }
            return;
        }

        match event {
            Event::AlarmFired => {
                if self.participants[idx].pending_alarm == Some(key) {
                    self.participants[idx].pending_alarm = None;
                }
                self.participants[idx].instance.set_time(self.now);
                let result = self.participants[idx].instance.receive_alarm();
                match result {
                    Ok(actions) => self.process_actions(node, actions),
                    Err(err) => self.note_receive_error(node, err),
                }
            }
            Event::MessageReceived { msg } => self.deliver_message(node, *msg),
            Event::BatchReceived { msgs } => self.deliver_batch(node, msgs),
        }
    }

    /// Route one message to a node, respecting instance boundaries: buffer
    /// messages for future instances, drop messages for finished ones.
    fn deliver_message(&mut self, node: NodeIndex, msg: GMessage) {
        let idx = node as usize;
        let current = self.participants[idx].instance.id();
        match msg.vote.instance.cmp(&current) {
            Ordering::Less => {
                self.stats.stale_instance_messages += 1;
                trace!(
                    node,
                    instance = msg.vote.instance,
                    current,
                    "dropping message for finished instance"
                );
            }
            Ordering::Greater => {
                self.participants[idx]
                    .future_messages
                    .entry(msg.vote.instance)
                    .or_default()
                    .push(msg);
            }
            Ordering::Equal => {
                self.participants[idx].instance.set_time(self.now);
                let result = self.participants[idx].instance.receive(msg);
                match result {
                    Ok(actions) => self.process_actions(node, actions),
                    Err(err) => self.note_receive_error(node, err),
                }
            }
        }
    }

    fn deliver_batch(&mut self, node: NodeIndex, msgs: Vec<GMessage>) {
        let idx = node as usize;
        self.participants[idx].instance.set_time(self.now);
        let result = self.participants[idx].instance.receive_many(msgs);
        match result {
            Ok(actions) => self.process_actions(node, actions),
            Err(err) => self.note_receive_error(node, err),
        }
    }

    fn note_receive_error(&mut self, node: NodeIndex, error: GpbftError) {
        match error {
            GpbftError::ReceivedAfterTermination => {
                // Benign: a delivery raced the decision.
                self.stats.post_termination_deliveries += 1;
            }
            error if error.is_validation() => {
                self.stats.invalid_messages += 1;
                debug!(node, %error, "dropped invalid message");
            }
            error => {
                self.stats.fatal_errors += 1;
                error!(node, %error, "instance aborted");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Action Execution
    // ═══════════════════════════════════════════════════════════════════════════

    fn process_actions(&mut self, node: NodeIndex, actions: Vec<Action>) {
        for action in actions {
            self.process_action(node, action);
        }
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::RequestBroadcast { builder } => {
                let msg = self.sign_message(from, builder);
                let key = (msg.vote.instance, msg.vote.round, msg.vote.phase);
                self.participants[from as usize].outbox.insert(key, msg.clone());
                self.stats.broadcasts += 1;
                self.deliver_to_all(from, msg);
            }
            Action::RequestRebroadcast { instant } => {
                let key = (instant.id, instant.round, instant.phase);
                let msg = self.participants[from as usize].outbox.get(&key).cloned();
                if let Some(msg) = msg {
                    self.stats.rebroadcasts += 1;
                    self.deliver_to_all(from, msg);
                }
                // Requests for messages never sent are silently ignored.
            }
            Action::SetAlarm { at } => {
                // At most one alarm per node; a new request overrides the
                // pending one.
                if let Some(key) = self.participants[from as usize].pending_alarm.take() {
                    self.event_queue.remove(&key);
                }
                let fire_at = at.max(self.now);
                let key = self.schedule_event(from, fire_at, Event::AlarmFired);
                self.participants[from as usize].pending_alarm = Some(key);
                self.stats.alarms_set += 1;
            }
            Action::NotifyProgress { progress } => {
                trace!(node = from, %progress, "progress");
                self.participants[from as usize].progress = Some(progress);
            }
            Action::Decided { decision } => {
                info!(
                    node = from,
                    instance = decision.vote.instance,
                    value = %decision.vote.value,
                    "decision reached"
                );
                self.advance_instance(from, decision);
            }
        }
    }

    /// Record a decision and move the node to the next instance, whose input
    /// extends the decided head.
    fn advance_instance(&mut self, node: NodeIndex, decision: Justification) {
        let idx = node as usize;
        self.stats.decisions += 1;
        let next_id = decision.vote.instance + 1;
        let input = next_input(&decision.vote.value, next_id);
        self.participants[idx].certs.push(decision);

        // Drop the finished instance along with its pending alarm.
        if let Some(key) = self.participants[idx].pending_alarm.take() {
            self.event_queue.remove(&key);
        }

        let mut instance = create_instance(
            &self.consensus_config,
            &self.network_name,
            &self.power_table,
            &self.aggregate,
            next_id,
            input,
        );
        instance.set_time(self.now);
        let started = instance.start();
        self.participants[idx].instance = instance;
        match started {
            Ok(actions) => self.process_actions(node, actions),
            Err(err) => {
                self.stats.fatal_errors += 1;
                error!(node, error = %err, "failed to start next instance");
            }
        }

        // Deliver anything that arrived for the new instance early.
        let buffered = self.participants[idx]
            .future_messages
            .remove(&next_id)
            .unwrap_or_default();
        if !buffered.is_empty() {
            self.deliver_batch(node, buffered);
        }
    }

    /// Sign a message builder into a transmissible message.
    fn sign_message(&mut self, from: NodeIndex, builder: MessageBuilder) -> GMessage {
        let signature = self.signing.sign_payload(from, &builder.payload);
        let ticket = builder
            .beacon_for_ticket
            .as_ref()
            .map(|beacon| self.signing.make_ticket(from, beacon, builder.payload.round));
        GMessage {
            sender: ActorId(from as u64),
            vote: builder.payload,
            signature,
            ticket,
            justification: builder.justification,
        }
    }

    /// Gossip a message to every node: immediate lossless loopback to the
    /// sender, sampled latency and loss for everyone else.
    fn deliver_to_all(&mut self, from: NodeIndex, msg: GMessage) {
        for to in 0..self.participants.len() as NodeIndex {
            if to == from {
                self.schedule_event(
                    to,
                    self.now,
                    Event::MessageReceived {
                        msg: Box::new(msg.clone()),
                    },
                );
                continue;
            }
            if self.network.is_partitioned(from, to) {
                self.stats.dropped_partition += 1;
                continue;
            }
            if self.network.should_drop_packet(&mut self.rng) {
                self.stats.dropped_loss += 1;
                continue;
            }
            let latency = self.network.sample_latency(&mut self.rng);
            self.schedule_event(
                to,
                self.now + latency,
                Event::MessageReceived {
                    msg: Box::new(msg.clone()),
                },
            );
            self.stats.messages_sent += 1;
        }
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }
}
