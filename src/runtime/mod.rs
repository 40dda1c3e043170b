//! The runtime: per-player protocol state, the message registry, and the
//! event loop wiring transport channels to dataflow promises.
//!
//! One runtime instance per player, single-threaded on a tokio `LocalSet`.
//! Every protocol message carries a program counter; the registry matches
//! messages to the promises expecting them regardless of which side arrives
//! first.

mod active;
mod broadcast;
mod comparison;
mod ops;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use futures::{SinkExt, StreamExt};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task;

use crate::error::MpcError;
use crate::exec::{CounterStack, ProgramCounter};
use crate::prss::PrssKeys;
use crate::share::Promise;
use crate::transport::PeerChannel;
use crate::PartyId;

use broadcast::BroadcastSlot;

/// Adversary model the runtime protects against.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Security {
    /// Corrupted players follow the protocol; requires n >= 2t + 1.
    Passive,
    /// Corrupted players may misbehave arbitrarily; requires n >= 3t + 1.
    Active,
}

/// Static protocol parameters, identical at every player apart from `id`.
#[derive(Clone, Debug)]
pub struct RuntimeParams {
    pub id: PartyId,
    pub num_players: usize,
    pub threshold: usize,
    pub security: Security,
}

/// Tunables for protocols that work on bounded integers.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Bit length of comparison operands.
    pub bit_length: usize,
    /// Statistical masking parameter for comparisons.
    pub security_parameter: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            bit_length: 32,
            security_parameter: 30,
        }
    }
}

/// One protocol message. Field elements travel as their `u64`
/// representatives; the receiver rebuilds elements through its own field
/// descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub pc: ProgramCounter,
    pub kind: MessageKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessageKind {
    /// A point of some sharing, or any other single field element.
    Share(u64),
    /// Reliable-broadcast payload dissemination.
    BroadcastInit(Vec<u8>),
    /// Digest-only echo of a broadcast payload.
    BroadcastEcho([u8; 32]),
    /// Ready vote; carries the payload when the voter knows it, so players
    /// the sender skipped can still deliver.
    BroadcastReady([u8; 32], Option<Vec<u8>>),
}

enum Event {
    Message(PartyId, WireMessage),
    Disconnected(PartyId),
}

enum Slot {
    /// Message arrived before anything expected it.
    Arrived(u64),
    /// A protocol operation is waiting for the message.
    Expected(Promise<u64>),
}

/// Per-player protocol engine. Constructed with [`Runtime::start`] inside a
/// `LocalSet`; kept behind `Rc`, shares hold it weakly.
pub struct Runtime {
    params: RuntimeParams,
    options: RuntimeOptions,
    keys: PrssKeys,
    counter: CounterStack,
    registry: RefCell<HashMap<(ProgramCounter, PartyId), Slot>>,
    broadcasts: RefCell<HashMap<ProgramCounter, BroadcastSlot>>,
    outgoing: HashMap<PartyId, mpsc::UnboundedSender<WireMessage>>,
    dead: RefCell<HashSet<PartyId>>,
    poisoned: RefCell<Option<MpcError>>,
    rng: RefCell<SmallRng>,
}

impl Runtime {
    /// Spawn the per-peer reader and writer tasks plus the event loop, and
    /// return the runtime handle. Must run inside a `LocalSet`.
    pub fn start(
        params: RuntimeParams,
        options: RuntimeOptions,
        keys: PrssKeys,
        channels: Vec<PeerChannel>,
    ) -> Rc<Runtime> {
        assert!(params.id >= 1 && params.id <= params.num_players);
        match params.security {
            Security::Passive => assert!(
                params.num_players >= 2 * params.threshold + 1,
                "passive security needs n >= 2t + 1"
            ),
            Security::Active => assert!(
                params.num_players >= 3 * params.threshold + 1,
                "active security needs n >= 3t + 1"
            ),
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut outgoing = HashMap::new();

        for channel in channels {
            let PeerChannel {
                id: peer,
                mut sink,
                mut stream,
            } = channel;
            assert!(peer != params.id && peer >= 1 && peer <= params.num_players);

            let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
            outgoing.insert(peer, tx);
            task::spawn_local(async move {
                while let Some(message) = rx.recv().await {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
            });

            let events = event_tx.clone();
            task::spawn_local(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(message) => {
                            if events.send(Event::Message(peer, message)).is_err() {
                                return;
                            }
                        }
                        Err(error) => {
                            tracing::warn!(peer, %error, "peer channel failed");
                            break;
                        }
                    }
                }
                let _ = events.send(Event::Disconnected(peer));
            });
        }

        let runtime = Rc::new(Runtime {
            params,
            options,
            keys,
            counter: CounterStack::new(),
            registry: RefCell::new(HashMap::new()),
            broadcasts: RefCell::new(HashMap::new()),
            outgoing,
            dead: RefCell::new(HashSet::new()),
            poisoned: RefCell::new(None),
            rng: RefCell::new(SmallRng::from_entropy()),
        });

        let weak = Rc::downgrade(&runtime);
        task::spawn_local(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(runtime) = weak.upgrade() else { break };
                runtime.handle_event(event);
            }
        });

        runtime
    }

    pub fn id(&self) -> PartyId {
        self.params.id
    }

    pub fn num_players(&self) -> usize {
        self.params.num_players
    }

    pub fn threshold(&self) -> usize {
        self.params.threshold
    }

    pub fn security(&self) -> Security {
        self.params.security
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub(crate) fn prss_keys(&self) -> &PrssKeys {
        &self.keys
    }

    pub(crate) fn rng(&self) -> &RefCell<SmallRng> {
        &self.rng
    }

    /// All player identifiers, own id included.
    pub fn players(&self) -> impl Iterator<Item = PartyId> {
        1..=self.params.num_players
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = PartyId> + '_ {
        let me = self.params.id;
        self.players().filter(move |&id| id != me)
    }

    /// Issue a fresh program counter for one logical operation.
    pub(crate) fn tag(&self) -> ProgramCounter {
        self.counter.tag()
    }

    /// Run `callback` when `promise` resolves, under the program counter
    /// position saved now. Every player saves the same position at the same
    /// call site, so operations issued from inside the callback tag their
    /// messages identically everywhere.
    pub(crate) fn schedule<T: Clone + 'static>(
        self: &Rc<Self>,
        promise: &Promise<T>,
        callback: impl FnOnce(&Rc<Runtime>, &Result<T, MpcError>) + 'static,
    ) {
        let saved = self.counter.subscope();
        let weak = Rc::downgrade(self);
        promise.on_resolved(move |outcome| {
            if let Some(runtime) = weak.upgrade() {
                let previous = runtime.counter.swap(saved);
                callback(&runtime, outcome);
                runtime.counter.swap(previous);
            }
        });
    }

    pub(crate) fn send_to(&self, peer: PartyId, message: WireMessage) {
        if let Some(tx) = self.outgoing.get(&peer) {
            // A closed writer shows up as a Disconnected event; nothing to
            // do about it here.
            let _ = tx.send(message);
        }
    }

    pub(crate) fn send_to_peers(&self, message: WireMessage) {
        for peer in self.peers() {
            self.send_to(peer, message.clone());
        }
    }

    /// The promise for the message tagged `pc` from `from`, whether it has
    /// arrived already or not.
    pub(crate) fn expect_share(&self, pc: ProgramCounter, from: PartyId) -> Promise<u64> {
        if let Some(error) = self.poisoned.borrow().clone() {
            return Promise::failed(error);
        }

        let mut registry = self.registry.borrow_mut();
        match registry.remove(&(pc.clone(), from)) {
            Some(Slot::Arrived(value)) => Promise::resolved(value),
            Some(Slot::Expected(promise)) => {
                debug_assert!(false, "two expectations for one message slot");
                tracing::error!(?pc, from, "two expectations for one message slot");
                registry.insert((pc, from), Slot::Expected(promise.clone()));
                promise
            }
            None => {
                if self.dead.borrow().contains(&from) {
                    return Promise::failed(MpcError::Network { peer: from });
                }
                let promise = Promise::new();
                registry.insert((pc, from), Slot::Expected(promise.clone()));
                promise
            }
        }
    }

    fn handle_event(self: &Rc<Self>, event: Event) {
        if self.poisoned.borrow().is_some() {
            return;
        }
        match event {
            Event::Message(peer, message) => self.dispatch(peer, message),
            Event::Disconnected(peer) => self.handle_disconnect(peer),
        }
    }

    fn dispatch(self: &Rc<Self>, peer: PartyId, message: WireMessage) {
        let WireMessage { pc, kind } = message;
        match kind {
            MessageKind::Share(value) => {
                let slot = self.registry.borrow_mut().remove(&(pc.clone(), peer));
                match slot {
                    Some(Slot::Expected(promise)) => promise.resolve(Ok(value)),
                    Some(Slot::Arrived(_)) => {
                        self.poison(MpcError::ProtocolSequence(format!(
                            "duplicate message from player {} for counter {:?}",
                            peer, pc.0
                        )));
                    }
                    None => {
                        self.registry
                            .borrow_mut()
                            .insert((pc, peer), Slot::Arrived(value));
                    }
                }
            }
            kind => self.handle_broadcast_message(peer, pc, kind),
        }
    }

    fn handle_disconnect(&self, peer: PartyId) {
        tracing::info!(peer, "peer disconnected");
        self.dead.borrow_mut().insert(peer);

        // Messages already in the registry stay usable; only unmet
        // expectations fail.
        let failed: Vec<Promise<u64>> = {
            let mut registry = self.registry.borrow_mut();
            let keys: Vec<_> = registry
                .iter()
                .filter(|((_, from), slot)| *from == peer && matches!(slot, Slot::Expected(_)))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| match registry.remove(&key) {
                    Some(Slot::Expected(promise)) => Some(promise),
                    _ => None,
                })
                .collect()
        };
        for promise in failed {
            promise.resolve(Err(MpcError::Network { peer }));
        }
    }

    /// Fatal protocol violation: fail every pending expectation and refuse
    /// further work.
    fn poison(&self, error: MpcError) {
        tracing::error!(%error, "protocol poisoned");
        *self.poisoned.borrow_mut() = Some(error.clone());

        let registry: Vec<_> = self.registry.borrow_mut().drain().collect();
        for (_, slot) in registry {
            if let Slot::Expected(promise) = slot {
                promise.resolve(Err(error.clone()));
            }
        }
        let broadcasts: Vec<_> = self.broadcasts.borrow_mut().drain().collect();
        for (_, slot) in broadcasts {
            if let BroadcastSlot::Active(state) = slot {
                state.fail(error.clone());
            }
        }
    }
}
