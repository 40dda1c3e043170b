//! Bracha reliable broadcast. A corrupted sender cannot make two honest
//! players deliver different payloads, and if any honest player delivers,
//! all of them do (n >= 3t + 1).
//!
//! ECHO and READY votes carry only the SHA3-256 digest of the payload; the
//! payload itself travels in INIT and piggybacked on READY, so players the
//! sender skipped can still catch up.

use std::collections::HashMap;
use std::rc::Rc;

use sha3::{Digest, Sha3_256};

use crate::error::MpcError;
use crate::exec::ProgramCounter;
use crate::share::Promise;
use crate::PartyId;

use super::{MessageKind, Runtime, WireMessage};

type PayloadDigest = [u8; 32];

/// Cap on instances opened by remote votes alone, before the local
/// operation has attached. A Byzantine peer minting counters at will
/// cannot grow the instance map past this.
const MAX_PENDING_INSTANCES: usize = 1024;

fn digest_of(payload: &[u8]) -> PayloadDigest {
    Sha3_256::digest(payload).into()
}

/// One entry of the broadcast instance map.
pub(super) enum BroadcastSlot {
    Active(BroadcastState),
    /// The instance delivered and its vote state was torn down. The payload
    /// is kept only until the local operation attaches and collects it;
    /// afterwards the marker just absorbs straggler votes.
    Delivered(Option<Vec<u8>>),
}

/// Per-instance protocol state. Instances are created lazily: either by the
/// local `broadcast` call or by the first message from a faster peer,
/// whichever happens first.
pub(super) struct BroadcastState {
    output: Promise<Vec<u8>>,
    /// Designated sender; known once the local operation has started.
    sender: Option<PartyId>,
    init_from: HashMap<PartyId, Vec<u8>>,
    echo_from: HashMap<PartyId, PayloadDigest>,
    ready_from: HashMap<PartyId, PayloadDigest>,
    /// Payloads seen with a verified digest.
    payloads: HashMap<PayloadDigest, Vec<u8>>,
    sent_echo: bool,
    sent_ready: bool,
    delivered: bool,
}

impl Default for BroadcastState {
    fn default() -> Self {
        BroadcastState {
            output: Promise::new(),
            sender: None,
            init_from: HashMap::new(),
            echo_from: HashMap::new(),
            ready_from: HashMap::new(),
            payloads: HashMap::new(),
            sent_echo: false,
            sent_ready: false,
            delivered: false,
        }
    }
}

impl BroadcastState {
    pub(super) fn fail(self, error: MpcError) {
        if !self.delivered {
            self.output.resolve(Err(error));
        }
    }

    fn echo_count(&self, digest: &PayloadDigest) -> usize {
        self.echo_from.values().filter(|d| *d == digest).count()
    }

    fn ready_count(&self, digest: &PayloadDigest) -> usize {
        self.ready_from.values().filter(|d| *d == digest).count()
    }

    /// Run the phase transitions enabled by the current state; returns the
    /// payload on the transition to delivered.
    fn advance(&mut self, runtime: &Runtime, pc: &ProgramCounter) -> Option<Vec<u8>> {
        let n = runtime.num_players();
        let t = runtime.threshold();
        let me = runtime.id();

        // Register the designated sender's payload.
        if let Some(sender) = self.sender {
            if let Some(payload) = self.init_from.get(&sender) {
                self.payloads
                    .entry(digest_of(payload))
                    .or_insert_with(|| payload.clone());
            }
        }

        // ECHO on the sender's INIT.
        if !self.sent_echo {
            let digest = self
                .sender
                .and_then(|sender| self.init_from.get(&sender))
                .map(|payload| digest_of(payload));
            if let Some(digest) = digest {
                self.sent_echo = true;
                self.echo_from.insert(me, digest);
                runtime.send_to_peers(WireMessage {
                    pc: pc.clone(),
                    kind: MessageKind::BroadcastEcho(digest),
                });
            }
        }

        // READY on an echo quorum, or on t + 1 readies (amplification).
        if !self.sent_ready {
            let candidates: Vec<PayloadDigest> = self
                .echo_from
                .values()
                .chain(self.ready_from.values())
                .copied()
                .collect();
            let quorum = candidates.iter().find(|digest| {
                2 * self.echo_count(digest) > n + t || self.ready_count(digest) >= t + 1
            });
            if let Some(&digest) = quorum {
                self.sent_ready = true;
                self.ready_from.insert(me, digest);
                runtime.send_to_peers(WireMessage {
                    pc: pc.clone(),
                    kind: MessageKind::BroadcastReady(digest, self.payloads.get(&digest).cloned()),
                });
            }
        }

        // Deliver on 2t + 1 readies, once the matching payload is known.
        if !self.delivered {
            let candidates: Vec<PayloadDigest> = self.ready_from.values().copied().collect();
            for digest in candidates {
                if self.ready_count(&digest) >= 2 * t + 1 {
                    if let Some(payload) = self.payloads.get(&digest) {
                        self.delivered = true;
                        let payload = payload.clone();
                        // Instance is finished; free the vote maps.
                        self.init_from.clear();
                        self.echo_from.clear();
                        self.ready_from.clear();
                        self.payloads.clear();
                        return Some(payload);
                    }
                }
            }
        }
        None
    }
}

impl Runtime {
    /// Reliably broadcast a payload from each of the given senders; returns
    /// one delivery promise per sender, in caller order. Non-senders pass
    /// `None`.
    ///
    /// Three message rounds in the fault-free case; safety requires
    /// n >= 3t + 1 and counts every player's vote at most once.
    pub fn broadcast(
        self: &Rc<Self>,
        senders: &[PartyId],
        payload: Option<Vec<u8>>,
    ) -> Vec<Promise<Vec<u8>>> {
        assert_eq!(
            senders.contains(&self.id()),
            payload.is_some(),
            "exactly the senders supply a payload"
        );

        senders
            .iter()
            .map(|&sender| {
                let pc = self.tag();
                if sender == self.id() {
                    let Some(payload) = payload.clone() else {
                        panic!("sender without a payload");
                    };
                    self.send_to_peers(WireMessage {
                        pc: pc.clone(),
                        kind: MessageKind::BroadcastInit(payload.clone()),
                    });
                    self.attach_instance(pc, sender, Some(payload))
                } else {
                    self.attach_instance(pc, sender, None)
                }
            })
            .collect()
    }

    fn attach_instance(
        self: &Rc<Self>,
        pc: ProgramCounter,
        sender: PartyId,
        own_payload: Option<Vec<u8>>,
    ) -> Promise<Vec<u8>> {
        if let Some(error) = self.poisoned.borrow().clone() {
            return Promise::failed(error);
        }

        let (output, delivered) = {
            let mut broadcasts = self.broadcasts.borrow_mut();
            let mut state = match broadcasts.remove(&pc) {
                Some(BroadcastSlot::Delivered(payload)) => {
                    // Peers finished before the local operation started.
                    broadcasts.insert(pc, BroadcastSlot::Delivered(None));
                    return match payload {
                        Some(payload) => Promise::resolved(payload),
                        None => Promise::failed(MpcError::ProtocolSequence(
                            "broadcast instance attached twice".into(),
                        )),
                    };
                }
                Some(BroadcastSlot::Active(state)) => state,
                None => BroadcastState::default(),
            };
            state.sender = Some(sender);
            if let Some(payload) = own_payload {
                state.init_from.insert(self.id(), payload);
            }
            let delivered = state.advance(self, &pc);
            let output = state.output.clone();
            let slot = if delivered.is_some() {
                BroadcastSlot::Delivered(None)
            } else {
                BroadcastSlot::Active(state)
            };
            broadcasts.insert(pc, slot);
            (output, delivered)
        };
        if let Some(payload) = delivered {
            output.resolve(Ok(payload));
        }
        output
    }

    pub(super) fn handle_broadcast_message(
        self: &Rc<Self>,
        peer: PartyId,
        pc: ProgramCounter,
        kind: MessageKind,
    ) {
        let delivered = {
            let mut broadcasts = self.broadcasts.borrow_mut();
            let mut state = match broadcasts.remove(&pc) {
                Some(BroadcastSlot::Active(state)) => state,
                Some(slot @ BroadcastSlot::Delivered(_)) => {
                    // Straggler vote for a finished instance.
                    broadcasts.insert(pc, slot);
                    return;
                }
                None => {
                    // A vote arriving ahead of the local operation opens the
                    // instance; cap how many a peer can open this way.
                    let pending = broadcasts
                        .values()
                        .filter(|slot| {
                            matches!(slot, BroadcastSlot::Active(state) if state.sender.is_none())
                        })
                        .count();
                    if pending >= MAX_PENDING_INSTANCES {
                        tracing::warn!(peer, "broadcast instance limit reached, dropping vote");
                        return;
                    }
                    BroadcastState::default()
                }
            };
            match kind {
                MessageKind::BroadcastInit(payload) => {
                    // Only the first INIT from a source counts.
                    state.init_from.entry(peer).or_insert(payload);
                }
                MessageKind::BroadcastEcho(digest) => {
                    state.echo_from.entry(peer).or_insert(digest);
                }
                MessageKind::BroadcastReady(digest, payload) => {
                    if let Some(payload) = payload {
                        // Reject a piggybacked payload not matching its
                        // claimed digest.
                        if digest_of(&payload) == digest {
                            state.payloads.entry(digest).or_insert(payload);
                        }
                    }
                    state.ready_from.entry(peer).or_insert(digest);
                }
                MessageKind::Share(_) => {
                    tracing::warn!(peer, "share message routed to broadcast");
                    broadcasts.insert(pc, BroadcastSlot::Active(state));
                    return;
                }
            }
            match state.advance(self, &pc) {
                Some(payload) => {
                    let output = state.output.clone();
                    // Without a local attach yet, the payload must survive
                    // until the operation comes asking for it.
                    let keep = if state.sender.is_some() {
                        BroadcastSlot::Delivered(None)
                    } else {
                        BroadcastSlot::Delivered(Some(payload.clone()))
                    };
                    broadcasts.insert(pc, keep);
                    Some((output, payload))
                }
                None => {
                    broadcasts.insert(pc, BroadcastSlot::Active(state));
                    None
                }
            }
        };
        if let Some((output, payload)) = delivered {
            output.resolve(Ok(payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::LocalSet;

    use super::*;
    use crate::prss::PrssKeys;
    use crate::runtime::{RuntimeOptions, RuntimeParams, Security};

    fn runtime(id: PartyId) -> Rc<Runtime> {
        Runtime::start(
            RuntimeParams {
                id,
                num_players: 4,
                threshold: 1,
                security: Security::Active,
            },
            RuntimeOptions::default(),
            PrssKeys::default(),
            Vec::new(),
        )
    }

    fn ready_for(payload: &[u8]) -> MessageKind {
        MessageKind::BroadcastReady(digest_of(payload), Some(payload.to_vec()))
    }

    #[tokio::test]
    async fn delivered_instance_collapses_to_a_marker() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = runtime(1);
                let payload = b"vote".to_vec();
                let pc = ProgramCounter(vec![1]);
                let output = runtime.broadcast(&[1], Some(payload.clone())).remove(0);

                // Two peer readies plus the amplified own ready reach the
                // 2t + 1 quorum.
                runtime.handle_broadcast_message(2, pc.clone(), ready_for(&payload));
                runtime.handle_broadcast_message(3, pc.clone(), ready_for(&payload));
                assert_eq!(output.peek(), Some(Ok(payload.clone())));

                // The vote state is gone; only a compact marker remains.
                {
                    let broadcasts = runtime.broadcasts.borrow();
                    assert_eq!(broadcasts.len(), 1);
                    assert!(matches!(
                        broadcasts.get(&pc),
                        Some(BroadcastSlot::Delivered(None))
                    ));
                }

                // A straggler's vote is absorbed without reopening anything.
                runtime.handle_broadcast_message(4, pc.clone(), ready_for(&payload));
                let broadcasts = runtime.broadcasts.borrow();
                assert_eq!(broadcasts.len(), 1);
                assert!(matches!(
                    broadcasts.get(&pc),
                    Some(BroadcastSlot::Delivered(None))
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn delivery_ahead_of_the_local_operation_keeps_the_payload() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = runtime(1);
                let payload = b"early quorum".to_vec();
                let pc = ProgramCounter(vec![1]);

                // Peers finish before the local operation starts.
                runtime.handle_broadcast_message(3, pc.clone(), ready_for(&payload));
                runtime.handle_broadcast_message(4, pc.clone(), ready_for(&payload));

                let output = runtime.broadcast(&[2], None).remove(0);
                assert_eq!(output.peek(), Some(Ok(payload)));

                // Attaching collected the payload; the marker is emptied.
                let broadcasts = runtime.broadcasts.borrow();
                assert!(matches!(
                    broadcasts.get(&pc),
                    Some(BroadcastSlot::Delivered(None))
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn unsolicited_votes_cannot_grow_the_instance_map_unboundedly() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let runtime = runtime(1);
                for counter in 0..MAX_PENDING_INSTANCES as u32 + 50 {
                    runtime.handle_broadcast_message(
                        3,
                        ProgramCounter(vec![9, counter]),
                        MessageKind::BroadcastInit(b"junk".to_vec()),
                    );
                }
                assert_eq!(runtime.broadcasts.borrow().len(), MAX_PENDING_INSTANCES);

                // An instance the local operation attached is exempt from
                // the cap and still delivers.
                let payload = b"real payload".to_vec();
                let output = runtime.broadcast(&[2], None).remove(0);
                let pc = ProgramCounter(vec![1]);
                runtime.handle_broadcast_message(2, pc.clone(), ready_for(&payload));
                runtime.handle_broadcast_message(4, pc, ready_for(&payload));
                assert_eq!(output.peek(), Some(Ok(payload)));
            })
            .await;
    }
}
