//! Multi-player protocol tests over in-process duplex meshes: every player
//! runs a real runtime on the same `LocalSet`, exchanging length-framed
//! bincode messages.

use std::rc::Rc;
use std::time::Duration;

use futures::StreamExt;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use sha3::{Digest, Sha3_256};
use tokio::task::LocalSet;

use shamir_mpc::exec::ProgramCounter;
use shamir_mpc::prss::{self, PrssKeys};
use shamir_mpc::runtime::{MessageKind, WireMessage};
use shamir_mpc::transport::{self, PeerChannel};
use shamir_mpc::{
    Field, Gf256, MpcError, PartyId, PrimeField, Runtime, RuntimeOptions, RuntimeParams, Security,
};

fn setup(num_players: usize, threshold: usize, seed: u64) -> (Vec<PrssKeys>, Vec<Vec<PeerChannel>>) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
    let mut rng = SmallRng::seed_from_u64(seed);
    let keys = prss::generate_keys(num_players, threshold, &mut rng);
    let meshes = transport::local_mesh(num_players, 64 * 1024);
    (keys, meshes)
}

fn start(
    id: PartyId,
    num_players: usize,
    threshold: usize,
    security: Security,
    options: RuntimeOptions,
    keys: PrssKeys,
    channels: Vec<PeerChannel>,
) -> Rc<Runtime> {
    Runtime::start(
        RuntimeParams {
            id,
            num_players,
            threshold,
            security,
        },
        options,
        keys,
        channels,
    )
}

/// Delay every message arriving over the channel from `from`, leaving the
/// other channels untouched.
fn delay_incoming(channels: &mut [PeerChannel], from: PartyId, delay: Duration) {
    for channel in channels.iter_mut() {
        if channel.id == from {
            let stream =
                std::mem::replace(&mut channel.stream, Box::pin(futures::stream::empty()));
            channel.stream = Box::pin(stream.then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            }));
        }
    }
}

#[tokio::test]
async fn three_players_open_sum_of_product() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(3, 1, 1);
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        3,
                        1,
                        Security::Passive,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(31);
                    let input = match id {
                        1 => 7,
                        2 => 5,
                        _ => 3,
                    };
                    let shares = runtime.input(&[1, 2, 3], &field, Some(field.element(input)));
                    let product = runtime.mul(&shares[1], &shares[2]);
                    runtime.open(&(shares[0].clone() + product)).await
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap(), Ok(22));
            }
        })
        .await;
}

#[tokio::test]
async fn active_multiplication_uses_triples() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(4, 1, 2);
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        4,
                        1,
                        Security::Active,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(1031);
                    let value = if id == 1 {
                        Some(field.element(23))
                    } else if id == 2 {
                        Some(field.element(17))
                    } else {
                        None
                    };
                    let shares = runtime.input(&[1, 2], &field, value);
                    let product = runtime.mul(&shares[0], &shares[1]);
                    runtime.open(&product).await
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap(), Ok(23 * 17 % 1031));
            }
        })
        .await;
}

#[tokio::test]
async fn gf256_arithmetic_end_to_end() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(3, 1, 3);
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        3,
                        1,
                        Security::Passive,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = Gf256;
                    let input = match id {
                        1 => 7,
                        2 => 5,
                        _ => 3,
                    };
                    let shares = runtime.input(&[1, 2, 3], &field, Some(input));
                    let product = runtime.mul(&shares[1], &shares[2]);
                    // xor is addition in GF(2^8)
                    runtime.open(&(shares[0].clone() ^ product)).await
                }));
            }
            for handle in handles {
                // 5 * 3 = 0x0f in GF(2^8), 7 xor 0x0f = 8
                assert_eq!(handle.await.unwrap(), Ok(8));
            }
        })
        .await;
}

#[tokio::test]
async fn addition_needs_no_communication() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let mut rng = SmallRng::seed_from_u64(4);
            let keys = prss::generate_keys(3, 1, &mut rng);
            // No transport at all: a runtime with zero peer channels can
            // still do linear arithmetic.
            let runtime = start(
                1,
                3,
                1,
                Security::Passive,
                RuntimeOptions::default(),
                keys[0].clone(),
                Vec::new(),
            );
            let field = PrimeField::new(31);
            let a = runtime.share_constant(&field, 5);
            let b = runtime.share_constant(&field, 9);
            let sum = a + b.clone();
            assert_eq!(sum.promise().peek(), Some(Ok(14)));
            let scaled = b.mul_clear(field.element(4));
            assert_eq!(scaled.promise().peek(), Some(Ok(5)));
        })
        .await;
}

#[tokio::test]
async fn multiplication_fails_below_reshare_threshold() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, mut meshes) = setup(3, 1, 5);
            // Player 3 never starts; dropping its channels closes the
            // counterparts.
            meshes.pop();
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        3,
                        1,
                        Security::Passive,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(31);
                    let value = match id {
                        1 => Some(field.element(4)),
                        2 => Some(field.element(6)),
                        _ => None,
                    };
                    let shares = runtime.input(&[1, 2], &field, value);
                    // Degree reduction needs 2t + 1 = 3 resharings; only two
                    // players are alive.
                    runtime.mul(&shares[0], &shares[1]).await
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap(), Err(MpcError::Network { peer: 3 }));
            }
        })
        .await;
}

#[tokio::test]
async fn passive_multiplication_is_consistent_under_message_skew() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, mut meshes) = setup(4, 1, 13);
            // Skew the reshare arrivals: player 1 sees player 4 late, player
            // 4 sees player 3 late. Degree reduction must still recombine
            // the same dealer set everywhere, or the opened points land on
            // different polynomials.
            delay_incoming(&mut meshes[0], 4, Duration::from_millis(200));
            delay_incoming(&mut meshes[3], 3, Duration::from_millis(200));
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        4,
                        1,
                        Security::Passive,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(1000003);
                    let value = match id {
                        1 => Some(field.element(23)),
                        2 => Some(field.element(17)),
                        _ => None,
                    };
                    let shares = runtime.input(&[1, 2], &field, value);
                    let product = runtime.mul(&shares[0], &shares[1]);
                    runtime.open(&product).await
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap(), Ok(391));
            }
        })
        .await;
}

#[tokio::test]
async fn active_open_corrects_a_single_corrupted_share() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, mut meshes) = setup(5, 1, 14);
            // Player 5 is corrupted: no runtime, its channels hand a wrong
            // point to the opening.
            let mut malicious = meshes.pop().unwrap();
            // Honest points travel slowly, so the wrong point is always
            // among the n - t contributions the opening waits for.
            for mesh in meshes.iter_mut() {
                for peer in 1..=4 {
                    delay_incoming(mesh, peer, Duration::from_millis(100));
                }
            }

            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        5,
                        1,
                        Security::Active,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(1000003);
                    let value = (id == 1).then(|| field.element(19));
                    let shares = runtime.input(&[1], &field, value);
                    runtime.open(&shares[0]).await
                }));
            }

            use futures::SinkExt;
            // The opening is the second tagged operation after the input.
            let open_pc = ProgramCounter(vec![2]);
            for channel in malicious.iter_mut() {
                channel
                    .sink
                    .send(WireMessage {
                        pc: open_pc.clone(),
                        kind: MessageKind::Share(123456),
                    })
                    .await
                    .unwrap();
            }

            for handle in handles {
                assert_eq!(handle.await.unwrap(), Ok(19));
            }
            drop(malicious);
        })
        .await;
}

#[tokio::test]
async fn active_open_rejects_shares_beyond_the_correction_bound() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, mut meshes) = setup(5, 1, 15);
            // Players 4 and 5 are corrupted. Two wrong points inside the
            // n - t = 4 contributions exceed the single-error bound of the
            // decoder.
            let malicious_5 = meshes.pop().unwrap();
            let malicious_4 = meshes.pop().unwrap();
            for mesh in meshes.iter_mut() {
                for peer in 1..=3 {
                    delay_incoming(mesh, peer, Duration::from_millis(100));
                }
            }
            // A large modulus keeps the two wrong points from accidentally
            // landing on a line with an honest one.
            let modulus = shamir_mpc::find_prime(1 << 40, false);

            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        5,
                        1,
                        Security::Active,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(modulus);
                    let value = (id == 1).then(|| field.element(19));
                    let shares = runtime.input(&[1], &field, value);
                    runtime.open(&shares[0]).await
                }));
            }

            use futures::SinkExt;
            let open_pc = ProgramCounter(vec![2]);
            let mut corrupted = vec![(malicious_4, 0xdead_u64), (malicious_5, 0xbeef_u64)];
            for (channels, wrong) in corrupted.iter_mut() {
                for channel in channels.iter_mut() {
                    if channel.id <= 3 {
                        channel
                            .sink
                            .send(WireMessage {
                                pc: open_pc.clone(),
                                kind: MessageKind::Share(*wrong),
                            })
                            .await
                            .unwrap();
                    }
                }
            }

            for handle in handles {
                match handle.await.unwrap() {
                    Err(MpcError::ShareConsistency(_)) => {}
                    other => panic!("expected a consistency failure, got {:?}", other),
                }
            }
            drop(corrupted);
        })
        .await;
}

/// A structured broadcast payload, bincode-encoded like the wire messages.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct Announcement {
    round: u32,
    choice: u64,
}

#[tokio::test]
async fn broadcast_with_honest_sender() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(4, 1, 6);
            let announcement = Announcement {
                round: 3,
                choice: 42,
            };
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                let announcement = announcement.clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        4,
                        1,
                        Security::Active,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let payload =
                        (id == 2).then(|| bincode::serialize(&announcement).unwrap());
                    let delivered = runtime.broadcast(&[2], payload).remove(0).await.unwrap();
                    bincode::deserialize::<Announcement>(&delivered).unwrap()
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap(), announcement);
            }
        })
        .await;
}

#[tokio::test]
async fn broadcast_with_equivocating_sender() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, mut meshes) = setup(4, 1, 7);
            // Player 1 is corrupted: no runtime, we drive its channels by
            // hand. Its channels to peers 2, 3, 4, in that order.
            let malicious = meshes.remove(0);

            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 2;
                let keys = keys[index + 1].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        4,
                        1,
                        Security::Active,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    runtime.broadcast(&[1], None).remove(0).await
                }));
            }

            // The first broadcast operation on every player tags the same
            // counter.
            let pc = ProgramCounter(vec![1]);
            let payload_a = b"left half".to_vec();
            let payload_b = b"right half".to_vec();
            let digest_a: [u8; 32] = Sha3_256::digest(&payload_a).into();

            use futures::SinkExt;
            let mut sinks: Vec<_> = malicious.into_iter().map(|c| (c.id, c.sink)).collect();
            for (peer, sink) in sinks.iter_mut() {
                // Two-faced INIT: players 2, 3 see one payload, player 4
                // another.
                let init = if *peer == 4 {
                    payload_b.clone()
                } else {
                    payload_a.clone()
                };
                sink.send(WireMessage {
                    pc: pc.clone(),
                    kind: MessageKind::BroadcastInit(init),
                })
                .await
                .unwrap();
                // The corrupted player then backs the first payload.
                sink.send(WireMessage {
                    pc: pc.clone(),
                    kind: MessageKind::BroadcastEcho(digest_a),
                })
                .await
                .unwrap();
                sink.send(WireMessage {
                    pc: pc.clone(),
                    kind: MessageKind::BroadcastReady(digest_a, Some(payload_a.clone())),
                })
                .await
                .unwrap();
            }

            // All honest players deliver the same payload, including the
            // one that got the other INIT.
            for handle in handles {
                assert_eq!(handle.await.unwrap(), Ok(payload_a.clone()));
            }
            drop(sinks);
        })
        .await;
}

#[tokio::test]
async fn comparison_over_random_and_boundary_values() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(3, 1, 8);
            // 8-bit operands with 8 bits of statistical masking need a
            // prime above 2^18; Blum for the fast square root.
            let modulus = shamir_mpc::find_prime(1 << 19, true);
            let cases: Vec<(u64, u64, u64)> = vec![
                (5, 3, 1),
                (3, 5, 0),
                (7, 7, 0),
                (0, 255, 0),
                (255, 0, 1),
            ];

            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                let cases = cases.clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        3,
                        1,
                        Security::Passive,
                        RuntimeOptions {
                            bit_length: 8,
                            security_parameter: 8,
                        },
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(modulus);
                    let mut results = Vec::new();
                    for (a, b, _) in &cases {
                        let value = match id {
                            1 => Some(field.element(*a)),
                            2 => Some(field.element(*b)),
                            _ => None,
                        };
                        let shares = runtime.input(&[1, 2], &field, value);
                        let bit = runtime.greater_than(&shares[0], &shares[1]);
                        results.push(runtime.open(&bit).await);
                    }
                    results
                }));
            }
            for handle in handles {
                let results = handle.await.unwrap();
                for ((a, b, expected), result) in cases.iter().zip(results) {
                    assert_eq!(result, Ok(*expected), "comparing {} > {}", a, b);
                }
            }
        })
        .await;
}

#[tokio::test]
async fn open_to_reveals_only_to_the_named_receivers() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(3, 1, 12);
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        3,
                        1,
                        Security::Passive,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(31);
                    let value = (id == 1).then(|| field.element(19));
                    let shares = runtime.input(&[1], &field, value);
                    let opened = runtime.open_to(&[2], &shares[0]);
                    assert_eq!(opened.is_some(), id == 2);
                    // Non-receivers keep making progress past the opening.
                    runtime.synchronize().await.unwrap();
                    match opened {
                        Some(promise) => Some(promise.await),
                        None => None,
                    }
                }));
            }
            for handle in handles {
                let result = handle.await.unwrap();
                if let Some(value) = result {
                    assert_eq!(value, Ok(19));
                }
            }
        })
        .await;
}

#[tokio::test]
async fn prss_masked_input_opens_to_the_dealt_value() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(3, 1, 9);
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        3,
                        1,
                        Security::Passive,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(1031);
                    let value = (id == 2).then(|| field.element(9));
                    let shares = runtime.prss_input(&[2], &field, value);
                    runtime.open(&shares[0]).await
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap(), Ok(9));
            }
        })
        .await;
}

#[tokio::test]
async fn prss_random_bit_is_shared_consistently() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(3, 1, 10);
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        3,
                        1,
                        Security::Passive,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    let field = PrimeField::new(1031);
                    let mut bits = Vec::new();
                    for _ in 0..8 {
                        let bit = runtime.prss_random_bit(&field);
                        bits.push(runtime.open(&bit).await);
                    }
                    bits
                }));
            }
            let mut per_player = Vec::new();
            for handle in handles {
                per_player.push(handle.await.unwrap());
            }
            for bits in &per_player {
                for bit in bits {
                    let bit = bit.as_ref().unwrap();
                    assert!(*bit == 0 || *bit == 1);
                }
            }
            // Every player opened the same bits.
            assert_eq!(per_player[0], per_player[1]);
            assert_eq!(per_player[1], per_player[2]);
        })
        .await;
}

#[tokio::test]
async fn synchronize_is_a_barrier() {
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (keys, meshes) = setup(3, 1, 11);
            let mut handles = Vec::new();
            for (index, channels) in meshes.into_iter().enumerate() {
                let id = index + 1;
                let keys = keys[index].clone();
                handles.push(tokio::task::spawn_local(async move {
                    let runtime = start(
                        id,
                        3,
                        1,
                        Security::Passive,
                        RuntimeOptions::default(),
                        keys,
                        channels,
                    );
                    runtime.synchronize().await
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap(), Ok(()));
            }
        })
        .await;
}
