//! TCP mesh establishment: listen for connections from lower-numbered
//! players, dial the higher-numbered ones, and identify peers with a short
//! magic + id handshake.

use std::{io, net::SocketAddr, time::Duration};

use futures::{future, stream::FuturesUnordered, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::PartyId;

use super::{wrap_bincode, PeerChannel};

/// Delay in milliseconds after which connection to a peer is retried.
const CONNECTION_RETRY_DELAY: u64 = 1000;

const HANDSHAKE_MAGIC: u32 = 0x5348_4D52;

/// Establish the full mesh for player `my_id`; `addresses[i]` is the listen
/// address of player `i + 1`. Returns one channel per peer, unordered.
pub async fn connect_mesh(
    addresses: &[SocketAddr],
    my_id: PartyId,
) -> io::Result<Vec<PeerChannel>> {
    assert!(my_id >= 1 && my_id <= addresses.len());

    let lower: Vec<PartyId> = (1..my_id).collect();
    let listen = listen_for_peers(addresses[my_id - 1], &lower);
    let dial = future::try_join_all(
        (my_id + 1..=addresses.len()).map(|peer| dial_peer(addresses[peer - 1], my_id, peer)),
    );
    let (accepted, dialed) = futures::try_join!(listen, dial)?;

    Ok(accepted
        .into_iter()
        .chain(dialed)
        .map(|(peer, socket)| PeerChannel::from_framed(peer, wrap_bincode(socket)))
        .collect())
}

/// Listen until every expected lower-numbered peer has identified itself.
async fn listen_for_peers(
    address: SocketAddr,
    expected: &[PartyId],
) -> io::Result<Vec<(PartyId, TcpStream)>> {
    if expected.is_empty() {
        return Ok(Vec::new());
    }

    let listener = TcpListener::bind(address).await?;
    let mut handshakes = FuturesUnordered::new();
    let mut connected: Vec<Option<TcpStream>> = expected.iter().map(|_| None).collect();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, _) = accepted?;
                handshakes.push(accept_peer(expected, socket));
            },
            done = handshakes.next(), if !handshakes.is_empty() => {
                if let Some(Ok((peer, socket))) = done {
                    let slot = expected.iter().position(|&id| id == peer);
                    if let Some(slot) = slot {
                        if connected[slot].is_none() {
                            connected[slot] = Some(socket);
                            if connected.iter().all(|entry| entry.is_some()) {
                                break;
                            }
                        }
                    }
                }
            },
        }
    }

    Ok(expected
        .iter()
        .zip(connected)
        .filter_map(|(&peer, socket)| socket.map(|socket| (peer, socket)))
        .collect())
}

/// Validate one incoming handshake.
async fn accept_peer(
    expected: &[PartyId],
    mut socket: TcpStream,
) -> io::Result<(PartyId, TcpStream)> {
    if socket.read_u32().await? != HANDSHAKE_MAGIC {
        return Err(io::Error::new(io::ErrorKind::Other, "invalid magic"));
    }

    let peer = socket.read_u32().await? as PartyId;
    if !expected.contains(&peer) {
        return Err(io::Error::new(io::ErrorKind::Other, "unexpected player id"));
    }

    socket.write_u32(HANDSHAKE_MAGIC).await?;
    socket.flush().await?;

    Ok((peer, socket))
}

/// Connect to a higher-numbered player, retrying until it is up.
async fn dial_peer(
    address: SocketAddr,
    my_id: PartyId,
    peer: PartyId,
) -> io::Result<(PartyId, TcpStream)> {
    let mut socket = loop {
        match TcpStream::connect(address).await {
            Ok(socket) => break socket,
            _ => tokio::time::sleep(Duration::from_millis(CONNECTION_RETRY_DELAY)).await,
        }
    };

    socket.write_u32(HANDSHAKE_MAGIC).await?;
    socket.write_u32(my_id as u32).await?;
    socket.flush().await?;

    if socket.read_u32().await? != HANDSHAKE_MAGIC {
        return Err(io::Error::new(io::ErrorKind::Other, "invalid magic"));
    }

    Ok((peer, socket))
}
