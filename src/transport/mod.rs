//! Message channels between players: length-framed bincode over any
//! `AsyncRead + AsyncWrite` transport, with in-process duplex meshes for
//! tests and TCP establishment in `networking`.

pub mod config;
pub mod networking;

use std::io;
use std::pin::Pin;

use futures::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_serde::formats::Bincode;
use tokio_util::codec::LengthDelimitedCodec;

use crate::runtime::WireMessage;
use crate::PartyId;

/// Length-framed Bincode-encoded message channel.
pub type BincodeStreamSink<T, C> =
    tokio_serde::Framed<tokio_util::codec::Framed<C, LengthDelimitedCodec>, T, T, Bincode<T, T>>;

/// Length-framed Bincode-encoded tokio duplex stream.
pub type BincodeDuplex<T> = BincodeStreamSink<T, DuplexStream>;

pub type MessageSink = Pin<Box<dyn Sink<WireMessage, Error = io::Error>>>;
pub type MessageStream = Pin<Box<dyn Stream<Item = io::Result<WireMessage>>>>;

/// One peer's connection, split into independently pollable halves.
pub struct PeerChannel {
    pub id: PartyId,
    pub sink: MessageSink,
    pub stream: MessageStream,
}

impl PeerChannel {
    pub fn from_framed<C>(id: PartyId, channel: BincodeStreamSink<WireMessage, C>) -> Self
    where
        C: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        let (sink, stream) = channel.split();
        PeerChannel {
            id,
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Create a length-framed Bincode-encoded message channel from AsyncRead/Write.
pub fn wrap_bincode<T, C>(channel: C) -> BincodeStreamSink<T, C>
where
    C: AsyncRead + AsyncWrite,
{
    let length_delimited = tokio_util::codec::Framed::new(channel, LengthDelimitedCodec::new());
    tokio_serde::Framed::new(length_delimited, Bincode::default())
}

/// Create a bidirectional Bincode-encoded channel.
pub fn bincode_duplex<T>(max_buf_size: usize) -> (BincodeDuplex<T>, BincodeDuplex<T>) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (wrap_bincode(a), wrap_bincode(b))
}

/// In-process channel mesh for testing multiparty protocols: element `i`
/// holds player `i + 1`'s channels to every other player.
pub fn local_mesh(num_players: usize, max_buf_size: usize) -> Vec<Vec<PeerChannel>> {
    let mut meshes: Vec<Vec<PeerChannel>> = (0..num_players).map(|_| Vec::new()).collect();
    for i in 0..num_players {
        for j in 0..i {
            let (a, b) = bincode_duplex::<WireMessage>(max_buf_size);
            meshes[i].push(PeerChannel::from_framed(j + 1, a));
            meshes[j].push(PeerChannel::from_framed(i + 1, b));
        }
    }
    meshes
}
