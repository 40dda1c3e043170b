//! Static player configuration: one JSON file per player carrying the
//! protocol parameters, the peer addresses, and this player's PRSS key
//! material. TLS material is referenced by path and loaded eagerly.

use std::{
    fs::File,
    io::{self, BufReader},
    net::SocketAddr,
    path::Path,
};

use rustls_pemfile::Item;
use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::{Certificate, PrivateKey};

use crate::prss::PrssKeys;
use crate::PartyId;

/// Parsed per-player configuration.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    pub id: PartyId,
    pub num_players: usize,
    pub threshold: usize,
    pub modulus: u64,
    pub parties: Vec<PartyConfig>,
    pub prss: PrssKeys,
}

/// Details about one party of the protocol.
#[derive(Clone, Debug)]
pub struct PartyConfig {
    pub address: SocketAddr,
    pub certificate: Option<Certificate>,
}

/// Raw parsed JSON configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawPlayerConfig {
    id: PartyId,
    num_players: usize,
    threshold: usize,
    modulus: u64,
    parties: Vec<RawPartyConfig>,
    prss: PrssKeys,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawPartyConfig {
    address: SocketAddr,
    certificate: Option<String>,
}

impl PlayerConfig {
    /// Load configuration from a JSON file; certificate paths are resolved
    /// relative to it.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let parent_dir = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid path"))?;

        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let raw: RawPlayerConfig = serde_json::from_reader(reader)?;

        if raw.id < 1 || raw.id > raw.num_players || raw.parties.len() != raw.num_players {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "inconsistent player configuration",
            ));
        }

        Ok(PlayerConfig {
            id: raw.id,
            num_players: raw.num_players,
            threshold: raw.threshold,
            modulus: raw.modulus,
            parties: raw
                .parties
                .into_iter()
                .map(|party| parse_raw_party_config(parent_dir, party))
                .collect::<Result<_, _>>()?,
            prss: raw.prss,
        })
    }

    /// The listen addresses in player order, as `networking::connect_mesh`
    /// expects them.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.parties.iter().map(|party| party.address).collect()
    }
}

fn parse_raw_party_config(parent_dir: &Path, raw: RawPartyConfig) -> io::Result<PartyConfig> {
    Ok(PartyConfig {
        address: raw.address,
        certificate: raw
            .certificate
            .map(|path| load_certificate(parent_dir.join(path)))
            .transpose()?,
    })
}

/// Load an X.509 certificate from file.
pub fn load_certificate(path: impl AsRef<Path>) -> io::Result<Certificate> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    if let Some(Item::X509Certificate(cert)) = rustls_pemfile::read_one(&mut reader)? {
        Ok(Certificate(cert))
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "invalid certificate"))
    }
}

/// Load a PKCS#8 private key from file.
pub fn load_private_key(path: impl AsRef<Path>) -> io::Result<PrivateKey> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    if let Some(Item::PKCS8Key(key)) = rustls_pemfile::read_one(&mut reader)? {
        Ok(PrivateKey(key))
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "invalid private key"))
    }
}
