//! Hash functions placing entities, partitions and virtual nodes on the ring.
//!
//! Every instance of a fleet must be configured with the same function: two
//! instances hashing differently build incompatible rings and silently split
//! partition ownership. Nothing at runtime can detect such a mismatch.


use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::EntityId;
use crate::ServiceAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunction {
    /// First 8 bytes of the SHA-256 digest, big-endian
    #[default]
    Sha256,
    /// Kafka-compatible murmur2, widened to 64 bits
    Murmur2,
    /// 64-bit FNV-1a
    Fnv1a,
}

impl HashFunction {
    pub fn hash_bytes(
        &self,
        data: &[u8],
    ) -> u64 {
        match self {
            HashFunction::Sha256 => sha256_prefix(data),
            HashFunction::Murmur2 => u64::from(murmur2(data)),
            HashFunction::Fnv1a => fnv1a(data),
        }
    }

    pub fn hash_entity(
        &self,
        entity_id: &EntityId,
    ) -> u64 {
        self.hash_bytes(entity_id.as_bytes())
    }

    /// Ring position of a partition index
    pub fn hash_partition(
        &self,
        partition: u32,
    ) -> u64 {
        self.hash_bytes(&partition.to_be_bytes())
    }

    /// Ring position of the `index`-th virtual node of `address`
    pub fn hash_virtual_node(
        &self,
        address: &ServiceAddress,
        index: u32,
    ) -> u64 {
        let mut buf = address.to_string().into_bytes();
        buf.extend_from_slice(&index.to_be_bytes());
        self.hash_bytes(&buf)
    }
}

fn sha256_prefix(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Produces the same 32-bit value as the Kafka Java client's `Utils.murmur2()`.
pub(crate) fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747b28c;
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h
}

#[inline]
pub(crate) fn fnv1a(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
