//! Packet obfuscation.
//!
//! Every UDP packet of the QUIC endpoint can be passed through an
//! [`Obfuscator`] so the wire no longer looks like QUIC to a passive
//! classifier. This is not encryption; the QUIC layer already provides that.

use sha2::{Digest, Sha256};

/// Length of the precomputed keystream pad. Longer packets cycle through it.
const PAD_LEN: usize = 4096;

/// Reversible, length-preserving byte transform applied per packet.
pub trait Obfuscator: Send + Sync + std::fmt::Debug {
    /// Transforms an outgoing packet in place.
    fn obfuscate(&self, data: &mut [u8]);

    /// Reverses [`Obfuscator::obfuscate`] in place.
    fn deobfuscate(&self, data: &mut [u8]);

    fn obfuscate_bytes(&self, input: &[u8]) -> Vec<u8> {
        let mut out = input.to_vec();
        self.obfuscate(&mut out);
        out
    }

    fn deobfuscate_bytes(&self, input: &[u8]) -> Vec<u8> {
        let mut out = input.to_vec();
        self.deobfuscate(&mut out);
        out
    }
}

/// Keyed XOR obfuscator.
///
/// The pad is `SHA-256(key || block_index)` for consecutive block indices,
/// so both peers derive the same pad from the shared secret. XOR with a
/// fixed pad is its own inverse.
#[derive(Clone)]
pub struct XorObfuscator {
    pad: Box<[u8; PAD_LEN]>,
}

impl XorObfuscator {
    pub fn new(key: &[u8]) -> Self {
        let mut pad = Box::new([0u8; PAD_LEN]);
        for (index, block) in pad.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update((index as u64).to_be_bytes());
            let digest = hasher.finalize();
            block.copy_from_slice(&digest[..block.len()]);
        }
        Self { pad }
    }

    fn apply(&self, data: &mut [u8]) {
        for chunk in data.chunks_mut(PAD_LEN) {
            for (byte, key) in chunk.iter_mut().zip(self.pad.iter()) {
                *byte ^= key;
            }
        }
    }
}

impl std::fmt::Debug for XorObfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XorObfuscator").field("pad", &"<redacted>").finish()
    }
}

impl Obfuscator for XorObfuscator {
    fn obfuscate(&self, data: &mut [u8]) {
        self.apply(data);
    }

    fn deobfuscate(&self, data: &mut [u8]) {
        self.apply(data);
    }
}
