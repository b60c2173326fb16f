use sha2::{Digest, Sha256};

/// Deterministic byte stream keyed by private-key material.
///
/// Hashes the key material together with a caller-supplied seed to derive a
/// stream key, then produces output blocks as SHA-256(stream key || counter).
/// The same key material and seed always yield the same byte stream, so
/// anything derived from it (leaf private keys, serial numbers) is stable
/// across process restarts as long as the CA key is unchanged.
pub struct CounterEncryptorRand {
    stream_key: [u8; 32],
    counter: u64,
    block: [u8; 32],
    used: usize,
}

impl CounterEncryptorRand {
    pub fn new(key_material: &[u8], seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key_material);
        hasher.update(seed);
        Self {
            stream_key: hasher.finalize().into(),
            counter: 0,
            block: [0; 32],
            used: 32,
        }
    }

    pub fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut written = 0;
        while written < dest.len() {
            if self.used == self.block.len() {
                self.refill();
            }
            let n = (dest.len() - written).min(self.block.len() - self.used);
            dest[written..written + n].copy_from_slice(&self.block[self.used..self.used + n]);
            self.used += n;
            written += n;
        }
    }

    pub fn next_bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        self.fill_bytes(&mut out);
        out
    }

    fn refill(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.stream_key);
        hasher.update(self.counter.to_be_bytes());
        self.block = hasher.finalize().into();
        self.counter += 1;
        self.used = 0;
    }
}
