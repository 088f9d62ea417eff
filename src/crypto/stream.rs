//! Streaming AEAD
//!
//! Payloads that exceed in-memory limits are sealed chunk by chunk. Each
//! chunk's AAD binds its position and whether it is final, and a closing
//! tag authenticates the SHA-256 transcript of all chunk ciphertexts, so
//! reordered, duplicated, truncated, or extended chunk sequences fail.

use sha2::{Digest, Sha256};

use super::aead;
use crate::{Error, Result};

/// Chunk size used by callers that stream (256 KiB plaintext per chunk).
pub const CHUNK_LEN: usize = 256 * 1024;

const FINAL_MARKER: u8 = 1;

fn chunk_aad(index: u64, is_final: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_le_bytes());
    aad[8] = if is_final { FINAL_MARKER } else { 0 };
    aad
}

/// Incremental sealer. Feed chunks in order, then call [`StreamSealer::finish`].
pub struct StreamSealer {
    key: [u8; 32],
    index: u64,
    transcript: Sha256,
    finished: bool,
}

impl StreamSealer {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            index: 0,
            transcript: Sha256::new(),
            finished: false,
        }
    }

    /// Seal the next chunk. `is_final` must be set on exactly the last one.
    pub fn seal_chunk(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>> {
        if self.finished {
            return Err(Error::crypto("stream already finished"));
        }
        let sealed = aead::seal(&self.key, plaintext, &chunk_aad(self.index, is_final))?;
        self.transcript.update(&sealed);
        self.index += 1;
        if is_final {
            self.finished = true;
        }
        Ok(sealed)
    }

    /// Produce the closing tag over the whole chunk sequence.
    pub fn finish(self) -> Result<Vec<u8>> {
        if !self.finished {
            return Err(Error::crypto("stream finished without a final chunk"));
        }
        let digest = self.transcript.finalize();
        aead::seal(&self.key, &digest, b"stream-final")
    }
}

/// Mirror of [`StreamSealer`]: open chunks in order, then verify the tag.
pub struct StreamOpener {
    key: [u8; 32],
    index: u64,
    transcript: Sha256,
    finished: bool,
}

impl StreamOpener {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            index: 0,
            transcript: Sha256::new(),
            finished: false,
        }
    }

    pub fn open_chunk(&mut self, sealed: &[u8], is_final: bool) -> Result<Vec<u8>> {
        if self.finished {
            return Err(Error::integrity("chunk after final chunk"));
        }
        let plaintext = aead::open(&self.key, sealed, &chunk_aad(self.index, is_final))?;
        self.transcript.update(sealed);
        self.index += 1;
        if is_final {
            self.finished = true;
        }
        Ok(plaintext)
    }

    /// Verify the closing tag produced by [`StreamSealer::finish`].
    pub fn verify(self, tag: &[u8]) -> Result<()> {
        if !self.finished {
            return Err(Error::integrity("stream truncated before final chunk"));
        }
        let digest = self.transcript.finalize();
        let expected = aead::open(&self.key, tag, b"stream-final")?;
        if expected.as_slice() != digest.as_slice() {
            return Err(Error::integrity("stream transcript mismatch"));
        }
        Ok(())
    }
}

/// Seal a whole buffer as a chunked stream: `(chunks, closing tag)`.
pub fn seal_all(key: [u8; 32], payload: &[u8]) -> Result<(Vec<Vec<u8>>, Vec<u8>)> {
    let mut sealer = StreamSealer::new(key);
    let mut chunks = Vec::new();
    let mut pieces = payload.chunks(CHUNK_LEN).peekable();
    if payload.is_empty() {
        chunks.push(sealer.seal_chunk(&[], true)?);
    }
    while let Some(piece) = pieces.next() {
        let is_final = pieces.peek().is_none();
        chunks.push(sealer.seal_chunk(piece, is_final)?);
    }
    let tag = sealer.finish()?;
    Ok((chunks, tag))
}

/// Open a chunked stream produced by [`seal_all`].
pub fn open_all(key: [u8; 32], chunks: &[Vec<u8>], tag: &[u8]) -> Result<Vec<u8>> {
    if chunks.is_empty() {
        return Err(Error::integrity("empty stream"));
    }
    let mut opener = StreamOpener::new(key);
    let mut out = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let is_final = i == chunks.len() - 1;
        out.extend_from_slice(&opener.open_chunk(chunk, is_final)?);
    }
    opener.verify(tag)?;
    Ok(out)
}
