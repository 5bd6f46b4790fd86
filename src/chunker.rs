//! Client-side chunking: cuts a byte stream into blocks and signs them.

use std::io;
use std::pin::pin;

use fastcdc::v2020::AsyncStreamCDC;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::block::{Signature, StrongHash};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    Fixed(u32),
    Cdc(u32, u32, u32),
}

const KIB: u32 = 1024;
const MIN_CHUNK: u32 = 16 * KIB;
const AVG_CHUNK: u32 = 64 * KIB;
const MAX_CHUNK: u32 = 256 * KIB;

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Cdc(MIN_CHUNK, AVG_CHUNK, MAX_CHUNK)
    }
}

/// Signs a block: the fingerprint is the leading 8 bytes of a keyed hash, so
/// it is independent of the strong hash.
pub fn sign(data: &[u8]) -> Signature {
    const KEY: [u8; 32] = *b"champd block fingerprint key 001";
    let keyed = blake3::keyed_hash(&KEY, data);
    let mut fingerprint = [0; 8];
    fingerprint.copy_from_slice(&keyed.as_bytes()[..8]);
    Signature {
        fingerprint: u64::from_be_bytes(fingerprint),
        strong: StrongHash::of(data),
        length: data.len() as u32,
    }
}

pub fn chunk_stream(
    strategy: ChunkingStrategy,
    mut stream: impl AsyncRead + Unpin,
) -> impl Stream<Item = Result<(Signature, Vec<u8>)>> {
    async_stream::try_stream! {
        match strategy {
            ChunkingStrategy::Fixed(chunk_size) => {
                if chunk_size == 0 {
                    Err::<(), _>(Error::Config("fixed chunk size must not be zero".into()))?;
                }
                loop {
                    let mut data = Vec::with_capacity(chunk_size as usize);
                    let len = (&mut stream).take(chunk_size as u64).read_to_end(&mut data).await?;
                    if len == 0 {
                        break;
                    }
                    yield (sign(&data), data);
                    if len < chunk_size as usize {
                        break;
                    }
                }
            }
            ChunkingStrategy::Cdc(min_size, avg_size, max_size) => {
                let mut chunks = AsyncStreamCDC::new(stream, min_size, avg_size, max_size);
                let mut chunks = pin!(chunks.as_stream());

                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk.map_err(io::Error::from)?;
                    yield (sign(&chunk.data), chunk.data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(strategy: ChunkingStrategy, data: &[u8]) -> Vec<(Signature, Vec<u8>)> {
        let chunks = chunk_stream(strategy, data);
        let chunks = pin!(chunks);
        chunks.map(|chunk| chunk.unwrap()).collect().await
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn fixed_chunks_cover_the_input() {
        let data = noise(10_000);
        let chunks = collect(ChunkingStrategy::Fixed(4096), &data).await;
        let lengths: Vec<_> = chunks.iter().map(|(sig, _)| sig.length).collect();
        assert_eq!(lengths, [4096, 4096, 1808]);
        assert_eq!(chunks.concat_data(), data);

        assert!(collect(ChunkingStrategy::Fixed(4096), &[]).await.is_empty());
    }

    #[tokio::test]
    async fn cdc_chunks_are_stable_under_insertion() {
        let data = noise(2 * 1024 * 1024);
        let strategy = ChunkingStrategy::Cdc(4 * KIB, 16 * KIB, 64 * KIB);
        let original = collect(strategy, &data).await;
        assert_eq!(original.concat_data(), data);

        let mut edited = b"a few new bytes up front".to_vec();
        edited.extend_from_slice(&data);
        let shifted = collect(strategy, &edited).await;

        let shared = shifted
            .iter()
            .filter(|(sig, _)| original.iter().any(|(other, _)| other == sig))
            .count();
        assert!(shared * 10 >= original.len() * 9, "{shared} of {}", original.len());
    }

    #[test]
    fn signatures_are_deterministic() {
        assert_eq!(sign(b"block"), sign(b"block"));
        assert_ne!(sign(b"block").fingerprint, sign(b"other").fingerprint);
        assert!(sign(b"").is_empty_block());
    }

    trait ConcatData {
        fn concat_data(&self) -> Vec<u8>;
    }

    impl ConcatData for Vec<(Signature, Vec<u8>)> {
        fn concat_data(&self) -> Vec<u8> {
            self.iter().flat_map(|(_, data)| data.iter().copied()).collect()
        }
    }
}
