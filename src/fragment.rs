//! The anti-censorship transform: re-frame a ClientHello into multiple TLS
//! records so that no single record — and in particular no single TCP
//! write — carries the whole SNI, then split the resulting byte stream
//! across several writes.

use crate::codec::{be16_encode, random_slice};
use std::ops::Range;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// An immutable plan for the first upstream write: the original handshake
/// bytes, the SNI's byte range within them, and the 3-byte record prefix
/// (record type + legacy version) to stamp on every emitted record.
pub struct TlsFragmentJob<'a> {
    handshake: &'a [u8],
    sni_range: Range<usize>,
    record_prefix: [u8; 3],
}

/// Delay between successive upstream writes, chosen to encourage the
/// kernel to place each chunk in its own TCP segment rather than coalescing
/// them back together.
const INTER_WRITE_DELAY: Duration = Duration::from_millis(10);

impl<'a> TlsFragmentJob<'a> {
    pub fn new(handshake: &'a [u8], sni_range: Range<usize>, record_prefix: [u8; 3]) -> Self {
        assert!(sni_range.end <= handshake.len());
        Self {
            handshake,
            sni_range,
            record_prefix,
        }
    }

    /// Re-frame `handshake` into multiple TLS records, each tagged with
    /// `record_prefix`, then split the concatenation of those records into
    /// per-write chunks.
    pub fn build(&self) -> Vec<Vec<u8>> {
        let reframed = self.reframe();
        random_slice(0..reframed.len(), 4)
            .into_iter()
            .map(|r| reframed[r].to_vec())
            .collect()
    }

    fn reframe(&self) -> Vec<u8> {
        let h = self.handshake;
        let l = self.sni_range.start;
        let r = self.sni_range.end;

        let mut out = Vec::with_capacity(h.len() + 64);
        for span in random_slice(0..l, 8) {
            self.emit_record(&mut out, &h[span]);
        }
        for span in random_slice(l..r, 4) {
            self.emit_record(&mut out, &h[span]);
        }
        for span in random_slice(r..h.len(), 8) {
            self.emit_record(&mut out, &h[span]);
        }
        out
    }

    fn emit_record(&self, out: &mut Vec<u8>, fragment: &[u8]) {
        out.extend_from_slice(&self.record_prefix);
        out.extend_from_slice(&be16_encode(fragment.len() as u16));
        out.extend_from_slice(fragment);
    }
}

/// Write every chunk of a fragmented ClientHello to `writer` sequentially,
/// sleeping briefly between writes so the kernel doesn't coalesce them back
/// into one segment. Runs to completion before the caller starts the
/// bidirectional splice, so the client's first post-handshake bytes never
/// race the fragmented ClientHello upstream.
pub async fn send_fragmented<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    chunks: &[Vec<u8>],
) -> std::io::Result<()> {
    for (i, chunk) in chunks.iter().enumerate() {
        writer.write_all(chunk).await?;
        if i + 1 < chunks.len() {
            tokio::time::sleep(INTER_WRITE_DELAY).await;
        }
    }
    writer.flush().await
}
