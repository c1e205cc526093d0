//! Per-file payload encoding.
//!
//! A payload is the file's bytes, raw-DEFLATE compressed and then
//! encrypted with the file's [`PayloadCipher`]. The client side undoes both
//! in a single streaming pass that also hashes and counts the plaintext:
//!
//! ```text
//! network chunk -> decrypt -> inflate -> (SHA-512 + count + progress) -> file
//! ```

use std::io::{self, Read, Write};

use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use crate::integrity::DigestWriter;
use crate::progress::ProgressReporter;
use crate::trust::{PayloadCipher, DIGEST_LEN};

/// Client-side sink for one encoded payload.
pub struct PayloadSink<'a, W: Write> {
    cipher: PayloadCipher,
    decoder: DeflateDecoder<DigestWriter<'a, W>>,
    scratch: Vec<u8>,
}

impl<'a, W: Write> PayloadSink<'a, W> {
    /// Decode into `writer`, reporting decompressed bytes into `progress`.
    pub fn new(cipher: PayloadCipher, writer: W, progress: &'a dyn ProgressReporter) -> Self {
        Self {
            cipher,
            decoder: DeflateDecoder::new(DigestWriter::with_progress(writer, progress)),
            scratch: Vec::new(),
        }
    }

    /// Stop producing plaintext once `limit` bytes have been written.
    ///
    /// A chunk whose output would cross the limit fails with
    /// [`io::ErrorKind::InvalidData`] and [`exceeded`](Self::exceeded)
    /// becomes true.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.decoder.get_mut().set_limit(limit);
        self
    }

    /// Whether the decoded output ran past the limit.
    pub fn exceeded(&self) -> bool {
        self.decoder.get_ref().exceeded()
    }

    /// Plaintext bytes the payload tried to produce, refused ones included.
    pub fn attempted(&self) -> u64 {
        self.decoder.get_ref().attempted()
    }

    /// Feed one chunk of encrypted payload.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.scratch.clear();
        self.scratch.extend_from_slice(chunk);
        self.cipher.apply(&mut self.scratch);
        self.decoder.write_all(&self.scratch)
    }

    /// Plaintext bytes written so far.
    pub fn written(&self) -> u64 {
        self.decoder.get_ref().written()
    }

    /// Flush the decompressor's remaining output without consuming the sink.
    pub fn try_finish(&mut self) -> io::Result<()> {
        self.decoder.try_finish()
    }

    /// Flush the decompressor and return the writer, the number of
    /// plaintext bytes written and their SHA-512.
    pub fn finish(self) -> io::Result<(W, u64, [u8; DIGEST_LEN])> {
        let digest_writer = self.decoder.finish()?;
        Ok(digest_writer.finish())
    }
}

/// Writer adapter that encrypts everything passing through it.
pub struct EncryptingWriter<W> {
    cipher: PayloadCipher,
    inner: W,
    scratch: Vec<u8>,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(cipher: PayloadCipher, inner: W) -> Self {
        Self {
            cipher,
            inner,
            scratch: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply(&mut self.scratch);
        // The keystream has advanced over all of `buf`, so it must all land.
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compress and encrypt `reader` into `writer`. Publisher side.
///
/// Returns the number of plaintext bytes consumed.
pub fn encode_payload<R: Read, W: Write>(
    cipher: PayloadCipher,
    mut reader: R,
    writer: W,
) -> io::Result<u64> {
    let encrypting = EncryptingWriter::new(cipher, writer);
    let mut encoder = DeflateEncoder::new(encrypting, Compression::default());
    let copied = io::copy(&mut reader, &mut encoder)?;
    let mut encrypting = encoder.finish()?;
    encrypting.flush()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{NoProgress, ProgressCounter};
    use sha2::{Digest, Sha512};

    fn cipher() -> PayloadCipher {
        PayloadCipher::new(&[4u8; 32], &[5u8; 12])
    }

    fn encode(plain: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        encode_payload(cipher(), plain, &mut encoded).unwrap();
        encoded
    }

    #[test]
    fn test_decode_in_small_chunks() {
        let plain: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 13) as u8).collect();
        let encoded = encode(&plain);

        let progress = ProgressCounter::new();
        let mut sink = PayloadSink::new(cipher(), Vec::new(), &progress);
        for chunk in encoded.chunks(333) {
            sink.write_chunk(chunk).unwrap();
        }
        let (out, written, digest) = sink.finish().unwrap();

        assert_eq!(out, plain);
        assert_eq!(written, plain.len() as u64);
        assert_eq!(digest, <[u8; DIGEST_LEN]>::from(Sha512::digest(&plain)));
        assert_eq!(progress.progress(), plain.len() as i64);
    }

    #[test]
    fn test_limit_stops_decompression_bomb() {
        let plain = vec![0u8; 1 << 20];
        let encoded = encode(&plain);
        assert!(encoded.len() < 8 * 1024);

        let mut sink = PayloadSink::new(cipher(), Vec::new(), &NoProgress).with_limit(1000);
        let err = sink.write_chunk(&encoded).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(sink.exceeded());
        assert!(sink.written() <= 1000);
        assert!(sink.attempted() > 1000);
    }

    #[test]
    fn test_limit_equal_to_length_decodes() {
        let plain: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = encode(&plain);

        let mut sink = PayloadSink::new(cipher(), Vec::new(), &NoProgress)
            .with_limit(plain.len() as u64);
        sink.write_chunk(&encoded).unwrap();
        assert!(!sink.exceeded());
        let (out, _, _) = sink.finish().unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn test_encoded_payload_is_not_plaintext() {
        let plain = b"a readable sentence repeated, a readable sentence repeated".to_vec();
        let encoded = encode(&plain);
        assert!(!encoded
            .windows(8)
            .any(|w| w == b"readable"));
    }

    #[test]
    fn test_empty_payload() {
        let encoded = encode(b"");
        let mut sink = PayloadSink::new(cipher(), Vec::new(), &NoProgress);
        sink.write_chunk(&encoded).unwrap();
        let (out, written, _) = sink.finish().unwrap();
        assert!(out.is_empty());
        assert_eq!(written, 0);
    }

    #[test]
    fn test_wrong_key_does_not_reproduce_plaintext() {
        let plain = vec![42u8; 4096];
        let encoded = encode(&plain);

        let wrong = PayloadCipher::new(&[9u8; 32], &[5u8; 12]);
        let mut sink = PayloadSink::new(wrong, Vec::new(), &NoProgress);
        let decoded = sink
            .write_chunk(&encoded)
            .and_then(|_| sink.finish())
            .map(|(out, _, _)| out);
        assert!(decoded.map_or(true, |out| out != plain));
    }
}
