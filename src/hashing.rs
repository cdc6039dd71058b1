//! Tools for hashing file content into the [`Digest`]s that key the library.

use std::fmt;
use std::fs::File;
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use camino::Utf8Path;
use data_encoding::HEXLOWER;
use sha2::{Digest as _, Sha256, digest::Output};

use crate::counters;

type Sha256Digest = Output<Sha256>;

/// Byte mixed into the hash when blobs are stored compressed, so digests
/// computed for a compressed library can never collide with an uncompressed
/// one's.
const COMPRESSED_DOMAIN: &[u8] = b"z";

/// The SHA256 (lowercase hex, 64 characters) identifying a file's
/// *uncompressed* content.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Digest {
    digest: Sha256Digest,
}

impl Digest {
    /// Hash a byte slice directly. Mostly useful for tests and blueprints;
    /// file content goes through [`Hasher`].
    pub fn hash(compressed: bool, bytes: &[u8]) -> Self {
        let mut h = Hasher::new(compressed);
        h.update(bytes);
        h.finalize()
    }

    fn from_digest(digest: Sha256Digest) -> Self {
        Self { digest }
    }

    /// The first three byte pairs, used to fan blobs out across directories.
    pub fn shards(&self) -> (String, String, String) {
        let hex = self.to_string();
        (hex[0..2].into(), hex[2..4].into(), hex[4..6].into())
    }

    pub fn short_name(&self) -> String {
        let mut full = self.to_string();
        let _rest = full.split_off(8);
        full
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ digest: {} }}", HEXLOWER.encode(&self.digest))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.digest))
    }
}

impl std::str::FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .with_context(|| format!("Couldn't decode {s} as lowercase hex"))?;
        ensure!(
            bytes.len() == <Sha256 as sha2::Digest>::output_size(),
            "Expected 64 hex characters of SHA256"
        );
        Ok(Digest::from_digest(*Sha256Digest::from_slice(&bytes)))
    }
}

/// True for strings that could be a digest: exactly 64 chars of `[0-9a-f]`.
/// Archive extraction uses this before ever joining a digest into a path.
pub fn plausible_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A SHA256 in progress, seeded with the compression domain separator.
///
/// One per file; never reuse a hasher across files.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new(compressed: bool) -> Self {
        let mut inner = Sha256::new();
        if compressed {
            inner.update(COMPRESSED_DOMAIN);
        }
        Self { inner }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> Digest {
        Digest::from_digest(self.inner.finalize())
    }
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
}

impl<R: Read> HashingReader<R> {
    pub fn new(compressed: bool, inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(compressed),
        }
    }

    pub fn finalize(self) -> (Digest, R) {
        (self.hasher.finalize(), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(compressed: bool, inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(compressed),
        }
    }

    pub fn finalize(self) -> (Digest, W) {
        (self.hasher.finalize(), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Finds every non-overlapping occurrence of a locator byte string in a
/// stream, reporting start offsets in ascending order. Chunk boundaries are
/// handled by carrying a `len - 1` byte tail between feeds.
pub struct LocatorScanner<'a> {
    locator: &'a [u8],
    carry: Vec<u8>,
    /// Absolute stream offset of `carry[0]`.
    base: u64,
    offsets: Vec<u64>,
}

impl<'a> LocatorScanner<'a> {
    pub fn new(locator: &'a [u8]) -> Self {
        Self {
            locator,
            carry: Vec::new(),
            base: 0,
            offsets: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if self.locator.is_empty() {
            return;
        }
        self.carry.extend_from_slice(chunk);

        let n = self.locator.len();
        let mut search_from = 0usize;
        while search_from + n <= self.carry.len() {
            match self.carry[search_from..]
                .windows(n)
                .position(|w| w == self.locator)
            {
                Some(rel) => {
                    let at = search_from + rel;
                    self.offsets.push(self.base + at as u64);
                    search_from = at + n;
                }
                None => break,
            }
        }

        // Keep only the tail that could still start a match.
        let keep_from = self.carry.len().saturating_sub(n - 1).max(search_from);
        self.base += keep_from as u64;
        self.carry.drain(..keep_from);
    }

    pub fn finish(self) -> Vec<u64> {
        self.offsets
    }
}

const MMAP_THRESHOLD: u64 = 10 * 1024 * 1024;
const CHUNK: usize = 256 * 1024;

/// Streams a file through a fresh hasher while scanning for the locator,
/// returning `(digest, size, rewrite offsets)`.
///
/// Files over 10MB are memory mapped rather than read chunkwise.
pub fn digest_file(
    compressed: bool,
    path: &Utf8Path,
    locator: &[u8],
) -> Result<(Digest, u64, Vec<u64>)> {
    let mut fh = File::open(path).with_context(|| format!("Couldn't open {path}"))?;
    let file_length = fh.metadata()?.len();

    let mut hasher = Hasher::new(compressed);
    let mut scanner = LocatorScanner::new(locator);

    if file_length >= MMAP_THRESHOLD {
        let mapping = unsafe { memmap2::Mmap::map(&fh)? };
        counters::bump(counters::Op::FileToMmap);
        hasher.update(&mapping);
        scanner.feed(&mapping);
    } else {
        counters::bump(counters::Op::FileToBuffer);
        let mut buf = vec![0u8; CHUNK.min(file_length as usize).max(1)];
        loop {
            let count = fh.read(&mut buf)?;
            if count == 0 {
                break;
            }
            hasher.update(&buf[..count]);
            scanner.feed(&buf[..count]);
        }
    }

    Ok((hasher.finalize(), file_length, scanner.finish()))
}

#[cfg(test)]
mod test {
    use super::*;

    const DEVELOPERS: &[u8] = b"Developers, developers, developers, developers!".as_slice();

    // sha256 of the line above
    const EXPECTED: &[u8] =
        &hex_literal::hex!("2cca07b57ec9bb130e3f1f6f1d7e5c3eb468a0fe1c4c4a7a9f0a331f51258069");

    #[test]
    fn smoke() {
        let id = Digest::hash(false, DEVELOPERS);
        assert_eq!(id.digest.as_slice(), EXPECTED);
    }

    #[test]
    fn domain_separation() {
        assert_ne!(Digest::hash(false, b"abc"), Digest::hash(true, b"abc"));
    }

    #[test]
    fn round_trips_as_hex() -> Result<()> {
        let id = Digest::hash(false, DEVELOPERS);
        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        assert!(plausible_digest(&hex));
        let back: Digest = hex.parse()?;
        assert_eq!(id, back);
        Ok(())
    }

    #[test]
    fn implausible_digests() {
        assert!(!plausible_digest("deadbeef"));
        assert!(!plausible_digest(&"A".repeat(64)));
        assert!(!plausible_digest(&"../x".repeat(16)));
    }

    #[test]
    fn shards() {
        let id = Digest::hash(false, DEVELOPERS);
        let (aa, bb, cc) = id.shards();
        assert_eq!(format!("{aa}{bb}{cc}"), id.to_string()[..6]);
    }

    #[test]
    fn reader() -> Result<()> {
        let mut r = HashingReader::new(false, DEVELOPERS);
        io::copy(&mut r, &mut io::sink())?;
        assert_eq!(r.finalize().0.digest.as_slice(), EXPECTED);
        Ok(())
    }

    #[test]
    fn writer() -> Result<()> {
        let mut w = HashingWriter::new(false, io::sink());
        w.write_all(DEVELOPERS)?;
        assert_eq!(w.finalize().0.digest.as_slice(), EXPECTED);
        Ok(())
    }

    #[test]
    fn scanner_finds_offsets() {
        let mut s = LocatorScanner::new(b"/stage/root");
        s.feed(b"prefix /stage/root middle /stage/root end");
        assert_eq!(s.finish(), vec![7, 26]);
    }

    #[test]
    fn scanner_across_chunks() {
        let mut s = LocatorScanner::new(b"LOCATOR");
        s.feed(b"xxxxLOC");
        s.feed(b"ATORyyyyLOCA");
        s.feed(b"TOR");
        assert_eq!(s.finish(), vec![4, 15]);
    }

    #[test]
    fn scanner_non_overlapping() {
        // "aaa" in "aaaaa" matches at 0 only, then the window restarts at 3.
        let mut s = LocatorScanner::new(b"aaa");
        s.feed(b"aaaaa");
        assert_eq!(s.finish(), vec![0]);

        let mut s = LocatorScanner::new(b"aaa");
        s.feed(b"aaaaaa");
        assert_eq!(s.finish(), vec![0, 3]);
    }

    #[test]
    fn digest_file_reports_locators() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = crate::file_util::utf8(dir.path())?.join("f.txt");
        std::fs::write(&path, b"#!/stage/py\ncode /stage/py here")?;
        let (digest, size, offsets) = digest_file(false, &path, b"/stage/py")?;
        assert_eq!(size, 31);
        assert_eq!(offsets, vec![2, 17]);
        assert_eq!(digest, Digest::hash(false, b"#!/stage/py\ncode /stage/py here"));
        Ok(())
    }
}
