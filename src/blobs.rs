//! The content-addressed blob store backing `hololib/library/`.
//!
//! Blobs live at `library/<aa>/<bb>/<cc>/<digest>` where the shards are the
//! digest's first three byte pairs. Each blob is raw, gzip, or zstd framed;
//! readers always sniff the 4-byte magic instead of trusting anything else.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::counters;
use crate::error::HoloError;
use crate::file_util;
use crate::hashing::{Digest, HashingReader};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Codec {
    Raw,
    Gzip,
    Zstd,
}

/// Classify a blob by the first bytes of its stored form.
pub fn sniff(prefix: &[u8]) -> Codec {
    if prefix.len() >= 4 && prefix[..4] == ZSTD_MAGIC {
        Codec::Zstd
    } else if prefix.len() >= 2 && prefix[..2] == GZIP_MAGIC {
        Codec::Gzip
    } else {
        Codec::Raw
    }
}

/// A streaming reader over a blob's *uncompressed* content.
/// Dropping it closes the underlying file or buffer.
pub enum Blob<R: Read> {
    Raw(R),
    Gzip(flate2::read::GzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> std::fmt::Debug for Blob<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Blob::Raw(_) => f.write_str("Blob::Raw(..)"),
            Blob::Gzip(_) => f.write_str("Blob::Gzip(..)"),
            Blob::Zstd(_) => f.write_str("Blob::Zstd(..)"),
        }
    }
}

impl<R: Read> Blob<R> {
    pub fn decode(codec: Codec, reader: R) -> Result<Self> {
        Ok(match codec {
            Codec::Raw => Blob::Raw(reader),
            Codec::Gzip => Blob::Gzip(flate2::read::GzDecoder::new(reader)),
            Codec::Zstd => Blob::Zstd(
                zstd::stream::read::Decoder::new(reader)
                    .context("Decompression of blob stream failed")?,
            ),
        })
    }
}

impl<R: Read> Read for Blob<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Blob::Raw(r) => r.read(buf),
            Blob::Gzip(r) => r.read(buf),
            Blob::Zstd(r) => r.read(buf),
        }
    }
}

/// Read access to the blob store. The planner, prefetcher, and exporter
/// need nothing more.
pub trait BlobStore: Send + Sync {
    /// The shard directory a digest fans out into.
    fn location(&self, digest: &Digest) -> Utf8PathBuf;

    /// The blob's full canonical path.
    fn exact_location(&self, digest: &Digest) -> Utf8PathBuf;

    fn has_blob(&self, digest: &Digest) -> bool;

    /// Open a blob for streaming, decoded per its sniffed magic.
    fn open(&self, digest: &Digest) -> Result<Blob<File>>;

    /// Open a blob's stored form (no decoding). Exporters ship these bytes.
    fn open_stored(&self, digest: &Digest) -> Result<File>;

    /// Whether digests in this store carry the compression domain separator.
    fn compressed(&self) -> bool;
}

/// Write access, held by lift, import, and removal.
pub trait BlobStoreMut: BlobStore {
    /// Compress `src` into the store under `digest`. Returns false if the
    /// blob was already present (content reuse, the whole point).
    fn lift_file(&self, src: &Utf8Path, digest: &Digest) -> Result<bool>;

    /// Place already-stored-form bytes (e.g. out of an archive) at their
    /// canonical location. Skips existing blobs.
    fn adopt_stored(&self, digest: &Digest, stored: &mut dyn Read) -> Result<bool>;

    fn remove(&self, digest: &Digest) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BlobLibrary {
    /// `<ProductHome>/hololib/library`
    root: Utf8PathBuf,
    compress: bool,
}

impl BlobLibrary {
    pub fn new(root: Utf8PathBuf, compress: bool) -> Self {
        Self { root, compress }
    }

    /// Codec for newly-written blobs. Reads don't care (they sniff), so
    /// mixed stores stay readable; zstd wins everywhere we have a fast
    /// encoder, gzip is the Windows consolation prize.
    fn write_codec(&self) -> Codec {
        if !self.compress {
            Codec::Raw
        } else if cfg!(windows) {
            Codec::Gzip
        } else {
            Codec::Zstd
        }
    }

}

/// Streams a blob through a hasher and compares to its digest. Must pass
/// before anything is allowed to hardlink against the store.
pub fn verify_blob(store: &dyn BlobStore, digest: &Digest) -> Result<()> {
    let blob = store.open(digest)?;
    let mut hashing = HashingReader::new(store.compressed(), blob);
    io::copy(&mut hashing, &mut io::sink())?;
    let (actual, _) = hashing.finalize();
    ensure_digest(digest, &actual, store.exact_location(digest).as_str())
}

pub fn ensure_digest(expected: &Digest, actual: &Digest, path: &str) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(HoloError::Corruption {
            path: path.to_owned(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
        .into())
    }
}

impl BlobStore for BlobLibrary {
    fn location(&self, digest: &Digest) -> Utf8PathBuf {
        let (aa, bb, cc) = digest.shards();
        self.root.join(aa).join(bb).join(cc)
    }

    fn exact_location(&self, digest: &Digest) -> Utf8PathBuf {
        self.location(digest).join(digest.to_string())
    }

    fn has_blob(&self, digest: &Digest) -> bool {
        self.exact_location(digest).is_file()
    }

    fn open(&self, digest: &Digest) -> Result<Blob<File>> {
        let path = self.exact_location(digest);
        let mut fh = match File::open(&path) {
            Ok(fh) => fh,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(anyhow::Error::new(HoloError::Corruption {
                    path: path.to_string(),
                    expected: digest.to_string(),
                    actual: "<no blob on disk>".to_owned(),
                })
                .context(format!("Couldn't open {path}")));
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("Couldn't open {path}"))),
        };

        let mut magic = [0u8; 4];
        let got = read_up_to(&mut fh, &mut magic)?;
        fh.seek(SeekFrom::Start(0))?;
        Blob::decode(sniff(&magic[..got]), fh)
    }

    fn open_stored(&self, digest: &Digest) -> Result<File> {
        let path = self.exact_location(digest);
        File::open(&path).with_context(|| format!("Couldn't open {path}"))
    }

    fn compressed(&self) -> bool {
        self.compress
    }
}

impl BlobStoreMut for BlobLibrary {
    fn lift_file(&self, src: &Utf8Path, digest: &Digest) -> Result<bool> {
        let target = self.exact_location(digest);
        if target.is_file() {
            counters::bump(counters::Op::BlobDuplicate);
            return Ok(false);
        }

        let source = File::open(src).with_context(|| format!("Couldn't open {src}"))?;
        let mut hashing = HashingReader::new(self.compress, source);

        fs::create_dir_all(self.location(digest))
            .with_context(|| format!("Couldn't create {}", self.location(digest)))?;
        let part = file_util::part_name(&target);

        let result = self.write_part(&part, &mut hashing);
        let actual = match result {
            Ok(()) => hashing.finalize().0,
            Err(e) => {
                let _ = fs::remove_file(&part);
                return Err(e);
            }
        };
        // The source may have changed since the caller digested it.
        if let Err(e) = ensure_digest(digest, &actual, src.as_str()) {
            let _ = fs::remove_file(&part);
            return Err(e);
        }

        if let Err(e) = file_util::commit(&part, &target) {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
        counters::bump(counters::Op::BlobLifted);
        trace!("Lifted {src} into {target}");
        Ok(true)
    }

    fn adopt_stored(&self, digest: &Digest, stored: &mut dyn Read) -> Result<bool> {
        let target = self.exact_location(digest);
        if target.is_file() {
            counters::bump(counters::Op::BlobDuplicate);
            return Ok(false);
        }
        fs::create_dir_all(self.location(digest))
            .with_context(|| format!("Couldn't create {}", self.location(digest)))?;
        let part = file_util::part_name(&target);

        let mut write = || -> Result<()> {
            let mut fh = File::create(&part).with_context(|| format!("Couldn't create {part}"))?;
            io::copy(stored, &mut fh).with_context(|| format!("Couldn't write {part}"))?;
            fh.sync_all().with_context(|| format!("Couldn't sync {part}"))?;
            Ok(())
        };
        if let Err(e) = write().and_then(|()| file_util::commit(&part, &target)) {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
        counters::bump(counters::Op::BlobLifted);
        Ok(true)
    }

    fn remove(&self, digest: &Digest) -> Result<()> {
        file_util::try_remove(&self.exact_location(digest))
    }
}

impl BlobLibrary {
    fn write_part(&self, part: &Utf8Path, content: &mut dyn Read) -> Result<()> {
        let fh = File::options()
            .write(true)
            .create_new(true)
            .open(part)
            .with_context(|| format!("Couldn't create {part}"))?;

        let fh = match self.write_codec() {
            Codec::Raw => {
                let mut fh = fh;
                io::copy(content, &mut fh).with_context(|| format!("Couldn't write {part}"))?;
                fh
            }
            Codec::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(fh, flate2::Compression::default());
                io::copy(content, &mut enc).with_context(|| format!("Couldn't write {part}"))?;
                enc.finish()?
            }
            Codec::Zstd => {
                let mut enc = zstd::stream::write::Encoder::new(fh, 0)?;
                enc.multithread(num_cpus::get_physical() as u32)?;
                io::copy(content, &mut enc).with_context(|| format!("Couldn't write {part}"))?;
                enc.finish()?
            }
        };
        fh.sync_all().with_context(|| format!("Couldn't sync {part}"))?;
        Ok(())
    }
}

fn read_up_to(r: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
