//! Process-wide configuration, packaged into a [`HolotreeContext`] that is
//! threaded through every public entry point instead of living in globals.

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeZone, Utc};

/// The fixed epoch every restored file's mtime is pinned to
/// (2020-01-01T00:00:00Z). A clean tree has uniform mtimes; any drift means
/// the tenant touched it.
pub const MOTHER_TIME_SECS: i64 = 1_577_836_800;

pub fn mother_time() -> DateTime<Utc> {
    Utc.timestamp_opt(MOTHER_TIME_SECS, 0).unwrap()
}

/// `os_arch`, recorded into catalogs and checked (warn-only) at restore.
pub fn current_platform() -> String {
    format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Everything that used to be process-global state: the product home the
/// on-disk layout hangs under, the compression flag (fixed at init; digests
/// computed under different values are incompatible), and the shared-mode
/// hint.
#[derive(Debug, Clone)]
pub struct HolotreeContext {
    product_home: Utf8PathBuf,
    compress: bool,
    shared: bool,
}

impl HolotreeContext {
    pub fn new(product_home: impl Into<Utf8PathBuf>) -> Self {
        Self {
            product_home: product_home.into(),
            compress: true,
            shared: false,
        }
    }

    /// Resolve the product home from `$HOLOTREE_HOME`, falling back to
    /// `~/.holotree`.
    pub fn detect() -> Result<Self> {
        let product_home = match std::env::var("HOLOTREE_HOME") {
            Ok(p) => Utf8PathBuf::from(p),
            Err(_) => {
                let home = home::home_dir().context("Couldn't locate a home directory")?;
                crate::file_util::utf8(&home)?.join(".holotree")
            }
        };
        Ok(Self::new(product_home))
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// World-readable spaces and shared-mode locking.
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn shared(&self) -> bool {
        self.shared
    }

    pub fn product_home(&self) -> &Utf8Path {
        &self.product_home
    }

    pub fn hololib(&self) -> Utf8PathBuf {
        self.product_home.join("hololib")
    }

    pub fn catalog_dir(&self) -> Utf8PathBuf {
        self.hololib().join("catalog")
    }

    pub fn library_dir(&self) -> Utf8PathBuf {
        self.hololib().join("library")
    }

    pub fn archive_dir(&self) -> Utf8PathBuf {
        self.hololib().join("archives")
    }

    pub fn lock_file(&self) -> Utf8PathBuf {
        self.hololib().join("lock")
    }

    /// Where the external builder materializes an environment before lift.
    pub fn stage(&self) -> Utf8PathBuf {
        self.hololib().join("stage")
    }

    pub fn holotree_dir(&self) -> Utf8PathBuf {
        self.product_home.join("holotree")
    }

    pub fn space_path(&self, controller: &str, space: &str) -> Utf8PathBuf {
        self.holotree_dir().join(controller).join(space)
    }

    /// The absolute-path prefix this install writes at rewrite offsets.
    /// Its length must equal the catalog's lift-time prefix length, which
    /// `validate_blueprint` enforces before any writes happen.
    pub fn rewrite_bytes(&self) -> Vec<u8> {
        self.stage().into_string().into_bytes()
    }

    pub fn dir_mode(&self) -> u32 {
        if self.shared { 0o755 } else { 0o750 }
    }

    /// Recorded modes get widened for shared holotrees so other accounts can
    /// read the restored files.
    pub fn file_mode(&self, recorded: u32) -> u32 {
        let mode = recorded & 0o7777;
        if self.shared { mode | 0o044 } else { mode }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_hangs_off_product_home() {
        let ctx = HolotreeContext::new("/opt/robo");
        assert_eq!(ctx.catalog_dir(), "/opt/robo/hololib/catalog");
        assert_eq!(ctx.library_dir(), "/opt/robo/hololib/library");
        assert_eq!(ctx.space_path("ctrl", "sp"), "/opt/robo/holotree/ctrl/sp");
        assert_eq!(ctx.rewrite_bytes(), b"/opt/robo/hololib/stage");
    }

    #[test]
    fn shared_mode_widens() {
        let ctx = HolotreeContext::new("/opt/robo").with_shared(true);
        assert_eq!(ctx.dir_mode(), 0o755);
        assert_eq!(ctx.file_mode(0o600), 0o644);
        let solo = HolotreeContext::new("/opt/robo");
        assert_eq!(solo.file_mode(0o600), 0o600);
    }
}
