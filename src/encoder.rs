//! The boundary between the tree model and the real EROFS binary
//! encoder, which lives outside this crate.
//!
//! `Encoder` and `WriteSink` are the seam: this crate hands a frozen
//! [`Tree`] and an [`EncodeOptions`] bag to whatever implements
//! `Encoder`, and writes the resulting bytes through whatever
//! implements `WriteSink`. A stub is provided so the option handling and
//! glue can be exercised without a real encoder.

use crate::error::Result;
use crate::tree::Tree;

/// Image formats this crate's option surface knows the name of. Only
/// `Erofs` is ever produced; an encoder for it is out of scope here.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ImageFormat {
    Erofs,
}

/// Everything `original_source/tools/mkcomposefs.c`'s CLI flags control,
/// minus the ones only meaningful for live-directory building.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub use_epoch: bool,
    pub skip_xattrs: bool,
    pub user_xattrs: bool,
    pub skip_devices: bool,
    pub compute_digest: bool,
    pub by_digest: bool,
    pub format: ImageFormat,
    pub version: Option<u32>,
    pub max_version: Option<u32>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            use_epoch: false,
            skip_xattrs: false,
            user_xattrs: false,
            skip_devices: false,
            compute_digest: false,
            by_digest: false,
            format: ImageFormat::Erofs,
            version: None,
            max_version: None,
        }
    }
}

/// Where encoded bytes go. A thin seam so the encoder doesn't need to
/// know whether it's writing to a file, a pipe, or a `Vec<u8>` in a test.
pub trait WriteSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
}

impl<W: std::io::Write> WriteSink for W {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::Write::write(self, buf)
    }
}

/// Turns a frozen tree into an image byte stream, optionally returning
/// its fsverity digest.
pub trait Encoder {
    fn encode(
        &self,
        tree: &Tree,
        opts: &EncodeOptions,
        sink: &mut dyn WriteSink,
    ) -> Result<Option<[u8; 32]>>;
}

/// An encoder that does nothing but prove the glue layer (option
/// threading, sink dispatch) works. Never produces a real image.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEncoder;

impl Encoder for NullEncoder {
    fn encode(
        &self,
        _tree: &Tree,
        opts: &EncodeOptions,
        sink: &mut dyn WriteSink,
    ) -> Result<Option<[u8; 32]>> {
        sink.write(b"")?;
        Ok(if opts.compute_digest {
            Some([0u8; 32])
        } else {
            None
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::Tree;

    #[test]
    fn null_encoder_respects_compute_digest() {
        let tree = Tree::new_root();
        let mut out: Vec<u8> = Vec::new();

        let opts = EncodeOptions {
            compute_digest: false,
            ..EncodeOptions::default()
        };
        assert_eq!(NullEncoder.encode(&tree, &opts, &mut out).unwrap(), None);

        let opts = EncodeOptions {
            compute_digest: true,
            ..EncodeOptions::default()
        };
        assert_eq!(
            NullEncoder.encode(&tree, &opts, &mut out).unwrap(),
            Some([0u8; 32])
        );
    }
}
