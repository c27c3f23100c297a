//! Command-line front end: reads a dump manifest, builds the tree,
//! optionally populates a content store, and drives an encoder.
//!
//! Mirrors `original_source/tools/mkcomposefs.c`'s option surface for
//! the subset this crate implements. Building from a live directory
//! tree is out of scope (an external collaborator's job), so
//! `--from-file` is required here rather than optional.

use std::io::{IsTerminal, Read, Write};

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::info;

use composefs_image::dump;
use composefs_image::encoder::{EncodeOptions, Encoder, ImageFormat, NullEncoder};

/// Build a composefs image from a dump manifest.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// The source is a dump file, not a directory (the only mode this
    /// build supports).
    #[arg(long)]
    from_file: bool,

    /// Zero every mtime in the resulting image.
    #[arg(long)]
    use_epoch: bool,

    /// Don't store file xattrs.
    #[arg(long)]
    skip_xattrs: bool,

    /// Only store `user.*` xattrs.
    #[arg(long)]
    user_xattrs: bool,

    /// Don't store device nodes.
    #[arg(long)]
    skip_devices: bool,

    /// Copy regular file payloads into this content-store directory.
    #[arg(long, value_name = "PATH")]
    digest_store: Option<Utf8PathBuf>,

    /// Print the image's fsverity digest.
    #[arg(long)]
    print_digest: bool,

    /// Print the digest and don't write the image.
    #[arg(long)]
    print_digest_only: bool,

    /// Dump manifest to read, or `-` for stdin.
    source: Utf8PathBuf,

    /// Image output path, or `-` for stdout. Omit with
    /// `--print-digest-only`.
    out: Option<Utf8PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    if !args.from_file {
        bail!("building from a live directory tree isn't supported by this build; pass --from-file");
    }
    if args.print_digest_only && args.out.is_some() {
        bail!("can't specify an output path with --print-digest-only");
    }
    if !args.print_digest_only && args.out.is_none() {
        bail!("no destination path specified");
    }

    let mut input = open_reader(&args.source)?;
    let tree = dump::parse(&mut input)?;
    info!(record = %args.source, "parsed dump manifest");

    if args.digest_store.is_some() {
        // composefs_image::store::populate needs a live source directory
        // to copy payload bytes from; a dump manifest has none (its
        // payloads already point into an existing store), so there's
        // nothing to fill in here. Matches the original tool, which
        // only calls its store-filling step when building from a live
        // directory tree.
        info!("--digest-store has no effect when building from a dump manifest");
    }

    let opts = EncodeOptions {
        use_epoch: args.use_epoch,
        skip_xattrs: args.skip_xattrs,
        user_xattrs: args.user_xattrs,
        skip_devices: args.skip_devices,
        compute_digest: args.print_digest || args.print_digest_only,
        by_digest: true,
        format: ImageFormat::Erofs,
        version: None,
        max_version: None,
    };

    let digest = if args.print_digest_only {
        let mut sink = std::io::sink();
        NullEncoder.encode(&tree, &opts, &mut sink)?
    } else {
        let out = args.out.as_ref().expect("checked above");
        let mut writer = open_writer(out)?;
        NullEncoder.encode(&tree, &opts, &mut writer)?
    };

    if let Some(digest) = digest {
        println!("{}", composefs_image::escape::hex_encode_digest(&digest));
    }

    Ok(())
}

fn open_reader(path: &Utf8PathBuf) -> Result<Box<dyn Read>> {
    if path == "-" {
        Ok(Box::new(std::io::stdin()))
    } else {
        Ok(Box::new(
            std::fs::File::open(path).with_context(|| format!("opening {path}"))?,
        ))
    }
}

fn open_writer(path: &Utf8PathBuf) -> Result<Box<dyn Write>> {
    if path == "-" {
        if std::io::stdout().is_terminal() {
            bail!("stdout is a tty, refusing to use it");
        }
        Ok(Box::new(std::io::stdout()))
    } else {
        Ok(Box::new(
            std::fs::File::create(path).with_context(|| format!("creating {path}"))?,
        ))
    }
}
