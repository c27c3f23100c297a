//! User configuration, loaded from `~/.config/mkcomposefs.toml` if it
//! exists. Every field has a sane default, so a missing file is not an
//! error.

use std::{fs, io};

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use serde::Deserialize;

fn default_verity() -> bool {
    false
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Default digest store directory, used when `--digest-store` isn't
    /// passed on the command line.
    pub digest_store: Option<Utf8PathBuf>,
    #[serde(default = "default_verity")]
    pub enable_verity: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            digest_store: None,
            enable_verity: default_verity(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut path: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("can't find home directory"))?
        .try_into()
        .context("home directory isn't UTF-8")?;
    path.extend([".config", "mkcomposefs.toml"]);

    let s = match fs::read_to_string(&path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("couldn't open {path}"))?;

    toml::from_str(&s).with_context(|| format!("couldn't parse {path}"))
}
