// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{self, Cursor},
    path::{Path, PathBuf},
};

use regex::Regex;
use thiserror::Error;
use tracing::debug;
use zip::{ZipArchive, result::ZipError};

use crate::download::{self, Fetcher};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to download archive: {0}")]
    Download(String, #[source] download::Error),
    #[error("Failed to read zip archive")]
    Zip(#[from] ZipError),
    #[error("Zip archive has no entries")]
    Empty,
    #[error("No zip entry matching {0:?} found")]
    NoMatchingMember(String),
    #[error("Failed to write file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
    #[error("Failed to set permissions: {0:?}")]
    SetPermissions(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Find the index of the entry to extract. With no pattern, this is the first
/// entry in central directory order.
fn select_member<R: io::Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    pattern: Option<&Regex>,
) -> Result<usize> {
    if archive.is_empty() {
        return Err(Error::Empty);
    }

    let Some(pattern) = pattern else {
        return Ok(0);
    };

    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;

        if pattern.is_match(entry.name()) {
            return Ok(index);
        }
    }

    Err(Error::NoMatchingMember(pattern.to_string()))
}

/// Write a single member of the in-memory zip `data` to `output`. Returns the
/// name of the extracted member.
pub fn extract_member(data: &[u8], pattern: Option<&Regex>, output: &Path) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let index = select_member(&mut archive, pattern)?;
    let mut entry = archive.by_index(index)?;
    let name = entry.name().to_owned();

    debug!("Extracting {name:?} to {output:?}");

    let mut file = File::create(output).map_err(|e| Error::WriteFile(output.to_owned(), e))?;
    io::copy(&mut entry, &mut file).map_err(|e| Error::WriteFile(output.to_owned(), e))?;

    Ok(name)
}

/// Download the zip at `url` into memory and extract one member to `output`.
pub fn fetch_and_extract(
    fetcher: &dyn Fetcher,
    url: &str,
    pattern: Option<&Regex>,
    output: &Path,
) -> Result<String> {
    debug!("Downloading archive to memory: {url}");

    let data = fetcher
        .fetch(url)
        .map_err(|e| Error::Download(url.to_owned(), e))?;

    extract_member(&data, pattern, output)
}

/// Make `path` executable by everyone (`0o755`).
pub fn set_executable(path: &Path) -> Result<()> {
    debug!("Setting file to executable: {path:?}");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::SetPermissions(path.to_owned(), e))?;
    }

    #[cfg(not(unix))]
    fs::metadata(path).map_err(|e| Error::SetPermissions(path.to_owned(), e))?;

    Ok(())
}
