// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use regex::Regex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::download::{self, Fetcher, ProgressDisplay};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to fetch the releases page: {0}")]
    ReleasesPage(String, #[source] download::Error),
    #[error("No OTA URL found for {0}")]
    NoOtaUrl(String),
    #[error("Failed to download OTA: {0}")]
    Download(String, #[source] download::Error),
    #[error("Failed to create temporary file in: {0:?}")]
    CreateTemp(PathBuf, #[source] io::Error),
    #[error("Failed to write file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Pattern for full OTA URLs of `device`. Build numbers are either a date
/// (`20240101`) or a date plus a two digit revision (`2024010100`).
pub fn ota_url_pattern(device: &str) -> Regex {
    let pattern = format!(
        r"https://releases\.grapheneos\.org/{}-ota_update-20\d{{6}}(?:\d{{2}})?\.zip",
        regex::escape(device),
    );

    Regex::new(&pattern).expect("escaped device pattern is always valid")
}

/// Find the first OTA URL for `device` in document order.
pub fn find_ota_url<'a>(html: &'a str, device: &str) -> Option<&'a str> {
    ota_url_pattern(device).find(html).map(|m| m.as_str())
}

/// Scrape the releases page for the most recent OTA of `device`.
pub fn latest_ota_url(fetcher: &dyn Fetcher, page_url: &str, device: &str) -> Result<String> {
    info!("Fetching the latest OTA URL from {page_url}");

    let html = fetcher
        .fetch_text(page_url)
        .map_err(|e| Error::ReleasesPage(page_url.to_owned(), e))?;

    let url = find_ota_url(&html, device).ok_or_else(|| Error::NoOtaUrl(device.to_owned()))?;
    info!("Found latest OTA URL: {url}");

    Ok(url.to_owned())
}

/// Stream `url` to `output`. The data is written to a temporary file in the
/// same directory and only renamed to `output` once the download completes.
pub fn download_ota(
    fetcher: &dyn Fetcher,
    url: &str,
    output: &Path,
    display: &mut dyn ProgressDisplay,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    info!("Downloading the latest OTA to {output:?}");

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let temp_file =
        NamedTempFile::new_in(parent).map_err(|e| Error::CreateTemp(parent.to_owned(), e))?;
    let mut writer = BufWriter::new(temp_file);

    let size = fetcher
        .fetch_to(url, &mut writer, display, cancel_signal)
        .map_err(|e| Error::Download(url.to_owned(), e))?;

    let temp_file = writer
        .into_inner()
        .map_err(|e| Error::WriteFile(output.to_owned(), e.into_error()))?;
    temp_file
        .persist(output)
        .map_err(|e| Error::WriteFile(output.to_owned(), e.error))?;

    debug!("Downloaded {size} bytes");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs, io::Write, sync::atomic::Ordering};

    use assert_matches::assert_matches;

    use super::*;
    use crate::download::{NullProgressDisplay, copy_with_progress};

    const PAGE: &str = r#"<!DOCTYPE html>
<html>
<body>
<h2>Releases</h2>
<p><a href="https://releases.grapheneos.org/shiba-ota_update-2024010200.zip">shiba</a></p>
<p><a href="https://releases.grapheneos.org/husky-ota_update-2024010200.zip">husky</a></p>
<p><a href="https://releases.grapheneos.org/husky-ota_update-2023122900.zip">husky</a></p>
<p><a href="https://releases.grapheneos.org/husky-factory-2024010200.zip">factory</a></p>
</body>
</html>"#;

    #[derive(Default)]
    struct MapFetcher(HashMap<String, Vec<u8>>);

    impl Fetcher for MapFetcher {
        fn fetch(&self, url: &str) -> download::Result<Vec<u8>> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| download::Error::Status(url.to_owned(), 404))
        }

        fn fetch_to(
            &self,
            url: &str,
            writer: &mut dyn Write,
            display: &mut dyn ProgressDisplay,
            cancel_signal: &AtomicBool,
        ) -> download::Result<u64> {
            let data = self.fetch(url)?;
            let total = Some(data.len() as u64);

            copy_with_progress(url, data.as_slice(), writer, total, display, cancel_signal)
        }
    }

    #[test]
    fn single_match_among_other_text() {
        let html = "before https://releases.grapheneos.org/husky-ota_update-2024010100.zip after";

        assert_eq!(
            find_ota_url(html, "husky"),
            Some("https://releases.grapheneos.org/husky-ota_update-2024010100.zip"),
        );
    }

    #[test]
    fn first_match_in_document_order() {
        assert_eq!(
            find_ota_url(PAGE, "husky"),
            Some("https://releases.grapheneos.org/husky-ota_update-2024010200.zip"),
        );
        assert_eq!(
            find_ota_url(PAGE, "shiba"),
            Some("https://releases.grapheneos.org/shiba-ota_update-2024010200.zip"),
        );
    }

    #[test]
    fn date_only_build_number() {
        let html = "https://releases.grapheneos.org/husky-ota_update-20240101.zip";

        assert_eq!(find_ota_url(html, "husky"), Some(html));
    }

    #[test]
    fn no_match() {
        assert_eq!(find_ota_url(PAGE, "akita"), None);
        assert_eq!(
            find_ota_url("https://releases.grapheneos.org/husky-ota_update-19990101.zip", "husky"),
            None,
        );
        // Codenames are literal, not patterns.
        assert_eq!(find_ota_url(PAGE, "h.sky"), None);
    }

    #[test]
    fn latest_url_from_page() {
        let mut fetcher = MapFetcher::default();
        fetcher.0.insert("https://grapheneos.org/releases".to_owned(), PAGE.into());

        let url = latest_ota_url(&fetcher, "https://grapheneos.org/releases", "husky").unwrap();
        assert_eq!(url, "https://releases.grapheneos.org/husky-ota_update-2024010200.zip");

        assert_matches!(
            latest_ota_url(&fetcher, "https://grapheneos.org/releases", "akita"),
            Err(Error::NoOtaUrl(d)) if d == "akita"
        );
        assert_matches!(
            latest_ota_url(&fetcher, "https://grapheneos.org/missing", "husky"),
            Err(Error::ReleasesPage(_, download::Error::Status(_, 404)))
        );
    }

    #[test]
    fn download_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("husky_ota.factory.zip");
        let url = "https://releases.grapheneos.org/husky-ota_update-20240101.zip";

        let mut fetcher = MapFetcher::default();
        fetcher.0.insert(url.to_owned(), b"ota contents".to_vec());

        let cancel_signal = AtomicBool::new(true);
        assert_matches!(
            download_ota(&fetcher, url, &output, &mut NullProgressDisplay, &cancel_signal),
            Err(Error::Download(_, download::Error::Cancelled))
        );
        assert!(!output.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        cancel_signal.store(false, Ordering::SeqCst);
        download_ota(&fetcher, url, &output, &mut NullProgressDisplay, &cancel_signal).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"ota contents");
    }

    /// Serves a body shorter than the advertised length.
    struct ShortFetcher;

    impl Fetcher for ShortFetcher {
        fn fetch(&self, _url: &str) -> download::Result<Vec<u8>> {
            Ok(b"partial".to_vec())
        }

        fn fetch_to(
            &self,
            url: &str,
            writer: &mut dyn Write,
            display: &mut dyn ProgressDisplay,
            cancel_signal: &AtomicBool,
        ) -> download::Result<u64> {
            copy_with_progress(url, &b"partial"[..], writer, Some(1024), display, cancel_signal)
        }
    }

    #[test]
    fn truncated_download_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("husky_ota.factory.zip");
        let url = "https://releases.grapheneos.org/husky-ota_update-20240101.zip";

        assert_matches!(
            download_ota(
                &ShortFetcher,
                url,
                &output,
                &mut NullProgressDisplay,
                &AtomicBool::new(false),
            ),
            Err(Error::Download(_, download::Error::Truncated(_, 7, 1024)))
        );
        assert!(!output.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
