// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::download::{self, Fetcher};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to query latest release of {0}")]
    Query(String, #[source] download::Error),
    #[error("Failed to parse latest release of {0}")]
    Parse(String, #[source] serde_json::Error),
    #[error("No asset matching {0:?} found in release {1}")]
    NoMatchingAsset(String, String),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Release {
    #[serde(default)]
    pub tag_name: String,
    pub assets: Vec<Asset>,
}

impl Release {
    /// Return the first asset, in API order, whose name matches `pattern`.
    pub fn find_asset(&self, pattern: &Regex) -> Result<&Asset> {
        self.assets
            .iter()
            .find(|a| pattern.is_match(&a.name))
            .ok_or_else(|| Error::NoMatchingAsset(pattern.to_string(), self.tag_name.clone()))
    }
}

pub fn latest_release_url(api_base: &str, repo: &str) -> String {
    format!(
        "{}/repos/{repo}/releases/latest",
        api_base.trim_end_matches('/'),
    )
}

pub fn latest_release(fetcher: &dyn Fetcher, api_base: &str, repo: &str) -> Result<Release> {
    let url = latest_release_url(api_base, repo);
    let data = fetcher
        .fetch(&url)
        .map_err(|e| Error::Query(repo.to_owned(), e))?;

    serde_json::from_slice(&data).map_err(|e| Error::Parse(repo.to_owned(), e))
}

/// Find the download URL of the first asset in the latest release of `repo`
/// whose name matches `pattern`.
pub fn latest_asset_url(
    fetcher: &dyn Fetcher,
    api_base: &str,
    repo: &str,
    pattern: &Regex,
) -> Result<String> {
    let release = latest_release(fetcher, api_base, repo)?;
    let asset = release.find_asset(pattern)?;

    Ok(asset.browser_download_url.clone())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::config::full_match;

    fn release() -> Release {
        serde_json::from_str(
            r#"{
                "tag_name": "v1.0",
                "assets": [
                    {"name": "A.zip", "browser_download_url": "https://example.com/A.zip", "size": 1},
                    {"name": "B.zip", "browser_download_url": "https://example.com/B.zip", "size": 2},
                    {"name": "C.zip", "browser_download_url": "https://example.com/C.zip", "size": 3}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn find_matching_asset() {
        let release = release();
        let asset = release.find_asset(&full_match(r"B\.zip").unwrap()).unwrap();

        assert_eq!(asset.browser_download_url, "https://example.com/B.zip");
    }

    #[test]
    fn first_match_wins() {
        let release = release();
        let asset = release.find_asset(&full_match(r".*\.zip").unwrap()).unwrap();

        assert_eq!(asset.name, "A.zip");
    }

    #[test]
    fn pattern_must_match_whole_name() {
        let release = release();

        assert_matches!(
            release.find_asset(&full_match("B").unwrap()),
            Err(Error::NoMatchingAsset(_, tag)) if tag == "v1.0"
        );
    }

    #[test]
    fn release_url() {
        assert_eq!(
            latest_release_url("https://api.github.com/", "chenxiaolong/avbroot"),
            "https://api.github.com/repos/chenxiaolong/avbroot/releases/latest",
        );
    }
}
