// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsStr,
    fs, io,
    path::{Path, PathBuf},
};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read sources file: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse sources file: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Invalid pattern for {0}: {1:?}")]
    Pattern(&'static str, String, #[source] regex::Error),
    #[error("Device codename is not a plain name: {0:?}")]
    InvalidDevice(String),
}

type Result<T> = std::result::Result<T, Error>;

/// Compile `pattern` so that it must match the entire input.
pub fn full_match(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// A tool or APK published as a GitHub release asset.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReleaseSource {
    /// `owner/name` of the GitHub repository.
    pub repo: String,
    /// Pattern for the release asset name.
    pub asset: String,
    /// Pattern for the zip member to extract. The first entry is used if
    /// unset.
    #[serde(default)]
    pub member: Option<String>,
}

impl ReleaseSource {
    fn new(repo: &str, asset: &str, member: Option<&str>) -> Self {
        Self {
            repo: repo.to_owned(),
            asset: asset.to_owned(),
            member: member.map(str::to_owned),
        }
    }

    pub fn asset_regex(&self) -> Result<Regex> {
        full_match(&self.asset).map_err(|e| Error::Pattern("asset", self.asset.clone(), e))
    }

    pub fn member_regex(&self) -> Result<Option<Regex>> {
        self.member
            .as_deref()
            .map(|m| full_match(m).map_err(|e| Error::Pattern("member", m.to_owned(), e)))
            .transpose()
    }
}

/// Upstream locations for everything the pipeline downloads.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Sources {
    pub github_api: String,
    pub releases_page: String,
    pub custota_tool: ReleaseSource,
    pub avbroot: ReleaseSource,
    pub magisk: ReleaseSource,
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            github_api: "https://api.github.com".to_owned(),
            releases_page: "https://grapheneos.org/releases".to_owned(),
            custota_tool: ReleaseSource::new(
                "chenxiaolong/Custota",
                r"custota-tool-.*-x86_64-unknown-linux-gnu\.zip",
                None,
            ),
            avbroot: ReleaseSource::new(
                "chenxiaolong/avbroot",
                r"avbroot-.*-x86_64-unknown-linux-gnu\.zip",
                Some("avbroot"),
            ),
            // Canary builds are published as app-release.apk and stable
            // builds as Magisk-v<version>.apk.
            magisk: ReleaseSource::new("topjohnwu/Magisk", r"(?:app-release|Magisk-v.*)\.apk", None),
        }
    }
}

impl Sources {
    pub fn from_toml(path: &Path, contents: &str) -> Result<Self> {
        let sources: Self =
            toml_edit::de::from_str(contents).map_err(|e| Error::Parse(path.to_owned(), e))?;
        sources.validate()?;

        Ok(sources)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;

        Self::from_toml(path, &contents)
    }

    /// Make sure every pattern compiles before anything is downloaded.
    pub fn validate(&self) -> Result<()> {
        for source in [&self.custota_tool, &self.avbroot, &self.magisk] {
            source.asset_regex()?;
            source.member_regex()?;
        }

        Ok(())
    }
}

/// Magisk patching parameters. Absent when re-signing rootless.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Magisk {
    pub apk_path: PathBuf,
    pub preinit_device: String,
}

/// Everything a run needs to know. Built once at startup and never modified.
#[derive(Clone, Debug)]
pub struct Settings {
    pub device_codename: String,
    pub magisk: Option<Magisk>,

    pub custota_tool_path: PathBuf,
    pub avbroot_tool_path: PathBuf,

    pub ota_key_path: PathBuf,
    pub ota_cert_path: PathBuf,
    pub avb_key_path: PathBuf,

    pub temp_dir: PathBuf,
    pub factory_ota_path: PathBuf,
    pub patched_ota_path: PathBuf,

    pub output_dir: PathBuf,
    pub update_info_path: PathBuf,
    pub final_ota_path: PathBuf,
    pub csig_path: PathBuf,

    pub sources: Sources,
}

/// Inputs for [`Settings::new`].
#[derive(Clone, Debug)]
pub struct SettingsParams<'a> {
    pub device_codename: &'a str,
    pub magisk_preinit_device: Option<&'a str>,
    pub ota_key_path: &'a Path,
    pub ota_cert_path: &'a Path,
    pub avb_key_path: &'a Path,
    pub temp_dir: &'a Path,
    pub output_dir: &'a Path,
    pub sources: Sources,
}

impl Settings {
    pub const FINAL_OTA_NAME: &'static str = "ota.zip";

    pub fn new(params: SettingsParams<'_>) -> Result<Self> {
        let device = params.device_codename;

        // The codename ends up in file names.
        if device.is_empty() || Path::new(device).file_name() != Some(OsStr::new(device)) {
            return Err(Error::InvalidDevice(device.to_owned()));
        }

        params.sources.validate()?;

        let temp_dir = params.temp_dir.to_owned();
        let output_dir = params.output_dir.to_owned();
        let final_ota_path = output_dir.join(Self::FINAL_OTA_NAME);

        Ok(Self {
            device_codename: device.to_owned(),
            magisk: params.magisk_preinit_device.map(|d| Magisk {
                apk_path: temp_dir.join("magisk.apk"),
                preinit_device: d.to_owned(),
            }),
            custota_tool_path: temp_dir.join("custota-tool"),
            avbroot_tool_path: temp_dir.join("avbroot"),
            ota_key_path: params.ota_key_path.to_owned(),
            ota_cert_path: params.ota_cert_path.to_owned(),
            avb_key_path: params.avb_key_path.to_owned(),
            factory_ota_path: temp_dir.join(format!("{device}_ota.factory.zip")),
            patched_ota_path: temp_dir.join(format!("{device}_ota.patched.zip")),
            update_info_path: output_dir.join(format!("{device}.json")),
            csig_path: output_dir.join(format!("{}.csig", Self::FINAL_OTA_NAME)),
            final_ota_path,
            temp_dir,
            output_dir,
            sources: params.sources,
        })
    }
}
