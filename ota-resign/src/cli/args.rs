/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    ffi::OsString,
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use tracing::{Level, info};

use crate::{
    config::{Settings, SettingsParams, Sources},
    download::{BasicProgressDisplay, HttpFetcher},
    passphrase::PassphraseSource,
    pipeline::{Context, Pipeline},
};

const HEADING_DEVICE: &str = "Device options";
const HEADING_KEY: &str = "Key options";
const HEADING_PATH: &str = "Path options";
const HEADING_OTHER: &str = "Other options";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Generate a GrapheneOS OTA signed with custom keys.
///
/// The latest avbroot, custota-tool, and Magisk releases are downloaded from
/// GitHub and the latest OTA for the device is downloaded from the GrapheneOS
/// releases page. The OTA is then re-signed and the files needed by a Custota
/// update server are written to the output directory.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Device codename (eg. husky).
    #[arg(long, value_name = "NAME", help_heading = HEADING_DEVICE)]
    pub device_codename: String,

    /// Magisk preinit device (eg. sda10).
    #[arg(
        long,
        value_name = "PARTITION",
        required_unless_present = "rootless",
        help_heading = HEADING_DEVICE
    )]
    pub magisk_preinit_device: Option<String>,

    /// Skip Magisk and re-sign the OTA without root.
    #[arg(long, conflicts_with = "magisk_preinit_device", help_heading = HEADING_DEVICE)]
    pub rootless: bool,

    /// Private key for signing the OTA.
    #[arg(
        long,
        value_name = "FILE",
        value_parser,
        default_value = "keys/ota.key",
        help_heading = HEADING_KEY
    )]
    pub ota_key_path: PathBuf,

    /// Certificate for OTA signing key.
    #[arg(
        long,
        value_name = "FILE",
        value_parser,
        default_value = "keys/ota.crt",
        help_heading = HEADING_KEY
    )]
    pub ota_cert_path: PathBuf,

    /// Private key for signing vbmeta images.
    #[arg(
        long,
        value_name = "FILE",
        value_parser,
        default_value = "keys/avb.key",
        help_heading = HEADING_KEY
    )]
    pub avb_key_path: PathBuf,

    /// File containing the passphrase for both private keys.
    #[arg(long, value_name = "FILE", value_parser, help_heading = HEADING_KEY)]
    pub pass_file: Option<PathBuf>,

    /// Environment variable containing the passphrase for both private keys.
    ///
    /// If neither this variable nor --pass-file is set, the passphrase is
    /// prompted for interactively.
    #[arg(
        long,
        value_name = "ENV_VAR",
        value_parser,
        default_value = "PASSWORD",
        help_heading = HEADING_KEY
    )]
    pub pass_env_var: OsString,

    /// Directory for downloaded tools and intermediate OTAs.
    #[arg(
        long,
        value_name = "DIRECTORY",
        value_parser,
        default_value = "temp",
        help_heading = HEADING_PATH
    )]
    pub temp_path: PathBuf,

    /// Output directory (eg. htdocs/graphene_husky_ota).
    #[arg(long, value_name = "DIRECTORY", value_parser, help_heading = HEADING_PATH)]
    pub output_path: PathBuf,

    /// TOML file overriding the upstream download sources.
    #[arg(long, value_name = "FILE", value_parser, help_heading = HEADING_PATH)]
    pub sources: Option<PathBuf>,

    /// Lowest log level to show.
    #[arg(long, value_name = "LEVEL", default_value_t, value_enum, help_heading = HEADING_OTHER)]
    pub log_level: LogLevel,
}

impl Cli {
    pub fn settings(&self) -> Result<Settings> {
        let sources = match &self.sources {
            Some(path) => Sources::load(path)?,
            None => Sources::default(),
        };

        let settings = Settings::new(SettingsParams {
            device_codename: &self.device_codename,
            magisk_preinit_device: self.magisk_preinit_device.as_deref(),
            ota_key_path: &self.ota_key_path,
            ota_cert_path: &self.ota_cert_path,
            avb_key_path: &self.avb_key_path,
            temp_dir: &self.temp_path,
            output_dir: &self.output_path,
            sources,
        })?;

        Ok(settings)
    }
}

pub fn init_logging(log_level: LogLevel) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(log_level))
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    let settings = cli.settings()?;

    let passphrase = PassphraseSource::new(cli.pass_file.as_deref(), &cli.pass_env_var)
        .acquire()
        .context("Failed to acquire signing passphrase")?;

    let pipeline = Pipeline::new(&settings);
    let mut display = BasicProgressDisplay::new(Duration::from_millis(50));

    info!("Generating signed OTA for {}", settings.device_codename);

    pipeline.run(&mut Context {
        settings: &settings,
        passphrase: &passphrase,
        fetcher: &HttpFetcher,
        display: &mut display,
        cancel_signal,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn preinit_device_or_rootless_required() {
        let base = ["ota-resign", "--device-codename", "husky", "--output-path", "out"];

        assert!(Cli::try_parse_from(base).is_err());

        let cli = Cli::try_parse_from(base.iter().chain(&["--rootless"])).unwrap();
        assert!(cli.rootless);
        assert_eq!(cli.settings().unwrap().magisk, None);

        let cli = Cli::try_parse_from(base.iter().chain(&["--magisk-preinit-device", "sda10"]))
            .unwrap();
        assert_eq!(cli.magisk_preinit_device.as_deref(), Some("sda10"));

        assert!(
            Cli::try_parse_from(
                base.iter()
                    .chain(&["--rootless", "--magisk-preinit-device", "sda10"])
            )
            .is_err()
        );
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from([
            "ota-resign",
            "--device-codename",
            "husky",
            "--magisk-preinit-device",
            "sda10",
            "--output-path",
            "out",
        ])
        .unwrap();

        assert_eq!(cli.ota_key_path, PathBuf::from("keys/ota.key"));
        assert_eq!(cli.ota_cert_path, PathBuf::from("keys/ota.crt"));
        assert_eq!(cli.avb_key_path, PathBuf::from("keys/avb.key"));
        assert_eq!(cli.temp_path, PathBuf::from("temp"));
        assert_eq!(cli.pass_env_var, OsString::from("PASSWORD"));
        assert_eq!(cli.log_level, LogLevel::Info);
    }
}
