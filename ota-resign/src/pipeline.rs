// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, fs,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context as _, Result, bail};
use thiserror::Error;
use tracing::{info, info_span};

use crate::{
    archive,
    config::{Magisk, ReleaseSource, Settings},
    download::{Fetcher, ProgressDisplay},
    github, grapheneos,
    passphrase::Passphrase,
    tools,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    SetupCustotaTool,
    SetupAvbroot,
    SetupMagisk,
    FetchOta,
    ResignOta,
    GenerateCsig,
    GenerateUpdateInfo,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Self::SetupCustotaTool => "setup-custota-tool",
            Self::SetupAvbroot => "setup-avbroot",
            Self::SetupMagisk => "setup-magisk",
            Self::FetchOta => "fetch-ota",
            Self::ResignOta => "resign-ota",
            Self::GenerateCsig => "generate-csig",
            Self::GenerateUpdateInfo => "generate-update-info",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to prepare directories")]
    Prepare(#[source] anyhow::Error),
    #[error("An error occurred on step {step}")]
    Step {
        step: Step,
        #[source]
        source: anyhow::Error,
    },
    #[error("Received cancel signal before step {0}")]
    Cancelled(Step),
}

impl Error {
    /// The step that failed, if the failure happened inside a step.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Prepare(_) => None,
            Self::Step { step, .. } | Self::Cancelled(step) => Some(*step),
        }
    }
}

/// Shared state handed to every step.
pub struct Context<'a> {
    pub settings: &'a Settings,
    pub passphrase: &'a Passphrase,
    pub fetcher: &'a dyn Fetcher,
    pub display: &'a mut dyn ProgressDisplay,
    pub cancel_signal: &'a AtomicBool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new(settings: &Settings) -> Self {
        let mut steps = vec![Step::SetupCustotaTool, Step::SetupAvbroot];

        if settings.magisk.is_some() {
            steps.push(Step::SetupMagisk);
        }

        steps.extend([
            Step::FetchOta,
            Step::ResignOta,
            Step::GenerateCsig,
            Step::GenerateUpdateInfo,
        ]);

        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step in order, stopping at the first failure.
    pub fn run(&self, cx: &mut Context<'_>) -> std::result::Result<(), Error> {
        prepare_dirs(cx.settings).map_err(Error::Prepare)?;

        for &step in &self.steps {
            let _span = info_span!("step", name = step.name()).entered();

            if cx.cancel_signal.load(Ordering::SeqCst) {
                return Err(Error::Cancelled(step));
            }

            run_step(step, cx).map_err(|source| Error::Step { step, source })?;
        }

        info!("Signed OTA written to {:?}", cx.settings.output_dir);

        Ok(())
    }
}

fn prepare_dirs(settings: &Settings) -> Result<()> {
    for dir in [&settings.temp_dir, &settings.output_dir] {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {dir:?}"))?;
    }

    Ok(())
}

fn run_step(step: Step, cx: &mut Context<'_>) -> Result<()> {
    let settings = cx.settings;

    match step {
        Step::SetupCustotaTool => setup_tool(
            cx,
            "custota-tool",
            &settings.sources.custota_tool,
            &settings.custota_tool_path,
        ),
        Step::SetupAvbroot => setup_tool(
            cx,
            "avbroot",
            &settings.sources.avbroot,
            &settings.avbroot_tool_path,
        ),
        Step::SetupMagisk => match &settings.magisk {
            Some(magisk) => setup_magisk(cx, magisk),
            None => bail!("Magisk is not used for rootless builds"),
        },
        Step::FetchOta => fetch_ota(cx),
        Step::ResignOta => tools::resign_ota(settings, cx.passphrase)
            .context("Failed to re-sign OTA"),
        Step::GenerateCsig => tools::generate_csig(settings, cx.passphrase).with_context(|| {
            format!("Failed to generate csig file for OTA at {:?}", settings.final_ota_path)
        }),
        Step::GenerateUpdateInfo => tools::generate_update_info(settings, cx.passphrase)
            .with_context(|| {
                format!(
                    "Failed to generate info JSON file for OTA at {:?}",
                    settings.final_ota_path,
                )
            }),
    }
}

fn setup_tool(
    cx: &Context<'_>,
    name: &str,
    source: &ReleaseSource,
    output: &Path,
) -> Result<()> {
    info!("Fetching the latest {name} release URL from GitHub");

    let url = github::latest_asset_url(
        cx.fetcher,
        &cx.settings.sources.github_api,
        &source.repo,
        &source.asset_regex()?,
    )
    .with_context(|| format!("Failed to find latest {name} release"))?;

    info!("Downloading {url}");

    let member_regex = source.member_regex()?;
    let member = archive::fetch_and_extract(cx.fetcher, &url, member_regex.as_ref(), output)
        .with_context(|| format!("Failed to download and set up {name}"))?;
    archive::set_executable(output)?;

    info!("Extracted {member:?} to {output:?}");

    Ok(())
}

fn setup_magisk(cx: &Context<'_>, magisk: &Magisk) -> Result<()> {
    let settings = cx.settings;
    let source = &settings.sources.magisk;

    info!("Fetching the latest Magisk release URL from GitHub");

    let url = github::latest_asset_url(
        cx.fetcher,
        &settings.sources.github_api,
        &source.repo,
        &source.asset_regex()?,
    )
    .context("Failed to find latest Magisk release")?;

    info!("Downloading {url}");

    let data = cx
        .fetcher
        .fetch(&url)
        .context("Failed to download Magisk APK")?;
    fs::write(&magisk.apk_path, data)
        .with_context(|| format!("Failed to write file: {:?}", magisk.apk_path))?;

    info!("Saved Magisk APK to {:?}", magisk.apk_path);

    Ok(())
}

fn fetch_ota(cx: &mut Context<'_>) -> Result<()> {
    let settings = cx.settings;

    let url = grapheneos::latest_ota_url(
        cx.fetcher,
        &settings.sources.releases_page,
        &settings.device_codename,
    )?;

    grapheneos::download_ota(
        cx.fetcher,
        &url,
        &settings.factory_ota_path,
        cx.display,
        cx.cancel_signal,
    )?;

    info!("Latest OTA downloaded successfully");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{SettingsParams, Sources},
        download::{self, NullProgressDisplay},
    };

    fn settings(preinit_device: Option<&str>) -> Settings {
        Settings::new(SettingsParams {
            device_codename: "husky",
            magisk_preinit_device: preinit_device,
            ota_key_path: Path::new("keys/ota.key"),
            ota_cert_path: Path::new("keys/ota.crt"),
            avb_key_path: Path::new("keys/avb.key"),
            temp_dir: Path::new("temp"),
            output_dir: Path::new("out"),
            sources: Sources::default(),
        })
        .unwrap()
    }

    #[test]
    fn step_order() {
        assert_eq!(
            Pipeline::new(&settings(Some("sda10"))).steps(),
            [
                Step::SetupCustotaTool,
                Step::SetupAvbroot,
                Step::SetupMagisk,
                Step::FetchOta,
                Step::ResignOta,
                Step::GenerateCsig,
                Step::GenerateUpdateInfo,
            ],
        );
    }

    #[test]
    fn rootless_skips_magisk() {
        let pipeline = Pipeline::new(&settings(None));

        assert!(!pipeline.steps().contains(&Step::SetupMagisk));
        assert_eq!(pipeline.steps().len(), 6);
    }

    #[test]
    fn error_names_step() {
        let error = Error::Step {
            step: Step::GenerateCsig,
            source: anyhow::anyhow!("boom"),
        };

        assert_eq!(error.step(), Some(Step::GenerateCsig));
        assert_eq!(error.to_string(), "An error occurred on step generate-csig");
    }

    struct NoFetcher;

    impl Fetcher for NoFetcher {
        fn fetch(&self, url: &str) -> download::Result<Vec<u8>> {
            Err(download::Error::Status(url.to_owned(), 404))
        }

        fn fetch_to(
            &self,
            url: &str,
            _writer: &mut dyn std::io::Write,
            _display: &mut dyn ProgressDisplay,
            _cancel_signal: &AtomicBool,
        ) -> download::Result<u64> {
            Err(download::Error::Status(url.to_owned(), 404))
        }
    }

    #[test]
    fn magisk_step_fails_without_magisk_settings() {
        let settings = settings(None);
        let passphrase = Passphrase::new("hunter2");
        let cancel_signal = AtomicBool::new(false);
        let mut cx = Context {
            settings: &settings,
            passphrase: &passphrase,
            fetcher: &NoFetcher,
            display: &mut NullProgressDisplay,
            cancel_signal: &cancel_signal,
        };

        let error = run_step(Step::SetupMagisk, &mut cx).unwrap_err();
        assert!(error.to_string().contains("rootless"));
    }
}
