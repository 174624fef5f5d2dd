// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::Settings,
    passphrase::{self, Passphrase},
    util::{self, DebugString},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run command: {0:?}")]
    CommandSpawn(DebugString, #[source] io::Error),
    #[error("Command failed with status: {1}: {0:?}")]
    CommandExecution(DebugString, ExitStatus),
    #[error("Failed to move {0:?} to {1:?}")]
    MoveFile(PathBuf, PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Run `program` with the passphrase exposed through the environment. Output
/// is passed through to our own stdout/stderr.
pub fn run(program: &Path, args: &[OsString], passphrase: &Passphrase) -> Result<()> {
    let mut command = Command::new(program);
    command.args(args);
    command.envs(passphrase.child_env());
    command.stdin(Stdio::null());

    debug!("Running: {command:?}");

    let status = command
        .status()
        .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

    if !status.success() {
        return Err(Error::CommandExecution(DebugString::new(&command), status));
    }

    Ok(())
}

fn os_args<'a>(args: impl IntoIterator<Item = &'a OsStr>) -> Vec<OsString> {
    args.into_iter().map(OsStr::to_owned).collect()
}

pub fn avbroot_patch_args(settings: &Settings) -> Vec<OsString> {
    let mut args = os_args([
        OsStr::new("ota"),
        OsStr::new("patch"),
        OsStr::new("--input"),
        settings.factory_ota_path.as_os_str(),
        OsStr::new("--key-avb"),
        settings.avb_key_path.as_os_str(),
        OsStr::new("--key-ota"),
        settings.ota_key_path.as_os_str(),
        OsStr::new("--cert-ota"),
        settings.ota_cert_path.as_os_str(),
        OsStr::new("--pass-avb-env-var"),
        OsStr::new(passphrase::ENV_AVB),
        OsStr::new("--pass-ota-env-var"),
        OsStr::new(passphrase::ENV_OTA),
    ]);

    match &settings.magisk {
        Some(m) => args.extend(os_args([
            OsStr::new("--magisk"),
            m.apk_path.as_os_str(),
            OsStr::new("--magisk-preinit-device"),
            OsStr::new(&m.preinit_device),
        ])),
        None => args.push("--rootless".into()),
    }

    args.extend(os_args([
        OsStr::new("--output"),
        settings.patched_ota_path.as_os_str(),
    ]));

    args
}

pub fn gen_csig_args(settings: &Settings) -> Vec<OsString> {
    os_args([
        OsStr::new("gen-csig"),
        OsStr::new("--input"),
        settings.final_ota_path.as_os_str(),
        OsStr::new("--key"),
        settings.ota_key_path.as_os_str(),
        OsStr::new("--passphrase-env-var"),
        OsStr::new(passphrase::ENV_CUSTOTA),
        OsStr::new("--cert"),
        settings.ota_cert_path.as_os_str(),
        OsStr::new("--output"),
        settings.csig_path.as_os_str(),
    ])
}

pub fn gen_update_info_args(settings: &Settings) -> Vec<OsString> {
    os_args([
        OsStr::new("gen-update-info"),
        OsStr::new("--file"),
        settings.update_info_path.as_os_str(),
        // Relative to the update info file.
        OsStr::new("--location"),
        OsStr::new(Settings::FINAL_OTA_NAME),
    ])
}

/// Patch the factory OTA with our keys and move the result to its final
/// location.
pub fn resign_ota(settings: &Settings, passphrase: &Passphrase) -> Result<()> {
    info!(
        "Re-signing OTA: {:?} -> {:?}",
        settings.factory_ota_path, settings.patched_ota_path,
    );

    run(
        &settings.avbroot_tool_path,
        &avbroot_patch_args(settings),
        passphrase,
    )?;

    info!(
        "Moving patched OTA: {:?} -> {:?}",
        settings.patched_ota_path, settings.final_ota_path,
    );

    util::move_file(&settings.patched_ota_path, &settings.final_ota_path).map_err(|e| {
        Error::MoveFile(
            settings.patched_ota_path.clone(),
            settings.final_ota_path.clone(),
            e,
        )
    })
}

pub fn generate_csig(settings: &Settings, passphrase: &Passphrase) -> Result<()> {
    info!(
        "Generating csig: {:?} -> {:?}",
        settings.final_ota_path, settings.csig_path,
    );

    run(
        &settings.custota_tool_path,
        &gen_csig_args(settings),
        passphrase,
    )
}

pub fn generate_update_info(settings: &Settings, passphrase: &Passphrase) -> Result<()> {
    info!("Generating update info: {:?}", settings.update_info_path);

    run(
        &settings.custota_tool_path,
        &gen_update_info_args(settings),
        passphrase,
    )
}
