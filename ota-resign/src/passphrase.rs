// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    env::{self, VarError},
    ffi::{OsStr, OsString},
    fmt, fs, io,
    path::{Path, PathBuf},
};

use passterm::PromptError;
use thiserror::Error;

/// Variable names under which the passphrase is exposed to child processes.
/// avbroot reads the first two, custota-tool reads the last one.
pub const ENV_AVB: &str = "PASSPHRASE_AVB";
pub const ENV_OTA: &str = "PASSPHRASE_OTA";
pub const ENV_CUSTOTA: &str = "PASSPHRASE_ENV_VAR";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Passphrase prompt requires an interactive terminal")]
    NotInteractive(#[source] io::Error),
    #[error("Failed to prompt for passphrase")]
    PassphrasePrompt(#[source] PromptError),
    #[error("Failed to read environment variable: {0:?}")]
    InvalidEnvVar(OsString, #[source] VarError),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Signing passphrase shared by the AVB and OTA keys.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Environment variables to set on child processes.
    pub fn child_env(&self) -> [(&'static str, &str); 3] {
        [
            (ENV_AVB, &self.0),
            (ENV_OTA, &self.0),
            (ENV_CUSTOTA, &self.0),
        ]
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassphraseSource {
    File(PathBuf),
    EnvVar(OsString),
    Prompt(String),
}

impl PassphraseSource {
    /// Pick the first available source: an explicit file, then the named
    /// environment variable if it is set and non-empty, then an interactive
    /// prompt.
    pub fn new(pass_file: Option<&Path>, env_var: &OsStr) -> Self {
        Self::select(pass_file, env_var, env::var_os(env_var).as_deref())
    }

    fn select(pass_file: Option<&Path>, env_var: &OsStr, env_value: Option<&OsStr>) -> Self {
        if let Some(p) = pass_file {
            Self::File(p.to_owned())
        } else if env_value.is_some_and(|v| !v.is_empty()) {
            Self::EnvVar(env_var.to_owned())
        } else {
            Self::Prompt("Enter passphrase: ".to_owned())
        }
    }

    fn prompt(prompt: &str) -> Result<String> {
        match passterm::prompt_password_tty(Some(prompt)) {
            Ok(p) => Ok(p),
            Err(e) => {
                #[cfg(unix)]
                if let PromptError::IOError(io_e) = e {
                    if let Some(errno) = io_e.raw_os_error() {
                        if errno == libc::ENXIO || errno == libc::ENOTTY {
                            return Err(Error::NotInteractive(io_e));
                        }
                    }

                    return Err(Error::PassphrasePrompt(PromptError::IOError(io_e)));
                }

                Err(Error::PassphrasePrompt(e))
            }
        }
    }

    pub fn acquire(&self) -> Result<Passphrase> {
        let passphrase = match self {
            Self::File(p) => fs::read_to_string(p)
                .map_err(|e| Error::ReadFile(p.clone(), e))?
                .trim_end_matches(['\r', '\n'])
                .to_owned(),
            Self::EnvVar(v) => env::var(v).map_err(|e| Error::InvalidEnvVar(v.clone(), e))?,
            Self::Prompt(p) => Self::prompt(p)?,
        };

        Ok(Passphrase(passphrase))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const UNSET_VAR: &str = "OTA_RESIGN_TEST_UNSET_PASSPHRASE_VAR";

    #[test]
    fn file_takes_precedence() {
        let source = PassphraseSource::new(Some(Path::new("pass.txt")), OsStr::new("PATH"));
        assert_eq!(source, PassphraseSource::File(PathBuf::from("pass.txt")));
    }

    #[test]
    fn set_env_var_before_prompt() {
        // PATH is set in any sane test environment.
        let source = PassphraseSource::new(None, OsStr::new("PATH"));
        assert_eq!(source, PassphraseSource::EnvVar(OsString::from("PATH")));

        let source = PassphraseSource::new(None, OsStr::new(UNSET_VAR));
        assert_matches!(source, PassphraseSource::Prompt(_));
    }

    #[test]
    fn empty_env_var_prompts() {
        let var = OsStr::new("PASSWORD");

        assert_matches!(
            PassphraseSource::select(None, var, Some(OsStr::new(""))),
            PassphraseSource::Prompt(_)
        );
        assert_eq!(
            PassphraseSource::select(None, var, Some(OsStr::new("hunter2"))),
            PassphraseSource::EnvVar(var.to_owned()),
        );
    }

    #[test]
    fn file_strips_trailing_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass");
        fs::write(&path, "hunter2\r\n").unwrap();

        let passphrase = PassphraseSource::File(path).acquire().unwrap();
        assert_eq!(passphrase.expose(), "hunter2");
    }

    #[test]
    fn missing_env_var_is_an_error() {
        let source = PassphraseSource::EnvVar(UNSET_VAR.into());
        assert_matches!(source.acquire(), Err(Error::InvalidEnvVar(_, VarError::NotPresent)));
    }

    #[test]
    fn debug_is_redacted() {
        let passphrase = Passphrase::new("hunter2");
        assert!(!format!("{passphrase:?}").contains("hunter2"));
        assert!(passphrase.child_env().iter().all(|(_, v)| *v == "hunter2"));
    }
}
