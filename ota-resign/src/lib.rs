// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod archive;
pub mod cli;
pub mod config;
pub mod download;
pub mod github;
pub mod grapheneos;
pub mod passphrase;
pub mod pipeline;
pub mod tools;
pub mod util;
