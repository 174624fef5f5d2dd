// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to send request: {0}")]
    Request(String, #[source] attohttpc::Error),
    #[error("Server returned status {1}: {0}")]
    Status(String, u16),
    #[error("Failed to read response body: {0}")]
    Read(String, #[source] io::Error),
    #[error("Failed to write downloaded data: {0}")]
    Write(String, #[source] io::Error),
    #[error("Response body ended after {1} of {2} bytes: {0}")]
    Truncated(String, u64, u64),
    #[error("Received cancel signal")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait ProgressDisplay {
    fn progress(&mut self, current: u64, total: Option<u64>);

    fn finish(&mut self);
}

/// Display that discards all progress updates.
pub struct NullProgressDisplay;

impl ProgressDisplay for NullProgressDisplay {
    fn progress(&mut self, _current: u64, _total: Option<u64>) {}

    fn finish(&mut self) {}
}

pub struct BasicProgressDisplay {
    interval: Duration,
    last_render: Instant,
    avg: VecDeque<(Instant, u64)>,
}

// Speed is a simple moving average over 5 seconds.
static AVG_INTERVAL: Duration = Duration::from_millis(100);
static AVG_WINDOW_SIZE: usize = 5000 / AVG_INTERVAL.as_millis() as usize;

impl BasicProgressDisplay {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_render: Instant::now() - interval,
            avg: VecDeque::new(),
        }
    }

    fn clear_line(&self) {
        eprint!("\x1b[2K\r");
    }

    fn speed_mib_s(&self) -> f64 {
        let (Some(front), Some(back)) = (self.avg.front(), self.avg.back()) else {
            return 0.0;
        };

        let avg_window_mib = (back.1 - front.1) as f64 / 1024.0 / 1024.0;
        let avg_window_duration = back.0 - front.0;

        if avg_window_duration.is_zero() {
            0.0
        } else {
            avg_window_mib / avg_window_duration.as_secs_f64()
        }
    }
}

impl ProgressDisplay for BasicProgressDisplay {
    fn progress(&mut self, current: u64, total: Option<u64>) {
        let now = Instant::now();

        let push = match self.avg.back() {
            Some((t, _)) => now - *t > AVG_INTERVAL,
            None => true,
        };
        if push {
            if self.avg.len() == AVG_WINDOW_SIZE {
                self.avg.pop_front();
            }

            self.avg.push_back((now, current));
        }

        if now - self.last_render > self.interval {
            let current_mib = current as f64 / 1024.0 / 1024.0;
            let speed_mib_s = self.speed_mib_s();

            self.clear_line();
            match total {
                Some(t) => {
                    let total_mib = t as f64 / 1024.0 / 1024.0;
                    eprint!("{current_mib:.1} / {total_mib:.1} MiB ({speed_mib_s:.1} MiB/s)");
                }
                None => eprint!("{current_mib:.1} MiB ({speed_mib_s:.1} MiB/s)"),
            }

            self.last_render = now;
        }
    }

    fn finish(&mut self) {
        self.clear_line();
    }
}

/// Source of remote content. All network access goes through this trait.
pub trait Fetcher {
    /// Download the full response body of `url` into memory.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Stream the response body of `url` into `writer`. Returns the number of
    /// bytes written.
    fn fetch_to(
        &self,
        url: &str,
        writer: &mut dyn Write,
        display: &mut dyn ProgressDisplay,
        cancel_signal: &AtomicBool,
    ) -> Result<u64>;

    /// Download `url` as text. Invalid UTF-8 sequences are replaced.
    fn fetch_text(&self, url: &str) -> Result<String> {
        let data = self.fetch(url)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }
}

/// Copy `reader` to `writer` in chunks, reporting progress after each chunk
/// and checking the cancel signal before each read. If `total` is known, a
/// body of any other length is an error.
pub fn copy_with_progress(
    url: &str,
    mut reader: impl Read,
    writer: &mut dyn Write,
    total: Option<u64>,
    display: &mut dyn ProgressDisplay,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let mut buf = [0u8; 65536];
    let mut written = 0u64;

    display.progress(written, total);

    loop {
        if cancel_signal.load(Ordering::SeqCst) {
            display.finish();
            return Err(Error::Cancelled);
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                display.finish();
                return Err(Error::Read(url.to_owned(), e));
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]) {
            display.finish();
            return Err(Error::Write(url.to_owned(), e));
        }

        written += n as u64;
        display.progress(written, total);
    }

    display.finish();

    if let Some(t) = total.filter(|&t| t != written) {
        return Err(Error::Truncated(url.to_owned(), written, t));
    }

    Ok(written)
}

/// [`Fetcher`] backed by blocking HTTP requests.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpFetcher;

impl HttpFetcher {
    fn get(url: &str) -> Result<attohttpc::Response> {
        let response = attohttpc::get(url)
            .header("User-Agent", USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .send()
            .map_err(|e| Error::Request(url.to_owned(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(url.to_owned(), status.as_u16()));
        }

        Ok(response)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        Self::get(url)?
            .bytes()
            .map_err(|e| Error::Request(url.to_owned(), e))
    }

    fn fetch_to(
        &self,
        url: &str,
        writer: &mut dyn Write,
        display: &mut dyn ProgressDisplay,
        cancel_signal: &AtomicBool,
    ) -> Result<u64> {
        let response = Self::get(url)?;
        let total = response
            .headers()
            .get("Content-Length")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse().ok());

        copy_with_progress(url, response, writer, total, display, cancel_signal)
    }
}
