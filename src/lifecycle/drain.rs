//! Background consumer of the worker's output stream.
//!
//! The drain runs on its own thread for as long as the stream stays open. Every chunk read is
//! appended to the backing log and flushed before the next read, so the log never lags behind the
//! stream, even in the middle of a line. Complete lines are optionally mirrored to the console
//! behind a coloured `[label]` prefix. Failures never propagate synchronously: they are stored in
//! the task result and surface when the owner joins it.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    thread::JoinHandle,
    time::Duration,
};

use async_io::Timer;
use colored::{Color, Colorize};
use futures::{
    channel::oneshot,
    io::{AsyncRead, AsyncReadExt},
    select, FutureExt,
};
use thiserror::Error;

use crate::cancellation::CancellationToken;

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("unable to create log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to read worker output: {0}")]
    Read(#[source] std::io::Error),
    #[error("unable to write log file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("drain thread exited without reporting")]
    Lost,
    #[error("drain did not finish within {0:?}")]
    JoinTimeout(Duration),
}

/// Console mirroring options.
#[derive(Clone, Debug)]
pub struct Echo {
    pub label: String,
    pub color: Color,
}

/// What a finished drain observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Lines seen, counting a trailing unterminated one.
    pub lines: u64,
    pub bytes: u64,
}

/// Handle over a running drain.
///
/// Dropping the handle cancels the drain.
pub struct DrainTask {
    result: oneshot::Receiver<Result<DrainSummary, DrainError>>,
    cancellation_token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

/// Starts draining `stream` into `log_path`.
pub fn start<R>(stream: R, log_path: &Path, echo: Option<Echo>) -> std::io::Result<DrainTask>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let cancellation_token = CancellationToken::new();
    let log_path = log_path.to_owned();
    let thread = std::thread::Builder::new()
        .name("standup-drain".to_owned())
        .spawn({
            let cancellation_token = cancellation_token.clone();
            move || {
                let res = futures::executor::block_on(drain(
                    stream,
                    &log_path,
                    echo.as_ref(),
                    cancellation_token,
                ));
                // The owner may have given up on the result already.
                let _ = tx.send(res);
            }
        })?;
    Ok(DrainTask {
        result: rx,
        cancellation_token,
        thread: Some(thread),
    })
}

impl DrainTask {
    /// Whether the drain has stopped reading.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits at most `timeout` for the stream to close and returns the drain outcome.
    ///
    /// On timeout the drain is cancelled and its thread detached. Once an outcome has been
    /// returned, later calls report [`DrainError::Lost`].
    pub async fn join(&mut self, timeout: Duration) -> Result<DrainSummary, DrainError> {
        let res = select! {
            res = (&mut self.result).fuse() => res.unwrap_or(Err(DrainError::Lost)),
            _ = Timer::after(timeout).fuse() => Err(DrainError::JoinTimeout(timeout)),
        };
        if matches!(res, Err(DrainError::JoinTimeout(_))) {
            self.cancellation_token.cancel();
        } else if let Some(thread) = self.thread.take() {
            // The result has been sent, the thread is about to return.
            let _ = thread.join();
        }
        res
    }
}

impl Drop for DrainTask {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

async fn drain<R>(
    mut stream: R,
    log_path: &Path,
    echo: Option<&Echo>,
    cancellation_token: CancellationToken,
) -> Result<DrainSummary, DrainError>
where
    R: AsyncRead + Unpin,
{
    let mut log = File::create(log_path).map_err(|source| DrainError::Open {
        path: log_path.to_owned(),
        source,
    })?;
    let mut summary = DrainSummary::default();
    let mut chunk = vec![0; CHUNK_SIZE];
    // Unterminated end of the last chunk.
    let mut partial = Vec::new();

    loop {
        let read = select! {
            read = stream.read(&mut chunk).fuse() => read.map_err(DrainError::Read)?,
            () = cancellation_token.cancelled().fuse() => break,
        };
        if read == 0 {
            break;
        }

        log.write_all(&chunk[..read])
            .and_then(|()| log.flush())
            .map_err(|source| DrainError::Write {
                path: log_path.to_owned(),
                source,
            })?;
        summary.bytes += read as u64;

        partial.extend_from_slice(&chunk[..read]);
        while let Some(end) = partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = partial.drain(..=end).collect();
            summary.lines += 1;
            print_line(echo, &line);
        }
    }

    if !partial.is_empty() {
        summary.lines += 1;
        print_line(echo, &partial);
    }
    Ok(summary)
}

fn print_line(echo: Option<&Echo>, line: &[u8]) {
    if let Some(echo) = echo {
        println!(
            "[{}] {}",
            echo.label.color(echo.color),
            String::from_utf8_lossy(line).trim_end()
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;
    use futures::{executor::block_on, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_lines_are_logged_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("backing_logs.txt");
        let (reader, mut writer) = sluice::pipe::pipe();

        let mut task = start(
            reader,
            &log_path,
            Some(Echo {
                label: "dut".to_owned(),
                color: Color::Yellow,
            }),
        )
        .unwrap();

        block_on(async {
            writer.write_all(b"first line\n").await.unwrap();
            writer.write_all(b"second ").await.unwrap();
            writer.write_all(b"line\nunterminated").await.unwrap();
            writer.close().await.unwrap();
        });
        drop(writer);

        let summary = block_on(task.join(Duration::from_secs(5))).unwrap();
        assert_eq!(summary, DrainSummary { lines: 3, bytes: 35 });
        assert_eq!(
            std::fs::read_to_string(&log_path).unwrap(),
            "first line\nsecond line\nunterminated"
        );
    }

    #[test]
    fn test_open_stream_times_out_and_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("backing_logs.txt");
        let (reader, mut writer) = sluice::pipe::pipe();

        let mut task = start(reader, &log_path, None).unwrap();
        block_on(writer.write_all(b"partial\n")).unwrap();

        assert_matches!(
            block_on(task.join(Duration::from_millis(200))),
            Err(DrainError::JoinTimeout(_))
        );
        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "partial\n");
    }

    #[test]
    fn test_unterminated_line_is_logged_before_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("backing_logs.txt");
        let (reader, mut writer) = sluice::pipe::pipe();

        let mut task = start(reader, &log_path, None).unwrap();
        block_on(writer.write_all(b"a\nb\r\nno-newline")).unwrap();

        assert_matches!(
            block_on(task.join(Duration::from_millis(200))),
            Err(DrainError::JoinTimeout(_))
        );
        assert_eq!(
            std::fs::read(&log_path).unwrap(),
            b"a\nb\r\nno-newline".to_vec()
        );
    }

    #[test]
    fn test_open_failure_is_reported_on_join() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("missing").join("backing_logs.txt");
        let (reader, _writer) = sluice::pipe::pipe();

        let mut task = start(reader, &log_path, None).unwrap();
        assert_matches!(
            block_on(task.join(Duration::from_secs(5))),
            Err(DrainError::Open { path, .. }) if path == log_path
        );
    }
}
