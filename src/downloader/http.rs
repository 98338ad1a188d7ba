//! Transfer execution on the downloader runtime
//!
//! Resume follows the usual HTTP rules: `206` continues the held prefix,
//! a `200` for a whole-resource resume restarts from zero, and `416` on a
//! whole-resource resume means the file is already complete.

use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::buffer::MemoryBuffer;
use super::task::{Range, TaskError, TransportError};
use super::Shared;

type Outcome = std::result::Result<(), TaskError>;

/// What a task does once it gets a transfer slot.
pub(crate) enum Job {
    Size,
    Memory { buffer: MemoryBuffer, range: Range },
    File { path: PathBuf, range: Range, resume: bool },
}

pub(crate) async fn execute(shared: Arc<Shared>, id: u64, url: String, job: Job) {
    let _permit = match shared.limiter().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            shared.finish(id, Err(transport(TransportError::CouldNotConnect, "downloader closed")));
            return;
        }
    };

    if !shared.begin(id) {
        debug!("task#{} dropped before start", id);
        return;
    }

    let outcome = match job {
        Job::Size => probe_size(&shared, id, &url).await,
        Job::Memory { buffer, range } => to_memory(&shared, id, &url, &buffer, range).await,
        Job::File { path, range, resume } => to_file(&shared, id, &url, &path, range, resume).await,
    };

    shared.finish(id, outcome);
}

async fn probe_size(shared: &Shared, id: u64, url: &str) -> Outcome {
    let response = send(shared, shared.client().head(url)).await?;
    let status = check_status(shared, id, &response)?;

    let total = match header_u64(&response, CONTENT_LENGTH) {
        Some(len) => len,
        None => {
            // Some servers omit the length on HEAD; ask for a single byte instead
            let response = send(shared, shared.client().get(url).header(RANGE, "bytes=0-0")).await?;
            let status = check_status(shared, id, &response)?;
            if status == StatusCode::PARTIAL_CONTENT {
                content_range_total(&response).ok_or_else(|| {
                    transport(TransportError::RangeError, "no total in Content-Range")
                })?
            } else {
                header_u64(&response, CONTENT_LENGTH).unwrap_or(0)
            }
        }
    };

    debug!("task#{} {} is {} bytes (HTTP {})", id, url, total, status.as_u16());
    shared.update(id, |s| {
        s.size_total = total;
        s.size_downloaded = 0;
    });
    Ok(())
}

async fn to_memory(shared: &Shared, id: u64, url: &str, buffer: &MemoryBuffer, range: Range) -> Outcome {
    let expected = range.len();
    shared.update(id, |s| s.size_total = expected.unwrap_or(0));

    let capacity = buffer.capacity() as u64;
    if expected.is_some_and(|len| len > capacity) {
        return Err(transport(
            TransportError::WriteError,
            &format!("range of {:?} bytes exceeds buffer capacity {}", expected, capacity),
        ));
    }

    let mut request = shared.client().get(url);
    if let Some(value) = range.header(0) {
        request = request.header(RANGE, value);
    }
    let response = send(shared, request).await?;
    let status = check_status(shared, id, &response)?;
    reject_ignored_range(status, range, 0)?;

    if expected.is_none() {
        if let Some(len) = header_u64(&response, CONTENT_LENGTH) {
            shared.update(id, |s| s.size_total = len);
        }
    }

    // Stage everything; the buffer is only touched once the range is complete
    let limit = expected.unwrap_or(capacity).min(capacity);
    let mut staged = Vec::with_capacity(limit as usize);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = next_chunk(shared, &mut stream).await? {
        let chunk: &[u8] = chunk.as_ref();
        if staged.len() as u64 + chunk.len() as u64 > limit {
            return Err(transport(
                TransportError::WriteError,
                &format!("server sent more than the {} requested bytes", limit),
            ));
        }
        staged.extend_from_slice(chunk);
    }

    if let Some(len) = expected {
        if staged.len() as u64 != len {
            return Err(transport(
                TransportError::PartialFile,
                &format!("got {} of {} bytes", staged.len(), len),
            ));
        }
    }

    if !buffer.commit(&staged) {
        return Err(transport(TransportError::WriteError, "buffer too small"));
    }
    let written = staged.len() as u64;
    shared.update(id, |s| {
        s.size_downloaded = written;
        if s.size_total == 0 {
            s.size_total = written;
        }
    });
    Ok(())
}

async fn to_file(
    shared: &Shared,
    id: u64,
    url: &str,
    path: &Path,
    range: Range,
    resume: bool,
) -> Outcome {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }

    let expected = range.len();
    let mut held = if resume {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    } else {
        0
    };

    if let Some(expected) = expected {
        shared.update(id, |s| s.size_total = expected);
        if held == expected {
            debug!("task#{} {} already complete", id, path.display());
            shared.update(id, |s| s.size_downloaded = expected);
            return Ok(());
        }
        if held > expected {
            warn!(
                "Partial file larger than expected ({} > {}), restarting: {}",
                held,
                expected,
                path.display()
            );
            held = 0;
        }
    }

    let mut request = shared.client().get(url);
    if let Some(value) = range.header(held) {
        request = request.header(RANGE, value);
    }
    let response = send(shared, request).await?;

    if held > 0 && range.is_full() && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        let remote = content_range_total(&response);
        if remote.is_none() || remote == Some(held) {
            debug!("task#{} {} already complete (416)", id, path.display());
            shared.update(id, |s| {
                s.error.http_code = 416;
                s.size_total = held;
                s.size_downloaded = held;
            });
            return Ok(());
        }
    }

    let status = check_status(shared, id, &response)?;
    let mut append = held > 0 && status == StatusCode::PARTIAL_CONTENT;

    if held > 0 && status == StatusCode::OK {
        if range.is_full() {
            warn!("Server ignored resume request for {}, restarting from 0", url);
            held = 0;
            append = false;
        } else {
            return Err(transport(TransportError::RangeError, "server ignored the range request"));
        }
    }
    reject_ignored_range(status, range, held)?;

    let total = expected.or_else(|| header_u64(&response, CONTENT_LENGTH).map(|len| len + held));
    let remaining = expected.map(|len| len - held);

    let mut file = if append {
        OpenOptions::new().append(true).open(path).await.map_err(io_error)?
    } else {
        File::create(path).await.map_err(io_error)?
    };

    shared.update(id, |s| {
        s.size_total = total.unwrap_or(0);
        s.size_downloaded = held;
    });

    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = next_chunk(shared, &mut stream).await? {
        let chunk: &[u8] = chunk.as_ref();
        let len = chunk.len() as u64;
        if remaining.is_some_and(|r| written + len > r) {
            return Err(transport(
                TransportError::WriteError,
                &format!("server sent more than the {} requested bytes", expected.unwrap_or(0)),
            ));
        }
        file.write_all(chunk).await.map_err(io_error)?;
        written += len;
        shared.update(id, |s| s.size_downloaded = held + written);
    }
    file.flush().await.map_err(io_error)?;

    if let Some(remaining) = remaining {
        if written != remaining {
            return Err(transport(
                TransportError::PartialFile,
                &format!("got {} of {} bytes", held + written, held + remaining),
            ));
        }
    }

    if total.is_none() {
        shared.update(id, |s| s.size_total = held + written);
    }
    Ok(())
}

async fn send(shared: &Shared, request: RequestBuilder) -> Result<Response, TaskError> {
    match tokio::time::timeout(shared.timeout(), request.send()).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(reqwest_error(&e)),
        Err(_) => Err(transport(TransportError::Timeout, "no response")),
    }
}

async fn next_chunk<S, B>(shared: &Shared, stream: &mut S) -> Result<Option<B>, TaskError>
where
    S: futures::Stream<Item = reqwest::Result<B>> + Unpin,
{
    match tokio::time::timeout(shared.timeout(), stream.next()).await {
        Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
        Ok(Some(Err(e))) => Err(reqwest_error(&e)),
        Ok(None) => Ok(None),
        Err(_) => Err(transport(
            TransportError::Timeout,
            &format!("stalled: no data for {}s", shared.timeout().as_secs()),
        )),
    }
}

fn check_status(shared: &Shared, id: u64, response: &Response) -> Result<StatusCode, TaskError> {
    let status = response.status();
    shared.update(id, |s| s.error.http_code = status.as_u16());
    if status.is_success() {
        Ok(status)
    } else {
        Err(TaskError {
            http_code: status.as_u16(),
            transport: Some(TransportError::HttpReturnedError),
            err_str: format!("HTTP {}", status),
            ..TaskError::default()
        })
    }
}

/// A `200` answer to a request that doesn't start at byte 0 carries the wrong bytes.
fn reject_ignored_range(status: StatusCode, range: Range, held: u64) -> Outcome {
    if status == StatusCode::OK && range.start() + held > 0 {
        return Err(TaskError {
            http_code: status.as_u16(),
            transport: Some(TransportError::RangeError),
            err_str: "server ignored the range request".into(),
            ..TaskError::default()
        });
    }
    Ok(())
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Total length from `Content-Range: bytes a-b/total` (or `bytes */total`).
fn content_range_total(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    value.rsplit_once('/')?.1.trim().parse().ok()
}

fn transport(kind: TransportError, message: &str) -> TaskError {
    TaskError {
        transport: Some(kind),
        err_str: message.to_string(),
        ..TaskError::default()
    }
}

fn reqwest_error(e: &reqwest::Error) -> TaskError {
    let kind = if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::CouldNotConnect
    } else {
        TransportError::RecvError
    };
    TaskError {
        http_code: e.status().map(|s| s.as_u16()).unwrap_or(0),
        transport: Some(kind),
        err_str: e.to_string(),
        ..TaskError::default()
    }
}

fn io_error(e: std::io::Error) -> TaskError {
    TaskError {
        transport: Some(TransportError::WriteError),
        file_errno: e.raw_os_error().unwrap_or(0),
        err_str: e.to_string(),
        ..TaskError::default()
    }
}
