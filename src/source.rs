//! Byte sources for reading containers.
//!
//! Local files and HTTP urls expose the same capability: read an exact byte
//! range at an absolute offset. Readers and compilers are written against
//! [`RangeSource`] so the local and online paths share one code path.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::{blocking::Client, header::RANGE, StatusCode};

use crate::{error::TortillaError, utils::is_valid_url};

/// Connect/read timeout for all HTTP range traffic.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a metadata table was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Local,
    Online,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Online => "online",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TortillaError> {
        match value {
            "local" => Ok(Mode::Local),
            "online" => Ok(Mode::Online),
            other => Err(TortillaError::UnknownMode(other.to_string())),
        }
    }
}

pub trait RangeSource {
    /// Read exactly `len` bytes starting at absolute `offset`.
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, TortillaError>;

    /// The source string items point back at in their subfile locators
    /// (a plain path, or `/vsicurl/<url>`).
    fn locator(&self) -> String;

    fn mode(&self) -> Mode;
}

/// Open a location as the right source kind for it.
pub fn open_source(location: &str) -> Result<Box<dyn RangeSource>, TortillaError> {
    if is_valid_url(location) {
        Ok(Box::new(HttpRangeSource::new(location)?))
    } else {
        Ok(Box::new(LocalFile::open(location)?))
    }
}

pub struct LocalFile {
    path: PathBuf,
    file: File,
}

impl LocalFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TortillaError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self { path, file })
    }
}

impl RangeSource for LocalFile {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, TortillaError> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                TortillaError::Truncated("file ends before requested range")
            } else {
                TortillaError::Io(err)
            }
        })?;
        Ok(buf)
    }

    fn locator(&self) -> String {
        self.path.display().to_string()
    }

    fn mode(&self) -> Mode {
        Mode::Local
    }
}

pub struct HttpRangeSource {
    url: String,
    client: Client,
}

impl HttpRangeSource {
    pub fn new(url: impl Into<String>) -> Result<Self, TortillaError> {
        Ok(Self {
            url: url.into(),
            client: range_client()?,
        })
    }
}

/// Blocking client with the container's timeouts applied.
pub fn range_client() -> Result<Client, TortillaError> {
    Ok(Client::builder()
        .connect_timeout(HTTP_TIMEOUT)
        .timeout(HTTP_TIMEOUT)
        .build()?)
}

impl RangeSource for HttpRangeSource {
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, TortillaError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = offset + len as u64 - 1;
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(TortillaError::Http(format!(
                "{}: expected 206 Partial Content, got {}",
                self.url,
                response.status()
            )));
        }
        let body = response.bytes()?;
        if body.len() < len {
            return Err(TortillaError::Http(format!(
                "{}: short range response ({} of {len} bytes)",
                self.url,
                body.len()
            )));
        }
        Ok(body[..len].to_vec())
    }

    fn locator(&self) -> String {
        format!("/vsicurl/{}", self.url)
    }

    fn mode(&self) -> Mode {
        Mode::Online
    }
}
