//! Receiving multipart history uploads and storing them on disk
use std::path::{Path, PathBuf};

use async_std::io::WriteExt;
use bytes::Bytes;
use futures::{AsyncRead, AsyncReadExt, Stream};

use crate::{utils, LOG};

/// The multipart form field that carries history files
pub const FILES_FIELD: &str = "files";

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_files: usize,
    pub max_file_bytes: u64,
}

impl Limits {
    pub fn from_config() -> Self {
        Self {
            max_files: crate::CONFIG.max_upload_files,
            max_file_bytes: crate::CONFIG.max_upload_file_bytes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Maximum number of files is {0}")]
    TooManyFiles(usize),
    #[error("Maximum file size is {}MB", .0 / (1024 * 1024))]
    FileTooLarge(u64),
    #[error("Only .json files are allowed, got {0:?}")]
    NotJson(String),
    #[error("Unexpected form field {0:?}, files must be sent as \"files\"")]
    UnexpectedField(String),
    #[error("Please select at least one JSON file to upload")]
    NoFiles,
    #[error("Expected a multipart/form-data request")]
    NotMultipart,
    #[error("{0}")]
    Malformed(String),
    #[error("error storing upload: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// The short message returned as the response `error`
    pub fn title(&self) -> &'static str {
        match self {
            UploadError::TooManyFiles(_) => "Too many files",
            UploadError::FileTooLarge(_) => "File too large",
            UploadError::NoFiles => "No files received",
            UploadError::Io(_) => "Failed to store files",
            _ => "Upload failed",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            UploadError::Io(_) => 500,
            _ => 400,
        }
    }
}

/// A history file that has been written to the upload directory
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub original_name: String,
    pub path: PathBuf,
    pub size: u64,
}

fn is_json_name(name: &str) -> bool {
    name.to_lowercase().ends_with(".json")
}

/// Adapt an async reader (a request body) into the byte stream `multer` reads
pub fn body_stream<R>(reader: R) -> impl Stream<Item = std::io::Result<Bytes>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(Some(reader), |reader| async move {
        let mut reader = reader?;
        let mut buf = vec![0u8; 64 * 1024];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Read every file out of a multipart body and write it into `upload_dir`
/// as `<unix-millis>-<name>`. If anything is rejected, files already
/// written for this request are removed again.
pub async fn receive_files<S>(
    stream: S,
    boundary: &str,
    upload_dir: &Path,
    limits: Limits,
) -> Result<Vec<StoredFile>, UploadError>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    let mut stored = vec![];
    match receive_into(stream, boundary, upload_dir, limits, &mut stored).await {
        Ok(()) if stored.is_empty() => Err(UploadError::NoFiles),
        Ok(()) => Ok(stored),
        Err(e) => {
            let paths: Vec<PathBuf> = stored.into_iter().map(|f| f.path).collect();
            remove_files(&paths).await;
            Err(e)
        }
    }
}

async fn receive_into<S>(
    stream: S,
    boundary: &str,
    upload_dir: &Path,
    limits: Limits,
    stored: &mut Vec<StoredFile>,
) -> Result<(), UploadError>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    let constraints = multer::Constraints::new()
        .size_limit(multer::SizeLimit::new().per_field(limits.max_file_bytes));
    let mut multipart = multer::Multipart::with_constraints(stream, boundary, constraints);
    async_std::fs::create_dir_all(upload_dir).await?;

    while let Some(mut field) = multipart.next_field().await.map_err(|e| map_multer(e, limits))? {
        let field_name = field.name().unwrap_or_default().to_string();
        if field_name != FILES_FIELD {
            return Err(UploadError::UnexpectedField(field_name));
        }
        if stored.len() >= limits.max_files {
            return Err(UploadError::TooManyFiles(limits.max_files));
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        if !is_json_name(&original_name) {
            return Err(UploadError::NotJson(original_name));
        }
        slog::info!(
            LOG, "processing uploaded file";
            "field" => &field_name,
            "original_name" => &original_name,
            "content_type" => field.content_type().map(|m| m.to_string()),
        );

        let (path, mut file) = create_unique(upload_dir, &utils::sanitize_file_name(&original_name)).await?;
        // track it right away so a failure below still cleans it up
        stored.push(StoredFile {
            original_name,
            path,
            size: 0,
        });
        let mut size = 0u64;
        while let Some(chunk) = field.chunk().await.map_err(|e| map_multer(e, limits))? {
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        if let Some(last) = stored.last_mut() {
            last.size = size;
        }
    }
    Ok(())
}

/// Create `<unix-millis>-<name>` in `dir`, never replacing an existing file.
/// On a clash, `<unix-millis>-<n>-<name>` is tried instead.
async fn create_unique(dir: &Path, name: &str) -> std::io::Result<(PathBuf, async_std::fs::File)> {
    let millis = chrono::Utc::now().timestamp_millis();
    let mut attempt = 0u32;
    loop {
        let file_name = match attempt {
            0 => format!("{}-{}", millis, name),
            n => format!("{}-{}-{}", millis, n, name),
        };
        let path = dir.join(file_name);
        match async_std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 1000 => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

fn map_multer(e: multer::Error, limits: Limits) -> UploadError {
    match e {
        multer::Error::FieldSizeExceeded { .. } | multer::Error::StreamSizeExceeded { .. } => {
            UploadError::FileTooLarge(limits.max_file_bytes)
        }
        other => UploadError::Malformed(other.to_string()),
    }
}

/// Best-effort removal, failures are only logged
pub async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = async_std::fs::remove_file(path).await {
            slog::error!(
                LOG, "error deleting uploaded file";
                "path" => path.display().to_string(),
                "error" => e.to_string(),
            );
        }
    }
}

#[cfg(test)]
pub mod test_support {
    pub const BOUNDARY: &str = "----spotstatsboundary";

    /// Build a multipart body with one `files` part per (name, content)
    pub fn multipart_body(files: &[(&str, &str)]) -> Vec<u8> {
        let mut body = String::new();
        for (name, content) in files {
            body.push_str(&format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{n}\"\r\n\
                 Content-Type: application/json\r\n\r\n{c}\r\n",
                b = BOUNDARY,
                n = name,
                c = content
            ));
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));
        body.into_bytes()
    }
}
