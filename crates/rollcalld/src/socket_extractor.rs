//! Client for the external embedding service on a Unix socket.
//!
//! One connection per photo. Request: `u32` LE length, then the encoded
//! photo bytes. Response: `u32` LE length, then a JSON object tagged by
//! `status` (`ok`, `no_face`, `multiple_faces`, `error`).

use rollcall_core::{Embedding, EmbeddingExtractor, ExtractError, Photo};
use serde::Deserialize;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Ok {
        embedding: Vec<f32>,
        #[serde(default)]
        model_version: Option<String>,
    },
    NoFace,
    MultipleFaces {
        count: usize,
    },
    Error {
        message: String,
    },
}

pub struct SocketExtractor {
    socket_path: PathBuf,
    io_timeout: Duration,
}

impl SocketExtractor {
    pub fn new(socket_path: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            io_timeout,
        }
    }

    fn connect(&self) -> Result<UnixStream, ExtractError> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            ExtractError::Unavailable(format!(
                "cannot connect to {}: {e}",
                self.socket_path.display()
            ))
        })?;
        stream.set_read_timeout(Some(self.io_timeout)).map_err(io_err)?;
        stream.set_write_timeout(Some(self.io_timeout)).map_err(io_err)?;
        Ok(stream)
    }

    fn round_trip(&self, photo: &Photo) -> Result<Response, ExtractError> {
        let mut stream = self.connect()?;

        let bytes = photo.bytes();
        let len = u32::try_from(bytes.len())
            .map_err(|_| ExtractError::MalformedImage("photo exceeds 4 GiB".into()))?;
        stream.write_all(&len.to_le_bytes()).map_err(io_err)?;
        stream.write_all(bytes).map_err(io_err)?;
        stream.flush().map_err(io_err)?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).map_err(io_err)?;
        let response_len = u32::from_le_bytes(len_buf) as usize;
        if response_len > MAX_RESPONSE_BYTES {
            return Err(ExtractError::Unavailable(format!(
                "response too large: {response_len} bytes"
            )));
        }

        let mut response_buf = vec![0u8; response_len];
        stream.read_exact(&mut response_buf).map_err(io_err)?;

        serde_json::from_slice(&response_buf)
            .map_err(|e| ExtractError::Unavailable(format!("invalid response: {e}")))
    }
}

impl EmbeddingExtractor for SocketExtractor {
    fn extract(&mut self, photo: &Photo) -> Result<Embedding, ExtractError> {
        match self.round_trip(photo)? {
            Response::Ok {
                embedding,
                model_version,
            } => Ok(Embedding {
                values: embedding,
                model_version,
            }),
            Response::NoFace => Err(ExtractError::NoFaceDetected),
            Response::MultipleFaces { count } => Err(ExtractError::MultipleFacesDetected { count }),
            Response::Error { message } => Err(ExtractError::Unavailable(message)),
        }
    }
}

fn io_err(e: std::io::Error) -> ExtractError {
    ExtractError::Unavailable(e.to_string())
}
