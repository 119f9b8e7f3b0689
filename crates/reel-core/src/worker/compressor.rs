//! Streaming compression performed on the worker thread
//!
//! Events are written into a single zlib stream as a JSON array: `[` when the
//! stream opens, each event prefixed by `,` after the first, and `]` when the
//! stream is finished. Every event is sync-flushed so that the compressed
//! output is always decodable up to the last added event.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Write};
use std::sync::mpsc::Receiver;
use tokio::sync::mpsc::UnboundedSender;

use super::{WorkerEvent, WorkerMethod, WorkerPayload, WorkerRequest, WorkerResponse};

pub struct Compressor {
    encoder: ZlibEncoder<Vec<u8>>,
    has_events: bool,
}

impl Compressor {
    pub fn new() -> io::Result<Self> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"[")?;
        Ok(Self {
            encoder,
            has_events: false,
        })
    }

    pub fn add_event(&mut self, data: &str) -> io::Result<()> {
        if self.has_events {
            self.encoder.write_all(b",")?;
        }
        self.encoder.write_all(data.as_bytes())?;
        self.encoder.flush()?;
        self.has_events = true;
        Ok(())
    }

    /// Close the array, return the compressed stream and start a new one
    pub fn finish(&mut self) -> io::Result<Vec<u8>> {
        self.encoder.write_all(b"]")?;
        let encoder = std::mem::replace(self, Self::new()?).encoder;
        encoder.finish()
    }

    pub fn clear(&mut self) -> io::Result<()> {
        *self = Self::new()?;
        Ok(())
    }
}

/// One-shot compression of a whole payload
pub fn compress(data: &str) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data.as_bytes())?;
    encoder.finish()
}

/// Worker thread main loop; ends when the request sender is dropped
pub(crate) fn run(requests: Receiver<WorkerRequest>, events: UnboundedSender<WorkerEvent>) {
    let mut compressor = match Compressor::new() {
        Ok(compressor) => compressor,
        Err(e) => {
            let _ = events.send(WorkerEvent::Error(e.to_string()));
            return;
        }
    };

    let ready = WorkerResponse {
        id: None,
        method: WorkerMethod::Init,
        success: true,
        response: WorkerPayload::Empty,
    };
    if events.send(WorkerEvent::Message(ready)).is_err() {
        return;
    }

    for request in requests {
        let result = handle(&mut compressor, &request);
        let response = match result {
            Ok(payload) => WorkerResponse {
                id: Some(request.id),
                method: request.method,
                success: true,
                response: payload,
            },
            Err(e) => WorkerResponse {
                id: Some(request.id),
                method: request.method,
                success: false,
                response: WorkerPayload::Error(e.to_string()),
            },
        };
        if events.send(WorkerEvent::Message(response)).is_err() {
            break;
        }
    }
}

fn handle(compressor: &mut Compressor, request: &WorkerRequest) -> io::Result<WorkerPayload> {
    match request.method {
        WorkerMethod::Init => Ok(WorkerPayload::Empty),
        WorkerMethod::AddEvent => {
            let data = request.arg.as_deref().ok_or_else(missing_arg)?;
            compressor.add_event(data)?;
            Ok(WorkerPayload::Empty)
        }
        WorkerMethod::Finish => compressor.finish().map(WorkerPayload::Bytes),
        WorkerMethod::Clear => {
            compressor.clear()?;
            Ok(WorkerPayload::Empty)
        }
        WorkerMethod::Compress => {
            let data = request.arg.as_deref().ok_or_else(missing_arg)?;
            compress(data).map(WorkerPayload::Bytes)
        }
    }
}

fn missing_arg() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "No data provided")
}

#[cfg(test)]
pub(crate) fn decompress(bytes: &[u8]) -> String {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stream_is_empty_array() {
        let mut compressor = Compressor::new().unwrap();
        let bytes = compressor.finish().unwrap();
        assert_eq!(decompress(&bytes), "[]");
    }

    #[test]
    fn test_events_are_joined_into_array() {
        let mut compressor = Compressor::new().unwrap();
        compressor.add_event(r#"{"a":1}"#).unwrap();
        compressor.add_event(r#"{"b":2}"#).unwrap();

        let bytes = compressor.finish().unwrap();
        assert_eq!(decompress(&bytes), r#"[{"a":1},{"b":2}]"#);

        // Stream restarts after finish
        compressor.add_event(r#"{"c":3}"#).unwrap();
        assert_eq!(decompress(&compressor.finish().unwrap()), r#"[{"c":3}]"#);
    }

    #[test]
    fn test_clear_discards_events() {
        let mut compressor = Compressor::new().unwrap();
        compressor.add_event(r#"{"a":1}"#).unwrap();
        compressor.clear().unwrap();
        compressor.add_event(r#"{"b":2}"#).unwrap();
        assert_eq!(decompress(&compressor.finish().unwrap()), r#"[{"b":2}]"#);
    }

    #[test]
    fn test_one_shot_compress() {
        let bytes = compress("hello hello hello").unwrap();
        assert_eq!(decompress(&bytes), "hello hello hello");
    }
}
