//! Record decoders
//!
//! A [`RecordDecoder`] is bound to one open byte stream and turns it into
//! records, one per call. Decoders hold per-connection state (the buffered
//! reader, partial frames) and are never reused: the connector asks the
//! [`DecoderFactory`] for a fresh one on every establishment.
//!
//! # Frame format
//! ```text
//! [length: u32 big-endian][body: length bytes of JSON]
//! ```

use std::marker::PhantomData;

use async_trait::async_trait;
use feed_types::record::LiveRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, BufReader};

use crate::error::DecodeError;
use crate::source::ByteStream;

/// Frames above this size are treated as corruption.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Pulls records off one open byte stream.
#[async_trait]
pub trait RecordDecoder<T>: Send {
    /// Decode the next record. `Ok(None)` is end-of-stream.
    async fn read_record(&mut self) -> Result<Option<T>, DecodeError>;
}

/// Builds a decoder for each new connection.
pub trait DecoderFactory<T>: Send + Sync {
    fn new_decoder(&self, stream: ByteStream) -> Box<dyn RecordDecoder<T>>;
}

/// Encode a record as one length-prefixed JSON frame.
pub fn encode_frame<T: Serialize>(record: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(record)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decoder for length-prefixed JSON frames.
pub struct LengthPrefixedJsonDecoder<T> {
    reader: BufReader<ByteStream>,
    max_frame_len: usize,
    frames_read: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T> LengthPrefixedJsonDecoder<T> {
    pub fn new(stream: ByteStream, max_frame_len: usize) -> Self {
        Self {
            reader: BufReader::new(stream),
            max_frame_len,
            frames_read: 0,
            _record: PhantomData,
        }
    }

    /// Frames consumed from the stream so far, including rejected ones.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Fill `buf` completely. Returns how many bytes were read before EOF.
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize, DecodeError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[async_trait]
impl<T> RecordDecoder<T> for LengthPrefixedJsonDecoder<T>
where
    T: LiveRecord + DeserializeOwned,
{
    async fn read_record(&mut self) -> Result<Option<T>, DecodeError> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        let got = self.fill(&mut prefix).await?;
        if got == 0 {
            return Ok(None);
        }
        if got < LENGTH_PREFIX {
            return Err(DecodeError::Truncated {
                expected: LENGTH_PREFIX,
                actual: got,
            });
        }

        let length = u32::from_be_bytes(prefix) as usize;
        if length > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                length,
                limit: self.max_frame_len,
            });
        }

        let mut body = vec![0u8; length];
        let got = self.fill(&mut body).await?;
        if got < length {
            return Err(DecodeError::Truncated {
                expected: length,
                actual: got,
            });
        }
        self.frames_read += 1;

        // The frame is fully consumed from here on, so payload errors
        // leave the stream aligned on the next frame.
        let record: T =
            serde_json::from_slice(&body).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        record.validate()?;
        Ok(Some(record))
    }
}

/// Factory for [`LengthPrefixedJsonDecoder`].
pub struct LengthPrefixedJsonFactory<T> {
    max_frame_len: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T> LengthPrefixedJsonFactory<T> {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            _record: PhantomData,
        }
    }
}

impl<T> Default for LengthPrefixedJsonFactory<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl<T> DecoderFactory<T> for LengthPrefixedJsonFactory<T>
where
    T: LiveRecord + DeserializeOwned,
{
    fn new_decoder(&self, stream: ByteStream) -> Box<dyn RecordDecoder<T>> {
        Box::new(LengthPrefixedJsonDecoder::new(stream, self.max_frame_len))
    }
}
