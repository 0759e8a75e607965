//! Message serialization for queues that move bytes.
//!
//! Every transport other than [`MemoryQueue`](crate::MemoryQueue) stores or
//! sends a message as the bytes produced by a [`Codec`]. Stream transports
//! terminate each encoded message with a separator byte, so an encoding must
//! never contain the separator it is used with.

use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default frame separator for stream transports.
pub const DEFAULT_SEPARATOR: u8 = b'\n';

/// Serialization or deserialization failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Binary encoding failed.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
    /// A text frame was not valid UTF-8.
    #[error("frame is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    /// A text frame did not parse into the message type.
    #[error("cannot parse `{text}`: {reason}")]
    Parse { text: String, reason: String },
    /// Failure reported by a user supplied serializer or deserializer.
    #[error("{0}")]
    Custom(String),
}

impl CodecError {
    /// Wraps an arbitrary error message.
    pub fn custom(msg: impl Display) -> Self {
        Self::Custom(msg.to_string())
    }
}

/// Serializer/deserializer pair for messages of type `T`.
///
/// `decode(encode(v)) == v` must hold for every value the application sends.
/// `decode` receives exactly the bytes of one message, without separator.
pub trait Codec<T>: Send + Sync {
    /// Appends the encoding of `value` to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be represented.
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Rebuilds a value from the bytes of one message.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoding.
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// A [`Codec`] assembled from two closures.
///
/// ```
/// use quay::codec::{Codec, FnCodec};
///
/// let codec = FnCodec::new(
///     |v: &u32, out: &mut Vec<u8>| {
///         out.extend_from_slice(v.to_string().as_bytes());
///         Ok::<_, quay::codec::CodecError>(())
///     },
///     |bytes: &[u8]| {
///         std::str::from_utf8(bytes)?
///             .parse::<u32>()
///             .map_err(quay::codec::CodecError::custom)
///     },
/// );
/// let mut buf = Vec::new();
/// codec.encode(&7, &mut buf).unwrap();
/// assert_eq!(codec.decode(&buf).unwrap(), 7);
/// ```
pub struct FnCodec<S, D> {
    serialize: S,
    deserialize: D,
}

impl<S, D> FnCodec<S, D> {
    /// Pairs a serializer with a deserializer.
    pub const fn new(serialize: S, deserialize: D) -> Self {
        Self {
            serialize,
            deserialize,
        }
    }
}

impl<T, S, D> Codec<T> for FnCodec<S, D>
where
    S: Fn(&T, &mut Vec<u8>) -> Result<(), CodecError> + Send + Sync,
    D: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync,
{
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CodecError> {
        (self.serialize)(value, out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        (self.deserialize)(bytes)
    }
}

/// Text encoding through `Display` and `FromStr`.
///
/// Surrounding whitespace (including a `\r` left by CRLF peers) is trimmed
/// before parsing.
pub struct TextCodec<T>(PhantomData<fn() -> T>);

impl<T> TextCodec<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for TextCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for TextCodec<T>
where
    T: Display + FromStr,
    T::Err: Display,
{
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CodecError> {
        use std::io::Write;
        write!(out, "{value}").map_err(CodecError::custom)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let text = std::str::from_utf8(bytes)?.trim();
        text.parse().map_err(|e: T::Err| CodecError::Parse {
            text: text.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Binary encoding through postcard, COBS-stuffed so it never contains `0x00`.
///
/// Use it with [`PostcardCodec::SEPARATOR`] on stream transports.
pub struct PostcardCodec<T>(PhantomData<fn() -> T>);

impl<T> PostcardCodec<T> {
    /// The only separator this encoding is guaranteed not to contain.
    pub const SEPARATOR: u8 = 0x00;

    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for PostcardCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for PostcardCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut stuffed = postcard::to_allocvec_cobs(value)?;
        // to_allocvec_cobs appends its own 0x00 sentinel; framing adds the separator.
        stuffed.pop();
        out.extend_from_slice(&stuffed);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let mut scratch = bytes.to_vec();
        Ok(postcard::from_bytes_cobs(&mut scratch)?)
    }
}
