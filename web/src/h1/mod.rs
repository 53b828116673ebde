//! http/1.1 request head decoding, response serialization and body streams.

pub(crate) mod body;
pub(crate) mod decode;
pub(crate) mod encode;

pub mod error;

pub use self::body::BodyReader;
