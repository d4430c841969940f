//! Serialization of the opaque value blobs the wire protocol carries.
//!
//! Connection properties, statement parameters, resource-call parameter
//! lists and return values all travel as postcard-encoded byte blobs whose
//! shape is chosen by the caller.

use serde::{Serialize, de::DeserializeOwned};
use snafu::ResultExt;

use crate::error::{CodecSnafu, Result};

/// Encodes a value to bytes.
///
/// # Errors
///
/// Returns [`DriverError::Codec`](crate::DriverError::Codec) if
/// serialization fails.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).context(CodecSnafu)
}

/// Decodes bytes into a value of the caller-chosen type.
///
/// # Errors
///
/// Returns [`DriverError::Codec`](crate::DriverError::Codec) if
/// deserialization fails.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).context(CodecSnafu)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn roundtrip_primitives() {
        let bytes = encode(&42u64).unwrap();
        assert_eq!(decode::<u64>(&bytes).unwrap(), 42);

        let bytes = encode("hello").unwrap();
        assert_eq!(decode::<String>(&bytes).unwrap(), "hello");

        let bytes = encode(&true).unwrap();
        assert!(decode::<bool>(&bytes).unwrap());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Params {
        values: Vec<String>,
        fetch_size: Option<u32>,
    }

    #[test]
    fn roundtrip_struct() {
        let original = Params { values: vec!["a".into(), "b".into()], fetch_size: Some(100) };
        let bytes = encode(&original).unwrap();
        assert_eq!(decode::<Params>(&bytes).unwrap(), original);
    }

    #[test]
    fn decode_of_garbage_fails() {
        let result = decode::<Params>(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn unit_encodes_to_empty() {
        let bytes = encode(&()).unwrap();
        assert!(bytes.is_empty());
    }
}
