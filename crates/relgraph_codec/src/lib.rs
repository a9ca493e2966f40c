//! # relgraph codec
//!
//! Scalar values, entity identities and their CBOR encoding.
//!
//! This crate provides:
//! - [`Value`], the scalar type bound to and read from relational columns
//! - [`Identity`], the permanent or temporary key of one persisted entity
//! - Deterministic CBOR encoding for anything that crosses a process boundary
//!
//! ## Usage
//!
//! ```
//! use relgraph_codec::{Decode, Encode, Identity};
//!
//! let id = Identity::permanent("Exhibit", [("SEQ", 2i64), ("GALLERY_ID", 1i64)]);
//! let bytes = id.encode().unwrap();
//! assert_eq!(Identity::decode(&bytes).unwrap(), id);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod identity;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use identity::{Identity, IdentityKey, TempToken};
pub use value::Value;

/// Trait for types that can be encoded to CBOR.
pub trait Encode {
    /// Encode this value to CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded from CBOR.
pub trait Decode: Sized {
    /// Decode this value from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl<T: serde::Serialize> Encode for T {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl<T: serde::de::DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_value() {
        let value = Value::Text("hello world".to_string());
        let bytes = value.encode().unwrap();
        assert_eq!(Value::decode(&bytes).unwrap(), value);
    }
}
