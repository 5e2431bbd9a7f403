//! Identity name codec. Names pass through untouched; useful for mounts that
//! only encrypt file contents and for testing the layers above the codec.

use super::{NameCodec, NameError};
use crate::crypto::Interface;

#[derive(Debug, Default)]
pub struct NullCodec;

impl NullCodec {
    pub fn current_interface() -> Interface {
        Interface::new("nameio/null", 1, 0, 0)
    }
}

impl NameCodec for NullCodec {
    fn interface(&self) -> Interface {
        Self::current_interface()
    }

    fn max_encoded_len(&self, plaintext_len: usize) -> usize {
        plaintext_len
    }

    fn max_decoded_len(&self, encoded_len: usize) -> usize {
        encoded_len
    }

    fn encode_name(&self, plaintext: &str, _iv: Option<&mut u64>) -> Result<String, NameError> {
        Ok(plaintext.to_owned())
    }

    fn decode_name(&self, encoded: &str, _iv: Option<&mut u64>) -> Result<String, NameError> {
        Ok(encoded.to_owned())
    }
}
