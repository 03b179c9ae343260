//! Crypto Module
//!
//! Authenticated encryption of stored payloads with key rotation.

mod keyring;

pub use keyring::{Keyring, NONCE_LENGTH};
