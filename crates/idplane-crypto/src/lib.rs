//! Authenticated encryption for control-plane secrets.
//!
//! # Purpose
//! Seals small secrets (SMTP passwords, database DSNs, client secrets) with
//! AES-256-GCM under a process-wide master key, and wraps stored signing keys
//! under a separate signing master key.
//!
//! # Key invariants
//! - Keys are exactly 32 bytes; nonces are 96 bits and random per message.
//! - Sealed strings are encoded as `base64(nonce)|base64(ciphertext+tag)`.
//! - Any modification of nonce, ciphertext or tag fails with
//!   [`CryptoError::AuthFailed`].
//!
//! # How to use
//! Call [`secretbox::init_from_env`] once at start-up, then use
//! [`secretbox::encrypt`] / [`secretbox::decrypt`]. Tests reset the global key
//! with [`secretbox::reset_for_tests`].
mod error;
mod key;
pub mod secretbox;
pub mod signing;

pub use error::{CryptoError, CryptoResult};
pub use key::{KEY_LEN, MasterKey, NONCE_LEN, parse_key};
pub use signing::SigningMasterKey;
