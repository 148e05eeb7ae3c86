//! # Vellum Storage
//!
//! Storage backend trait and implementations for Vellum.
//!
//! This crate provides the lowest-level storage abstraction for Vellum.
//! Storage backends are **opaque byte stores** keyed by a logical
//! *location* string - they do not interpret the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte-range stores (read, write, delete, list, flush)
//! - No knowledge of collections, WAL entries or backup archives
//! - Must be `Send + Sync`; a single instance is shared as `Arc<dyn Backend>`
//! - Vellum core owns all format interpretation
//!
//! ## Available Backends
//!
//! - [`MemoryStorage`] - For testing and ephemeral storage
//! - [`FileStorage`] - One file per location under a root directory
//! - [`EncryptedBackend`] - Wrapper that adds authenticated encryption
//!
//! ## Example
//!
//! ```rust
//! use vellum_storage::{Backend, MemoryStorage};
//!
//! let backend = MemoryStorage::new();
//! backend.write("notes", 0, b"hello world").unwrap();
//! let data = backend.read("notes", 0, 5).unwrap();
//! assert_eq!(&data, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod cancel;
mod crypto;
mod encrypted;
mod error;
mod file;
mod memory;

pub use backend::Backend;
pub use cancel::CancellationToken;
pub use crypto::{
    AesGcmEncryption, EncryptionKey, EncryptionProvider, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
pub use encrypted::EncryptedBackend;
pub use error::{StorageError, StorageResult};
pub use file::{FileStorage, LARGE_IO_THRESHOLD};
pub use memory::MemoryStorage;
