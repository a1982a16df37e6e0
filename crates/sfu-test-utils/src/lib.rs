//! # SFU Test Utilities
//!
//! Shared test utilities for the Relay SFU service.
//!
//! This crate provides mock implementations and test fixtures for
//! isolated SFU testing without a real media engine or ffmpeg.
//!
//! ## Modules
//!
//! - `mock_engine` - Fault-injecting wrapper over the in-process engine
//! - `mock_encoder` - Scripted encoder launcher and processes
//! - `fixtures` - Capability sets, DTLS parameters, a wired [`TestSfu`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let sfu = TestSfu::start();
//!     sfu.create_source(&TestSource::new("cam1")).await;
//!
//!     let peer = sfu.connect_peer().await;
//!     let reply = peer
//!         .handle_text(r#"{"id":1,"method":"createConsumerTransport"}"#)
//!         .await;
//!     assert!(reply.ok);
//!
//!     sfu.shutdown().await;
//! }
//! ```

pub mod fixtures;
pub mod mock_encoder;
pub mod mock_engine;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_encoder::*;
pub use mock_engine::*;
