//! Session Directory implementations.
//!
//! | Feature          | Types                     |
//! |------------------|---------------------------|
//! | `directory-http` | [`HttpSessionDirectory`]  |

#[cfg(feature = "directory-http")]
pub mod http;

#[cfg(feature = "directory-http")]
pub use http::HttpSessionDirectory;
