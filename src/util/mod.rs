//! Utility functions shared by the storage, discovery and scheduling layers.
//!
//! - **Canonical URLs**: scheme/`www.`-insensitive identities and segment-aware prefix matching
//! - **URL validation**: security-focused validation before the HTTP oracle fetches anything
//!
//! # Examples
//!
//! ```
//! use feedprobe::util::{canonicalize, matches_root};
//!
//! let canonical = canonicalize("https://www.example.com/blog/post-1");
//! assert_eq!(canonical, "example.com/blog/post-1");
//! assert!(matches_root(&canonical, "example.com/blog"));
//! assert!(!matches_root("example.com/blogging", "example.com/blog"));
//! ```

mod canonical;
mod url_validator;

pub use canonical::{canonicalize, host_key, matches_root, root_display};
pub use url_validator::{validate_url, UrlValidationError};
