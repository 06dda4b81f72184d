//! HTTP/2 with full fingerprint control.
//!
//! The `h2` ecosystem crate hardcodes its SETTINGS emission and pseudo-
//! header order; this implementation keeps both under the fingerprint's
//! control, which is the whole point of the exercise: the SETTINGS frame,
//! the connection-level WINDOW_UPDATE, the PRIORITY preface, and the
//! pseudo-header permutation are all observable parts of the Akamai
//! HTTP/2 fingerprint.

pub mod connection;
pub mod frame;
pub mod hpack;

pub use connection::H2Connection;
pub use frame::{SettingsFrame, CONNECTION_PREFACE};
pub use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder, RequestEncoder};
