//! Bencode encoding and decoding (BEP-0003 wire format).
//!
//! The decoder is written for untrusted UDP input: it never panics, never
//! recurses past [`MAX_DEPTH`](bencode::MAX_DEPTH), and tolerates trailing
//! bytes after the top-level value. Encoding is canonical, with dictionary
//! keys in lexicographic order.

pub mod bencode;

pub use bencode::{Bencode, BencodeBuilder, BencodeDict, BencodeError, Encode};
