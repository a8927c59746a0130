mod checksum;

pub use checksum::{file_digest, sha256_hex, sha256_reader, FileDigest};
