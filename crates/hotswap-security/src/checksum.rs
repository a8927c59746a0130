use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Size and content hash of a file, compared after every copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
}

impl FileDigest {
    /// Describes the first difference, size before content.
    pub fn mismatch(&self, expected: &FileDigest) -> Option<String> {
        if self.size != expected.size {
            return Some(format!(
                "size mismatch: expected {} bytes, found {}",
                expected.size, self.size
            ));
        }
        if !self.sha256.eq_ignore_ascii_case(&expected.sha256) {
            return Some(format!(
                "sha256 mismatch: expected {}, found {}",
                expected.sha256, self.sha256
            ));
        }
        None
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn file_digest(path: &Path) -> io::Result<FileDigest> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let sha256 = sha256_reader(file)?;
    Ok(FileDigest { size, sha256 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn reader_and_slice_digests_agree() {
        let payload = vec![7_u8; 200 * 1024];
        let from_reader = sha256_reader(payload.as_slice()).expect("reader digest");
        assert_eq!(from_reader, sha256_hex(&payload));
    }

    #[test]
    fn digest_mismatch_reports_size_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let short = dir.path().join("short");
        let long = dir.path().join("long");
        fs::write(&short, b"v1").expect("write short");
        fs::write(&long, b"v2-longer").expect("write long");

        let short_digest = file_digest(&short).expect("digest");
        let long_digest = file_digest(&long).expect("digest");
        let mismatch = short_digest
            .mismatch(&long_digest)
            .expect("digests must differ");
        assert!(mismatch.starts_with("size mismatch"));
    }

    #[test]
    fn digest_mismatch_detects_same_size_content_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let left = dir.path().join("left");
        let right = dir.path().join("right");
        fs::write(&left, b"v1").expect("write left");
        fs::write(&right, b"v2").expect("write right");

        let mismatch = file_digest(&left)
            .expect("digest")
            .mismatch(&file_digest(&right).expect("digest"))
            .expect("digests must differ");
        assert!(mismatch.starts_with("sha256 mismatch"));
        assert_eq!(
            file_digest(&left)
                .expect("digest")
                .mismatch(&file_digest(&left).expect("digest")),
            None
        );
    }

    #[test]
    fn digest_of_missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = file_digest(&dir.path().join("missing")).expect_err("missing file");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
