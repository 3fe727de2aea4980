/*
 * SHA-256 helpers used by the filesystem backend to tell whether a target that blocks a
 * write already holds the same bytes as its source, so skip reports can distinguish a
 * harmless re-run from a genuine collision.
 */
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/*
 * Calculates the SHA256 checksum of a file as a hex string, reading it in 4 KiB chunks.
 * Fails with `InvalidInput` when the path is not a regular file.
 */
pub fn calculate_sha256_checksum(file_path: &Path) -> io::Result<String> {
    if !file_path.is_file() {
        let err_msg = format!("Path {file_path:?} is not a file, cannot calculate checksum.");
        log::warn!("ChecksumUtils: {err_msg}");
        return Err(io::Error::new(io::ErrorKind::InvalidInput, err_msg));
    }

    let mut reader = BufReader::new(File::open(file_path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0; 1024 * 4];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let hex_checksum = format!("{:x}", hasher.finalize());
    log::trace!("ChecksumUtils: Checksum {hex_checksum} for {file_path:?}");
    Ok(hex_checksum)
}

/// True when both files exist with equal length and equal SHA-256 digests.
pub fn files_identical(first: &Path, second: &Path) -> io::Result<bool> {
    if first.metadata()?.len() != second.metadata()?.len() {
        return Ok(false);
    }
    Ok(calculate_sha256_checksum(first)? == calculate_sha256_checksum(second)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            calculate_sha256_checksum(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let err = calculate_sha256_checksum(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_files_identical() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.cnv");
        let b = dir.path().join("b.cnv");
        let c = dir.path().join("c.cnv");
        fs::write(&a, b"* Sea-Bird SBE 9").unwrap();
        fs::write(&b, b"* Sea-Bird SBE 9").unwrap();
        fs::write(&c, b"* Sea-Bird SBE 8").unwrap();
        assert!(files_identical(&a, &b).unwrap());
        assert!(!files_identical(&a, &c).unwrap());
        assert!(files_identical(&a, &dir.path().join("missing")).is_err());
    }
}
