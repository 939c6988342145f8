//! Integrity checks for downloaded files.
//!
//! Everything here is a pure function of the file on disk: no shared state,
//! no network access. The checks are deliberately cheap to combine; the
//! download manager runs them in a fixed order through
//! [`FileValidator::validate`] and decides what to do with the file.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use super::constants::{
    CHUNK_SIZE, MAX_OVERSIZE_RATIO, MIN_COMPLETE_RATIO, SIGNATURE_HEADER_LEN,
    SMALL_MEDIA_THRESHOLD, TAIL_CHECK_LEN,
};
use super::task::ContentKind;

/// MP4 box types accepted as evidence of an ISO media container.
const MP4_MARKERS: [&[u8]; 4] = [b"ftyp", b"mdat", b"moov", b"moof"];

/// MPEG audio frame sync prefixes (MPEG-1, MPEG-2 and MPEG-2.5 layer III).
const MP3_FRAME_SYNCS: [[u8; 2]; 3] = [[0xFF, 0xFB], [0xFF, 0xF3], [0xFF, 0xF2]];

/// Windows `ERROR_SHARING_VIOLATION` / `ERROR_LOCK_VIOLATION`.
#[cfg(windows)]
const WINDOWS_LOCK_ERRORS: [i32; 2] = [32, 33];

/// Hash algorithm used for checksum validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    /// MD5 (32 hex digits), as published by the course scraper.
    Md5,
    /// SHA-256 (64 hex digits).
    #[default]
    Sha256,
    /// SHA-512 (128 hex digits).
    Sha512,
}

impl ChecksumAlgorithm {
    /// Infers the algorithm from the length of a hex digest.
    #[must_use]
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            32 => Some(Self::Md5),
            64 => Some(Self::Sha256),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Reason a file failed validation.
#[derive(Debug, Error)]
pub enum ValidationIssue {
    /// Nothing at the path.
    #[error("file does not exist")]
    Missing,

    /// Zero bytes on disk.
    #[error("file is empty")]
    Empty,

    /// A large media file lacks its container signature.
    #[error("{container} signature not found in file header")]
    BadSignature {
        /// Container that was expected, e.g. `MP4`.
        container: &'static str,
    },

    /// The file is well below the expected size.
    #[error("incomplete: {actual} of {expected} expected bytes")]
    Incomplete {
        /// Bytes on disk.
        actual: u64,
        /// Bytes announced by the server.
        expected: u64,
    },

    /// The digest does not match the expected value.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected hex digest.
        expected: String,
        /// Computed hex digest.
        actual: String,
    },

    /// The expected digest has a length no supported algorithm produces.
    #[error("unsupported checksum {expected:?}: expected 32, 64 or 128 hex digits")]
    UnsupportedChecksum {
        /// The digest as given.
        expected: String,
    },

    /// Reading the file failed part-way.
    #[error("unreadable: {source}")]
    Unreadable {
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl ValidationIssue {
    /// Whether the failure means another process holds the file, in which
    /// case the file must be left alone.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        match self {
            Self::Unreadable { source } => is_lock_error(source),
            _ => false,
        }
    }
}

/// Whether an IO error reports a file held by another process.
#[must_use]
pub fn is_lock_error(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy
    ) {
        return true;
    }
    #[cfg(windows)]
    if let Some(code) = error.raw_os_error() {
        return WINDOWS_LOCK_ERRORS.contains(&code);
    }
    false
}

/// Result of sniffing a media container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// Extension or content kind has no signature rule.
    NotApplicable,
    /// A known signature was found.
    Valid,
    /// No signature, but the file is small enough to be a fixture.
    SoftWarning,
    /// No signature on a large file.
    Invalid,
}

/// Outcome of comparing the actual size with the expected size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeVerdict {
    /// No expected size to compare with.
    Unknown,
    /// Within tolerance.
    Ok,
    /// Larger than 110% of expected; worth a warning only.
    Oversized {
        /// actual / expected.
        ratio: f64,
    },
    /// Below 95% of expected.
    Incomplete {
        /// actual / expected.
        ratio: f64,
    },
}

/// What the validation gate should check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationRequest<'a> {
    /// Content kind of the task.
    pub kind: ContentKind,
    /// Expected size, when known.
    pub expected_size: Option<u64>,
    /// Expected hex digest, when known.
    pub checksum: Option<&'a str>,
    /// Run the full gate. When false only existence and non-zero size are checked.
    pub thorough: bool,
}

/// A passed validation with its non-fatal findings.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// File size in bytes.
    pub size: u64,
    /// Soft warnings (unusual header on a small file, oversize).
    pub warnings: Vec<String>,
}

/// Stateless file integrity checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileValidator;

impl FileValidator {
    /// Computes the hex digest of a file using fixed-size streaming reads.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the file cannot be opened or read.
    pub fn checksum(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<String> {
        match algorithm {
            ChecksumAlgorithm::Md5 => digest_file::<Md5>(path),
            ChecksumAlgorithm::Sha256 => digest_file::<Sha256>(path),
            ChecksumAlgorithm::Sha512 => digest_file::<Sha512>(path),
        }
    }

    /// Whether the file's digest equals `expected`, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the file cannot be read.
    pub fn checksum_matches(
        path: &Path,
        expected: &str,
        algorithm: ChecksumAlgorithm,
    ) -> io::Result<bool> {
        let actual = Self::checksum(path, algorithm)?;
        Ok(actual.eq_ignore_ascii_case(expected.trim()))
    }

    /// Compares a file's digest with `expected` (case-insensitive). The
    /// algorithm is inferred from the digest length.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationIssue::UnsupportedChecksum`] when the length
    /// matches no algorithm, [`ValidationIssue::ChecksumMismatch`] or
    /// [`ValidationIssue::Unreadable`].
    pub fn verify_checksum(path: &Path, expected: &str) -> Result<(), ValidationIssue> {
        let expected = expected.trim().to_ascii_lowercase();
        let algorithm = ChecksumAlgorithm::from_hex_len(expected.len())
            .filter(|_| expected.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| ValidationIssue::UnsupportedChecksum {
                expected: expected.clone(),
            })?;
        let actual = Self::checksum(path, algorithm)
            .map_err(|source| ValidationIssue::Unreadable { source })?;
        if actual == expected {
            Ok(())
        } else {
            Err(ValidationIssue::ChecksumMismatch { expected, actual })
        }
    }

    /// Exact size comparison; trivially true without an expectation.
    #[must_use]
    pub fn size_matches(path: &Path, expected: Option<u64>) -> bool {
        let Some(expected) = expected else {
            return true;
        };
        std::fs::metadata(path).is_ok_and(|meta| meta.len() == expected)
    }

    /// Classifies `actual` against `expected` using the 95% / 110% bounds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn size_ratio_verdict(actual: u64, expected: Option<u64>) -> SizeVerdict {
        let Some(expected) = expected.filter(|&expected| expected > 0) else {
            return SizeVerdict::Unknown;
        };
        let ratio = actual as f64 / expected as f64;
        if ratio < MIN_COMPLETE_RATIO {
            SizeVerdict::Incomplete { ratio }
        } else if ratio > MAX_OVERSIZE_RATIO {
            SizeVerdict::Oversized { ratio }
        } else {
            SizeVerdict::Ok
        }
    }

    /// Looks for a container signature in `.mp4` and `.mp3` files.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the header cannot be read.
    pub fn sniff_media_signature(path: &Path, kind: ContentKind) -> io::Result<SignatureCheck> {
        let Some(container) = media_container(path, kind) else {
            return Ok(SignatureCheck::NotApplicable);
        };

        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut header = Vec::with_capacity(SIGNATURE_HEADER_LEN);
        file.by_ref()
            .take(SIGNATURE_HEADER_LEN as u64)
            .read_to_end(&mut header)?;

        let recognized = match container {
            MediaContainer::Mp4 => has_mp4_marker(&header),
            MediaContainer::Mp3 => has_mp3_header(&header),
        };

        Ok(if recognized {
            SignatureCheck::Valid
        } else if size < SMALL_MEDIA_THRESHOLD {
            SignatureCheck::SoftWarning
        } else {
            SignatureCheck::Invalid
        })
    }

    /// Reads the last 1 KiB (or the whole file when smaller) to detect
    /// truncation that leaves the header intact.
    ///
    /// # Errors
    ///
    /// Returns the IO error from seeking or reading.
    pub fn tail_readable(path: &Path) -> io::Result<()> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let tail_len = size.min(TAIL_CHECK_LEN);
        file.seek(SeekFrom::Start(size - tail_len))?;
        let mut tail = Vec::with_capacity(usize::try_from(tail_len).unwrap_or(0));
        file.read_to_end(&mut tail)?;
        if (tail.len() as u64) < tail_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("tail check read {} of {tail_len} bytes", tail.len()),
            ));
        }
        Ok(())
    }

    /// Reads the whole file sequentially, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns the first IO error encountered.
    pub fn full_read(path: &Path) -> io::Result<u64> {
        let mut reader = BufReader::with_capacity(CHUNK_SIZE * 8, File::open(path)?);
        io::copy(&mut reader, &mut io::sink())
    }

    /// Runs the validation gate, short-circuiting on the first failure.
    ///
    /// Order: existence, non-zero size, then (when `thorough`) media
    /// signature, size ratio, checksum, tail check and a full read.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationIssue`] found.
    pub fn validate(
        path: &Path,
        request: &ValidationRequest<'_>,
    ) -> Result<ValidationReport, ValidationIssue> {
        let unreadable = |source: io::Error| ValidationIssue::Unreadable { source };

        let size = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(ValidationIssue::Missing),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(ValidationIssue::Missing);
            }
            Err(error) => return Err(unreadable(error)),
        };
        if size == 0 {
            return Err(ValidationIssue::Empty);
        }

        let mut report = ValidationReport {
            size,
            warnings: Vec::new(),
        };
        if !request.thorough {
            return Ok(report);
        }

        match Self::sniff_media_signature(path, request.kind).map_err(unreadable)? {
            SignatureCheck::NotApplicable | SignatureCheck::Valid => {}
            SignatureCheck::SoftWarning => report
                .warnings
                .push("unusual media header; allowed because the file is small".to_string()),
            SignatureCheck::Invalid => {
                let container = media_container(path, request.kind)
                    .map_or("media", MediaContainer::label);
                return Err(ValidationIssue::BadSignature { container });
            }
        }

        match Self::size_ratio_verdict(size, request.expected_size) {
            SizeVerdict::Unknown | SizeVerdict::Ok => {}
            SizeVerdict::Oversized { ratio } => report.warnings.push(format!(
                "file is {:.1}% of the expected size",
                ratio * 100.0
            )),
            SizeVerdict::Incomplete { .. } => {
                return Err(ValidationIssue::Incomplete {
                    actual: size,
                    expected: request.expected_size.unwrap_or_default(),
                });
            }
        }

        if let Some(expected) = request.checksum {
            Self::verify_checksum(path, expected)?;
        }

        Self::tail_readable(path).map_err(unreadable)?;
        let read = Self::full_read(path).map_err(unreadable)?;
        if read < size {
            return Err(unreadable(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {read} of {size} bytes"),
            )));
        }

        Ok(report)
    }
}

#[derive(Debug, Clone, Copy)]
enum MediaContainer {
    Mp4,
    Mp3,
}

impl MediaContainer {
    fn label(self) -> &'static str {
        match self {
            Self::Mp4 => "MP4",
            Self::Mp3 => "MP3",
        }
    }
}

fn media_container(path: &Path, kind: ContentKind) -> Option<MediaContainer> {
    if !kind.is_media() {
        return None;
    }
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "mp4" => Some(MediaContainer::Mp4),
        "mp3" => Some(MediaContainer::Mp3),
        _ => None,
    }
}

fn has_mp4_marker(header: &[u8]) -> bool {
    MP4_MARKERS
        .iter()
        .any(|marker| header.windows(marker.len()).any(|window| window == *marker))
}

fn has_mp3_header(header: &[u8]) -> bool {
    header.starts_with(b"ID3") || MP3_FRAME_SYNCS.iter().any(|sync| header.starts_with(sync))
}

fn digest_file<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}
