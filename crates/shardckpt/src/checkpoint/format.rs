//! Artifact file format.
//!
//! Each `.bin` artifact is a fixed header followed by a bincode payload:
//!
//! | bytes   | field                                   |
//! |---------|-----------------------------------------|
//! | 0-3     | magic `SCKP`                            |
//! | 4-7     | format version (u32 LE)                 |
//! | 8       | entity tag (1 = model, 2 = optimizer)   |
//! | 9-16    | progress marker (u64 LE)                |
//! | 17-20   | CRC32 of the payload (u32 LE)           |
//! | 21-28   | payload length (u64 LE)                 |
//! | 29..    | payload                                 |
//!
//! Decoding reads from a stream and reports truncation, trailing bytes,
//! checksum mismatches and entity mismatches before touching the payload.

use super::instruction::EntityKind;
use crate::runtime::OptimizerState;
use crate::state::StateDict;
use crate::RestoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"SCKP";

/// Current format version. Increment when the header or payload encoding changes.
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 29;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Truncated artifact: {section} ends after {read} of {expected} bytes")]
    Truncated {
        section: &'static str,
        read: u64,
        expected: u64,
    },
    #[error("Invalid magic bytes: expected {expected:?}, found {found:?}")]
    InvalidMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("Unsupported format version: found {found}, supported up to {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("Unknown entity tag {0}")]
    UnknownEntity(u8),
    #[error("Entity mismatch: expected {expected} artifact, found {found}")]
    EntityMismatch {
        expected: EntityKind,
        found: EntityKind,
    },
    #[error("Length mismatch: declared {declared} payload bytes but found trailing data")]
    LengthMismatch { declared: u64 },
    #[error("Checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Payload codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Decoded artifact header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub version: u32,
    pub entity: EntityKind,
    pub marker: u64,
    pub checksum: u32,
    pub payload_len: u64,
}

impl ArtifactHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8] = self.entity.tag();
        out[9..17].copy_from_slice(&self.marker.to_le_bytes());
        out[17..21].copy_from_slice(&self.checksum.to_le_bytes());
        out[21..29].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self, ArtifactError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if &magic != MAGIC {
            return Err(ArtifactError::InvalidMagic {
                expected: *MAGIC,
                found: magic,
            });
        }

        let version = u32::from_le_bytes(le_array(&bytes[4..8]));
        if version == 0 || version > FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }

        let entity = EntityKind::from_tag(bytes[8]).ok_or(ArtifactError::UnknownEntity(bytes[8]))?;

        Ok(Self {
            version,
            entity,
            marker: u64::from_le_bytes(le_array(&bytes[9..17])),
            checksum: u32::from_le_bytes(le_array(&bytes[17..21])),
            payload_len: u64::from_le_bytes(le_array(&bytes[21..29])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Encode `value` as an artifact into `writer`. Returns the bytes written.
pub fn encode<W: Write, T: Serialize>(
    writer: &mut W,
    entity: EntityKind,
    marker: u64,
    value: &T,
) -> Result<u64, ArtifactError> {
    let payload = bincode::serialize(value)?;
    let header = ArtifactHeader {
        version: FORMAT_VERSION,
        entity,
        marker,
        checksum: crc32fast::hash(&payload),
        payload_len: payload.len() as u64,
    };

    writer.write_all(&header.to_bytes())?;
    writer.write_all(&payload)?;
    Ok((HEADER_SIZE + payload.len()) as u64)
}

/// Read and validate the header only.
pub fn read_header<R: Read>(reader: &mut R) -> Result<ArtifactHeader, ArtifactError> {
    let mut bytes = [0u8; HEADER_SIZE];
    let read = read_fully(reader, &mut bytes)?;
    if read < HEADER_SIZE {
        return Err(ArtifactError::Truncated {
            section: "header",
            read: read as u64,
            expected: HEADER_SIZE as u64,
        });
    }
    ArtifactHeader::from_bytes(&bytes)
}

/// Read the payload that follows `header`, verifying length and checksum.
fn read_payload<R: Read>(reader: &mut R, header: &ArtifactHeader) -> Result<Vec<u8>, ArtifactError> {
    let mut payload = Vec::new();
    let read = reader
        .by_ref()
        .take(header.payload_len)
        .read_to_end(&mut payload)? as u64;
    if read < header.payload_len {
        return Err(ArtifactError::Truncated {
            section: "payload",
            read,
            expected: header.payload_len,
        });
    }

    let mut probe = [0u8; 1];
    if read_fully(reader, &mut probe)? > 0 {
        return Err(ArtifactError::LengthMismatch {
            declared: header.payload_len,
        });
    }

    let computed = crc32fast::hash(&payload);
    if computed != header.checksum {
        return Err(ArtifactError::ChecksumMismatch {
            stored: header.checksum,
            computed,
        });
    }

    Ok(payload)
}

/// Decode an artifact of the `expected` entity from `reader`.
pub fn decode<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    expected: EntityKind,
) -> Result<(ArtifactHeader, T), ArtifactError> {
    let header = read_header(reader)?;
    if header.entity != expected {
        return Err(ArtifactError::EntityMismatch {
            expected,
            found: header.entity,
        });
    }
    let payload = read_payload(reader, &header)?;
    Ok((header, bincode::deserialize(&payload)?))
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Durably write an artifact: encode into `<path>.tmp`, fsync, then rename
/// over `path`.
pub fn write_artifact<T: Serialize>(
    path: &Path,
    entity: EntityKind,
    marker: u64,
    value: &T,
) -> io::Result<u64> {
    let tmp = tmp_path(path);
    let result = (|| -> io::Result<u64> {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        let written = encode(&mut writer, entity, marker, value).map_err(|e| match e {
            ArtifactError::Io(io) => io,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(written)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn open(path: &Path) -> Result<BufReader<File>, RestoreError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            RestoreError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            RestoreError::Unreadable {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })
}

/// Read an artifact of the `expected` entity from disk.
pub fn read_artifact<T: DeserializeOwned>(
    path: &Path,
    expected: EntityKind,
) -> Result<(ArtifactHeader, T), RestoreError> {
    let mut reader = open(path)?;
    decode(&mut reader, expected).map_err(|source| RestoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Decoded artifact body of either entity.
#[derive(Clone, Debug)]
pub enum ArtifactBody {
    Model(StateDict),
    Optimizer(OptimizerState),
}

/// Read an artifact whatever its entity, for inspection tools.
pub fn read_any(path: &Path) -> Result<(ArtifactHeader, ArtifactBody), RestoreError> {
    let mut reader = open(path)?;
    let corrupt = |source: ArtifactError| RestoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    };

    let header = read_header(&mut reader).map_err(corrupt)?;
    let payload = read_payload(&mut reader, &header).map_err(corrupt)?;
    let body = match header.entity {
        EntityKind::Model => {
            ArtifactBody::Model(bincode::deserialize(&payload).map_err(|e| corrupt(e.into()))?)
        }
        EntityKind::Optimizer => {
            ArtifactBody::Optimizer(bincode::deserialize(&payload).map_err(|e| corrupt(e.into()))?)
        }
    };
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn state() -> StateDict {
        let mut s = StateDict::new();
        s.insert(
            "w".into(),
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.5, -0.0, f32::MIN_POSITIVE, 7.0])
                .unwrap(),
        );
        s
    }

    fn encoded() -> Vec<u8> {
        let mut buf = Vec::new();
        encode(&mut buf, EntityKind::Model, 99, &state()).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode() {
        let bytes = encoded();
        let (header, decoded): (_, StateDict) =
            decode(&mut Cursor::new(&bytes), EntityKind::Model).unwrap();
        assert_eq!(header.marker, 99);
        assert_eq!(header.version, FORMAT_VERSION);
        assert_eq!(header.payload_len as usize, bytes.len() - HEADER_SIZE);
        assert_eq!(decoded, state());
    }

    #[test]
    fn test_detects_truncation() {
        let bytes = encoded();

        let err = decode::<_, StateDict>(&mut Cursor::new(&bytes[..10]), EntityKind::Model)
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Truncated { section: "header", .. }));

        let err = decode::<_, StateDict>(
            &mut Cursor::new(&bytes[..bytes.len() - 3]),
            EntityKind::Model,
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::Truncated { section: "payload", .. }));
    }

    #[test]
    fn test_detects_corruption() {
        let mut bytes = encoded();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = decode::<_, StateDict>(&mut Cursor::new(&bytes), EntityKind::Model).unwrap_err();
        assert!(matches!(err, ArtifactError::ChecksumMismatch { .. }));

        let mut bytes = encoded();
        bytes.push(0);
        let err = decode::<_, StateDict>(&mut Cursor::new(&bytes), EntityKind::Model).unwrap_err();
        assert!(matches!(err, ArtifactError::LengthMismatch { .. }));

        let mut bytes = encoded();
        bytes[0] = b'X';
        let err = decode::<_, StateDict>(&mut Cursor::new(&bytes), EntityKind::Model).unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidMagic { .. }));

        let mut bytes = encoded();
        bytes[4] = 9;
        let err = decode::<_, StateDict>(&mut Cursor::new(&bytes), EntityKind::Model).unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedVersion { found: 9, .. }));
    }

    #[test]
    fn test_detects_entity_mismatch() {
        let err = decode::<_, StateDict>(&mut Cursor::new(&encoded()), EntityKind::Optimizer)
            .unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::EntityMismatch {
                expected: EntityKind::Optimizer,
                found: EntityKind::Model
            }
        ));
    }

    #[test]
    fn test_write_and_read_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eid_x-model-num_samples_100.bin");

        let written = write_artifact(&path, EntityKind::Model, 99, &state()).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), written);
        assert!(!tmp_path(&path).exists());

        let (_, loaded): (_, StateDict) = read_artifact(&path, EntityKind::Model).unwrap();
        assert_eq!(loaded, state());

        let (header, body) = read_any(&path).unwrap();
        assert_eq!(header.entity, EntityKind::Model);
        assert!(matches!(body, ArtifactBody::Model(s) if s == state()));
    }

    #[test]
    fn test_read_missing_artifact() {
        let dir = tempdir().unwrap();
        let err = read_artifact::<StateDict>(&dir.path().join("nope.bin"), EntityKind::Model)
            .unwrap_err();
        assert!(matches!(err, RestoreError::Missing { .. }));
    }
}
