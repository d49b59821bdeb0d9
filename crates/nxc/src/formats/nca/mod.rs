pub mod bktr;
mod contents;
mod crypt_storage;
pub mod filesystem;
pub mod structs;
mod verification_storage;

use binrw::BinRead;
use snafu::{ResultExt, Snafu};
use std::io::Cursor;

use crate::crypto::keyset::KeySet;
use crate::crypto::pki::{SignatureStatus, TrustAnchors};
use crate::crypto::{AesKey, AesXtsKey, TitleKey};
use crate::formats::nca::bktr::BktrError;
use crate::formats::nca::structs::{NcaFsHeader, NcaHeader, NcaMagic};
use crate::formats::pfs::PfsParseError;
use crate::formats::romfs::RomFsParseError;
use crate::ids::RightsId;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorageError, StorageError,
};

pub use contents::{
    DecryptedSectionStorage, PatchedSectionFileSystem, PatchedSectionStorage, RawSectionStorage,
    SectionFileSystem, VerifiedSectionStorage,
};
pub use crypt_storage::NcaCryptStorage;
pub use structs::{
    DistributionType, NcaContentType, NcaEncryptionType, NcaFormatType, NcaHashType,
    MEDIA_UNIT_SIZE,
};
pub use verification_storage::{IntegrityCheckLevel, NcaVerificationStorage};

#[derive(Snafu, Debug)]
pub enum NcaError {
    /// NCA: Failed to read from the storage
    Storage { source: StorageError },
    /// NCA: Missing key {key_name} (generation {generation})
    MissingKey { key_name: String, generation: u8 },
    /// NCA: Missing title key for rights id {rights_id}
    MissingTitleKey { rights_id: RightsId },
    /// NCA: Bad magic; not an NCA, or the wrong header key
    BadMagic,
    /// NCA: {version:?} is not supported
    UnsupportedVersion { version: NcaMagic },
    /// NCA: Failed to parse the NCA header
    NcaHeaderParsing { source: binrw::Error },
    /// NCA: Failed to parse the NCA FS header for section {index}
    FsHeaderParsing { index: usize, source: binrw::Error },
    /// NCA: Invalid size: expected {expected}, got {actual}
    StorageSizeMismatch { expected: u64, actual: u64 },
    /// NCA: Section {index} has an invalid layout
    SectionLayout {
        index: usize,
        source: SliceStorageError,
    },
    /// NCA: Section {index} carries invalid integrity info
    InvalidIntegrityInfo { index: usize },
    /// NCA: Section {index} uses an unsupported encryption type
    UnsupportedEncryptionType { index: usize },
    /// NCA: Section {index} is not a BKTR patch section
    NotAPatchSection { index: usize },
    /// NCA: Invalid BKTR patch tables
    Bktr { source: BktrError },
    /// NCA: No plain RomFS section to use as a patch base
    MissingBase,
    /// NCA: Section {index} PFS0 did not parse
    Pfs { index: usize, source: PfsParseError },
    /// NCA: Section {index} RomFS did not parse
    RomFs {
        index: usize,
        source: RomFsParseError,
    },
}

/// Why the body keys of an NCA are unavailable. Kept cheap to clone so the
/// failure can be reported per-section without aborting the parse.
#[derive(Debug, Clone)]
pub enum MissingKeyInfo {
    Key { key_name: String, generation: u8 },
    TitleKey { rights_id: RightsId },
}

impl From<&MissingKeyInfo> for NcaError {
    fn from(info: &MissingKeyInfo) -> Self {
        match info {
            MissingKeyInfo::Key {
                key_name,
                generation,
            } => NcaError::MissingKey {
                key_name: key_name.clone(),
                generation: *generation,
            },
            MissingKeyInfo::TitleKey { rights_id } => NcaError::MissingTitleKey {
                rights_id: *rights_id,
            },
        }
    }
}

/// Out-of-band key material for a single NCA.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyOverrides {
    /// Replaces the `title.keys` lookup for rights-id crypto.
    pub title_key: Option<TitleKey>,
    /// Used directly as the body key, bypassing key unwrapping entirely.
    pub content_key: Option<AesKey>,
}

#[derive(Debug)]
struct AllNcaHeaders {
    nca_header: NcaHeader,
    fs_headers: [Option<NcaFsHeader>; 4],
    fs_header_hash_ok: [Option<bool>; 4],
}

#[derive(Debug)]
enum NcaContentKeys {
    /// NCA is decrypted, no keys are needed.
    Plaintext,
    /// Keys unwrapped from the key area.
    KeyArea { ctr: AesKey, xts: AesXtsKey },
    /// A single externally-derived body key (title key or content-key
    /// override); only CTR sections can use it.
    RightsId(AesKey),
}

/// A parsed NCA. Sections are exposed as composed storage views; missing
/// key material degrades the affected sections instead of failing the
/// parse.
#[derive(Debug)]
pub struct Nca<S: ReadableStorage> {
    body: SharedStorage<S>,
    headers: AllNcaHeaders,
    raw_decrypted_headers: Box<[u8; ALL_HEADERS_SIZE]>,
    content_key: Result<NcaContentKeys, MissingKeyInfo>,
}

const ALL_HEADERS_SIZE: usize = 0xc00;
const NCA_HEADER_SIZE: usize = 0x400;
const HEADER_SECTOR_SIZE: usize = 0x200;
/// The fixed-key signature covers the serialized header after the two
/// signatures.
const SIGNED_AREA: std::ops::Range<usize> = 0x200..0x400;

impl<S: ReadableStorage> Nca<S> {
    pub fn new(key_set: &KeySet, storage: S) -> Result<Self, NcaError> {
        Self::with_overrides(key_set, storage, KeyOverrides::default())
    }

    pub fn with_overrides(
        key_set: &KeySet,
        storage: S,
        overrides: KeyOverrides,
    ) -> Result<Self, NcaError> {
        let (headers, raw_decrypted_headers, is_decrypted) =
            Self::parse_headers(key_set, &storage)?;

        let content_key =
            Self::resolve_content_key(key_set, &headers.nca_header, is_decrypted, overrides);
        if let Err(missing) = &content_key {
            tracing::debug!(?missing, "NCA body keys unavailable, sections degraded");
        }

        let body = storage.shared();
        if headers.nca_header.nca_size != body.get_size() {
            return Err(NcaError::StorageSizeMismatch {
                expected: headers.nca_header.nca_size,
                actual: body.get_size(),
            });
        }

        Ok(Self {
            body,
            headers,
            raw_decrypted_headers: Box::new(raw_decrypted_headers),
            content_key,
        })
    }

    fn resolve_content_key(
        key_set: &KeySet,
        header: &NcaHeader,
        is_decrypted: bool,
        overrides: KeyOverrides,
    ) -> Result<NcaContentKeys, MissingKeyInfo> {
        let key_generation = header.key_generation();

        if is_decrypted {
            return Ok(NcaContentKeys::Plaintext);
        }

        if let Some(content_key) = overrides.content_key {
            return Ok(NcaContentKeys::RightsId(content_key));
        }

        if !header.rights_id.is_empty() {
            let title_key = match overrides.title_key {
                Some(title_key) => title_key,
                None => {
                    key_set
                        .title_key(&header.rights_id)
                        .map_err(|_| MissingKeyInfo::TitleKey {
                            rights_id: header.rights_id,
                        })?
                }
            };

            let title_kek =
                key_set
                    .title_kek(key_generation)
                    .map_err(|e| MissingKeyInfo::Key {
                        key_name: e.key_name.to_string(),
                        generation: key_generation,
                    })?;

            return Ok(NcaContentKeys::RightsId(title_key.decrypt(title_kek)));
        }

        let kak = key_set
            .key_area_key(key_generation, header.key_area_key_index)
            .map_err(|e| MissingKeyInfo::Key {
                key_name: e.key_name.to_string(),
                generation: key_generation,
            })?;

        Ok(NcaContentKeys::KeyArea {
            ctr: kak.decrypt_key(header.key_area.encrypted_ctr_key),
            xts: kak.decrypt_xts_key(header.key_area.encrypted_xts_key),
        })
    }

    fn content_keys(&self) -> Result<&NcaContentKeys, NcaError> {
        self.content_key.as_ref().map_err(NcaError::from)
    }

    fn ctr_key(&self) -> Result<AesKey, NcaError> {
        match self.content_keys()? {
            NcaContentKeys::Plaintext => unreachable!("plaintext NCA has no CTR key"),
            NcaContentKeys::KeyArea { ctr, .. } => Ok(*ctr),
            NcaContentKeys::RightsId(key) => Ok(*key),
        }
    }

    fn xts_key(&self) -> Result<AesXtsKey, NcaError> {
        match self.content_keys()? {
            NcaContentKeys::Plaintext => unreachable!("plaintext NCA has no XTS key"),
            NcaContentKeys::KeyArea { xts, .. } => Ok(*xts),
            NcaContentKeys::RightsId(_) => Err(NcaError::MissingKey {
                key_name: "key_area_xts".to_string(),
                generation: self.headers.nca_header.key_generation(),
            }),
        }
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(self.content_key, Ok(NcaContentKeys::Plaintext))
    }

    fn try_parse_nca_header(header: &[u8]) -> Result<NcaHeader, NcaError> {
        assert_eq!(header.len(), NCA_HEADER_SIZE);
        let mut cur = Cursor::new(header);

        let res = NcaHeader::read(&mut cur).context(NcaHeaderParsingSnafu)?;
        assert_eq!(cur.position(), NCA_HEADER_SIZE as u64);
        Ok(res)
    }

    /// Decrypts and parses the 0xC00 header block. Returns the parsed
    /// headers, the decrypted bytes and whether the NCA was plaintext.
    fn parse_headers(
        key_set: &KeySet,
        storage: &S,
    ) -> Result<(AllNcaHeaders, [u8; ALL_HEADERS_SIZE], bool), NcaError> {
        let mut headers_data = [0; ALL_HEADERS_SIZE];
        storage.read(0, &mut headers_data).context(StorageSnafu)?;

        let mut is_decrypted = false;

        let nca_header = if let Ok(nca_header) =
            Self::try_parse_nca_header(&headers_data[..NCA_HEADER_SIZE])
        {
            // if we were able to parse the NCA header, chances are it's not encrypted
            is_decrypted = true;
            nca_header
        } else {
            // else - perform the decryption
            let key = key_set.header_key().map_err(|e| NcaError::MissingKey {
                key_name: e.key_name.to_string(),
                generation: 0,
            })?;

            let (nca_header_data, fs_header_data) = headers_data.split_at_mut(NCA_HEADER_SIZE);
            key.decrypt(nca_header_data, 0, HEADER_SECTOR_SIZE);

            let magic: [u8; 4] = nca_header_data[0x200..0x204].try_into().unwrap();
            if !matches!(&magic, b"NCA0" | b"NCA1" | b"NCA2" | b"NCA3") {
                return Err(NcaError::BadMagic);
            }

            let nca_header = Self::try_parse_nca_header(nca_header_data)?;

            match nca_header.magic {
                // NCA0/NCA1 bodies use a different (whole-body XTS) layout
                version @ (NcaMagic::Nca0 | NcaMagic::Nca1) => {
                    return Err(NcaError::UnsupportedVersion { version })
                }
                NcaMagic::Nca2 => {
                    for i in 0..4 {
                        // NCA2 encrypts each fs header as if it was sector 0
                        key.decrypt(
                            &mut fs_header_data[i * HEADER_SECTOR_SIZE..][..HEADER_SECTOR_SIZE],
                            0,
                            HEADER_SECTOR_SIZE,
                        );
                    }
                }
                NcaMagic::Nca3 => {
                    // decrypt the rest with sequential sector numbers
                    key.decrypt(fs_header_data, 2, HEADER_SECTOR_SIZE);
                }
            }

            nca_header
        };

        let mut fs_headers = [None; 4];
        let mut fs_header_hash_ok = [None; 4];
        for (index, data) in headers_data[NCA_HEADER_SIZE..]
            .chunks_exact(HEADER_SECTOR_SIZE)
            .enumerate()
        {
            let section_entry = nca_header.section_table[index];
            if !section_entry.is_enabled {
                continue;
            }

            // recorded, not fatal: a mismatch usually means a tampered or
            // truncated file, but the section may still parse
            let hash_ok = nca_header.fs_header_hashes[index].matches(data);
            fs_header_hash_ok[index] = Some(hash_ok);
            if !hash_ok {
                tracing::warn!(index, "NCA FS header hash mismatch");
            }

            let mut cur = Cursor::new(data);
            fs_headers[index] =
                Some(NcaFsHeader::read(&mut cur).context(FsHeaderParsingSnafu { index })?);
        }

        Ok((
            AllNcaHeaders {
                nca_header,
                fs_headers,
                fs_header_hash_ok,
            },
            headers_data,
            is_decrypted,
        ))
    }
}

impl<S: ReadableStorage> Nca<S> {
    pub fn content_type(&self) -> NcaContentType {
        self.headers.nca_header.content_type
    }

    pub fn distribution_type(&self) -> DistributionType {
        self.headers.nca_header.distribution_type
    }

    pub fn title_id(&self) -> crate::ids::TitleId {
        self.headers.nca_header.title_id
    }

    pub fn rights_id(&self) -> RightsId {
        self.headers.nca_header.rights_id
    }

    pub fn key_generation(&self) -> u8 {
        self.headers.nca_header.key_generation()
    }

    pub fn sdk_version(&self) -> u32 {
        self.headers.nca_header.sdk_version
    }

    /// Per-section FS header hash results; `None` for absent sections.
    pub fn fs_header_hash_results(&self) -> [Option<bool>; 4] {
        self.headers.fs_header_hash_ok
    }

    /// Why the body keys are unavailable, if they are.
    pub fn missing_key_info(&self) -> Option<&MissingKeyInfo> {
        self.content_key.as_ref().err()
    }

    pub fn section_fs_header(&self, index: usize) -> Option<&NcaFsHeader> {
        self.headers.fs_headers[index].as_ref()
    }

    /// Checks the fixed-key RSA-PSS signature over the header.
    pub fn verify_header_signature(&self, anchors: &TrustAnchors) -> SignatureStatus {
        anchors.verify_nca_header(
            &self.raw_decrypted_headers[SIGNED_AREA],
            &self.headers.nca_header.fixed_key_signature.0 .0,
        )
    }
}
