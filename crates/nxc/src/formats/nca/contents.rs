use crate::formats::nca::bktr::{
    AesCtrExStorage, BktrStorage, BucketTreeHeader, RelocationTable, SubsectionTable,
};
use crate::formats::nca::filesystem::NcaFileSystem;
use crate::formats::nca::structs::{
    IntegrityInfo, NcaEncryptionType, NcaFormatType, NcaFsHeader, SectionTableEntry,
};
use crate::formats::nca::verification_storage::NcaVerificationStorage;
use crate::formats::nca::{
    BktrSnafu, IntegrityCheckLevel, Nca, NcaContentKeys, NcaCryptStorage, NcaError,
    SectionLayoutSnafu, StorageSnafu,
};
use crate::formats::romfs::RomFileSystem;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SharedStorage, SliceStorage, Storage,
};
use snafu::ResultExt;

pub type RawSectionStorage<S> = SliceStorage<SharedStorage<S>>;
pub type DecryptedSectionStorage<S> = NcaCryptStorage<RawSectionStorage<S>>;
pub type VerifiedSectionStorage<S> = NcaVerificationStorage<DecryptedSectionStorage<S>>;
pub type SectionFileSystem<S> = NcaFileSystem<VerifiedSectionStorage<S>>;

/// A patched RomFS section: BKTR overlay between a base section view `B`
/// and this NCA's patch data, with the update's integrity tree on top.
pub type PatchedSectionStorage<S, B> =
    NcaVerificationStorage<BktrStorage<B, RawSectionStorage<S>>>;
pub type PatchedSectionFileSystem<S, B> = RomFileSystem<PatchedSectionStorage<S, B>>;

/// Attaches the hash layer the FS header asks for.
fn make_verification_storage<T: ReadableStorage>(
    index: usize,
    fs_header: &NcaFsHeader,
    storage: T,
    integrity_level: IntegrityCheckLevel,
) -> Result<NcaVerificationStorage<T>, NcaError> {
    match fs_header.integrity_info {
        IntegrityInfo::None => Ok(NcaVerificationStorage::new_unverified(storage)),
        IntegrityInfo::Sha256(s) => {
            if s.level_count != 2 {
                return Err(NcaError::InvalidIntegrityInfo { index });
            }
            let levels = s.level_info[..2].try_into().unwrap();

            NcaVerificationStorage::new_pfs_verification_storage(
                storage,
                s.master_hash.0 .0,
                levels,
                s.block_size,
                integrity_level,
            )
            .context(SectionLayoutSnafu { index })
        }
        IntegrityInfo::Ivfc(s) => {
            if s.master_hash_size != 0x20 || !(1..=7).contains(&s.level_count) {
                return Err(NcaError::InvalidIntegrityInfo { index });
            }
            let master_hash = s.master_hash.0[..0x20].try_into().unwrap();

            // the last level descriptor is the data itself, the master hash
            // anchors level 0
            NcaVerificationStorage::new_ivfc_verification_storage(
                storage,
                master_hash,
                s.level_count - 1,
                s.level_info,
                integrity_level,
            )
            .context(SectionLayoutSnafu { index })
        }
    }
}

impl<S: ReadableStorage> Nca<S> {
    fn section_entry(&self, index: usize) -> Option<(SectionTableEntry, &NcaFsHeader)> {
        let entry = self.headers.nca_header.section_table[index];
        let fs_header = self.headers.fs_headers[index].as_ref()?;

        entry.is_enabled.then_some((entry, fs_header))
    }

    /// The still-encrypted bytes of a section.
    pub fn get_raw_section_storage(&self, index: usize) -> Option<RawSectionStorage<S>> {
        let (entry, _) = self.section_entry(index)?;

        Some(
            self.body
                .clone()
                .slice(entry.start.into(), entry.size())
                .expect("BUG: section range already validated"),
        )
    }

    /// The section bytes after the cipher layer.
    ///
    /// For an `AesCtrEx` patch section this view uses the plain section
    /// counter, which only decodes the BKTR tables at the end of the
    /// section; the patch data itself is only meaningful through
    /// [`get_patched_section_storage`](Self::get_patched_section_storage).
    pub fn get_decrypted_section_storage(
        &self,
        index: usize,
    ) -> Option<Result<DecryptedSectionStorage<S>, NcaError>> {
        let (entry, fs_header) = self.section_entry(index)?;
        let raw = self.get_raw_section_storage(index)?;

        Some(self.build_decrypted_storage(index, entry, fs_header, raw))
    }

    fn build_decrypted_storage(
        &self,
        index: usize,
        entry: SectionTableEntry,
        fs_header: &NcaFsHeader,
        raw: RawSectionStorage<S>,
    ) -> Result<DecryptedSectionStorage<S>, NcaError> {
        let keys = self.content_keys()?;

        if matches!(keys, NcaContentKeys::Plaintext) {
            return Ok(NcaCryptStorage::new_plaintext(raw));
        }

        let start_offset: u64 = entry.start.into();
        Ok(match fs_header.encryption_type {
            NcaEncryptionType::None => NcaCryptStorage::new_plaintext(raw),
            NcaEncryptionType::AesCtr | NcaEncryptionType::AesCtrEx => NcaCryptStorage::new_ctr(
                raw,
                self.ctr_key()?,
                fs_header.upper_counter,
                start_offset,
            ),
            NcaEncryptionType::Xts => {
                NcaCryptStorage::new_xts(raw, self.xts_key()?, 0x200, start_offset)
            }
            NcaEncryptionType::Auto => {
                return Err(NcaError::UnsupportedEncryptionType { index })
            }
        })
    }

    /// The decrypted section with its integrity layer attached.
    pub fn get_section_storage(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
    ) -> Option<Result<VerifiedSectionStorage<S>, NcaError>> {
        let (_, fs_header) = self.section_entry(index)?;
        let decrypted = self.get_decrypted_section_storage(index)?;

        Some(decrypted.and_then(|storage| {
            make_verification_storage(index, fs_header, storage, integrity_level)
        }))
    }

    /// The inner filesystem of a section, routed by its partition type.
    pub fn get_section_fs(
        &self,
        index: usize,
        integrity_level: IntegrityCheckLevel,
    ) -> Option<Result<SectionFileSystem<S>, NcaError>> {
        let (_, fs_header) = self.section_entry(index)?;
        let storage = self.get_section_storage(index, integrity_level)?;

        Some(storage.and_then(|storage| match fs_header.format_type {
            NcaFormatType::Romfs => {
                NcaFileSystem::new_romfs(storage).map_err(|source| NcaError::RomFs { index, source })
            }
            NcaFormatType::Pfs0 => {
                NcaFileSystem::new_pfs(storage).map_err(|source| NcaError::Pfs { index, source })
            }
        }))
    }

    /// Overlays this NCA's BKTR patch section onto `base`, the decrypted
    /// RomFS section view of the base NCA.
    ///
    /// The overlay borrows the base view; the caller keeps the base NCA
    /// alive for as long as the returned storage is used.
    pub fn get_patched_section_storage<B: ReadableStorage>(
        &self,
        index: usize,
        base: B,
        integrity_level: IntegrityCheckLevel,
    ) -> Option<Result<PatchedSectionStorage<S, B>, NcaError>> {
        let (entry, fs_header) = self.section_entry(index)?;

        Some(self.build_patched_storage(index, entry, fs_header, base, integrity_level))
    }

    fn build_patched_storage<B: ReadableStorage>(
        &self,
        index: usize,
        entry: SectionTableEntry,
        fs_header: &NcaFsHeader,
        base: B,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<PatchedSectionStorage<S, B>, NcaError> {
        if !fs_header.is_patch_section() {
            return Err(NcaError::NotAPatchSection { index });
        }
        // an already-decrypted patch NCA has no body key to derive the
        // per-subsection counters from
        if matches!(self.content_keys()?, NcaContentKeys::Plaintext) {
            return Err(NcaError::UnsupportedEncryptionType { index });
        }

        let patch_info = fs_header.patch_info;
        BucketTreeHeader::parse(&patch_info.relocation_tree_header.0).context(BktrSnafu)?;
        BucketTreeHeader::parse(&patch_info.subsection_tree_header.0).context(BktrSnafu)?;

        // the trees at the end of the section are encrypted with the plain
        // section counter
        let raw = self
            .get_raw_section_storage(index)
            .expect("BUG: entry presence already checked");
        let table_view = self
            .build_decrypted_storage(index, entry, fs_header, raw)?
            .shared();

        let tree = |offset: u64, size: u64| {
            table_view
                .clone()
                .slice(offset, size)
                .context(SectionLayoutSnafu { index })
        };
        let relocations = RelocationTable::parse(&tree(
            patch_info.relocation_tree_offset,
            patch_info.relocation_tree_size,
        )?)
        .context(BktrSnafu)?;
        let subsections = SubsectionTable::parse(&tree(
            patch_info.subsection_tree_offset,
            patch_info.subsection_tree_size,
        )?)
        .context(BktrSnafu)?;

        let raw = self
            .get_raw_section_storage(index)
            .expect("BUG: entry presence already checked");
        let patched = AesCtrExStorage::new(
            raw,
            self.ctr_key()?,
            fs_header.upper_counter,
            entry.start.into(),
            subsections,
        );

        let overlay = BktrStorage::new(relocations, base, patched);
        make_verification_storage(index, fs_header, overlay, integrity_level)
    }

    /// A patched section decoded as RomFS, the only filesystem BKTR carries.
    pub fn get_patched_section_fs<B: ReadableStorage>(
        &self,
        index: usize,
        base: B,
        integrity_level: IntegrityCheckLevel,
    ) -> Option<Result<PatchedSectionFileSystem<S, B>, NcaError>> {
        let storage = self.get_patched_section_storage(index, base, integrity_level)?;

        Some(storage.and_then(|storage| {
            RomFileSystem::new(storage).map_err(|source| NcaError::RomFs { index, source })
        }))
    }

    /// The RomFS section view this NCA would contribute as the *base* of a
    /// BKTR overlay. Errors with `MissingBase` if there is none.
    pub fn base_romfs_storage(
        &self,
        integrity_level: IntegrityCheckLevel,
    ) -> Result<VerifiedSectionStorage<S>, NcaError> {
        let index = (0..4)
            .find(|&index| {
                self.section_entry(index)
                    .map(|(_, fs_header)| {
                        fs_header.format_type == NcaFormatType::Romfs
                            && !fs_header.is_patch_section()
                    })
                    .unwrap_or(false)
            })
            .ok_or(NcaError::MissingBase)?;

        self.get_section_storage(index, integrity_level)
            .expect("BUG: section presence already checked")
    }

    /// Writes a fully decrypted copy of the NCA: plaintext headers, each
    /// section's bytes through its cipher layer, everything else copied raw.
    pub fn write_plaintext<T: Storage>(&self, output: &T) -> Result<(), NcaError> {
        const CHUNK: usize = 0x10000;

        self.body.copy_to(output).context(StorageSnafu)?;
        output
            .write(0, &self.raw_decrypted_headers[..])
            .context(StorageSnafu)?;

        for index in 0..4 {
            let Some((entry, _)) = self.section_entry(index) else {
                continue;
            };
            let storage = self
                .get_decrypted_section_storage(index)
                .expect("BUG: entry presence already checked")?;

            let start: u64 = entry.start.into();
            let size = storage.get_size();
            let mut buf = vec![0; CHUNK];
            for offset in (0..size).step_by(CHUNK) {
                let read_size = std::cmp::min(CHUNK as u64, size - offset) as usize;
                storage
                    .read(offset, &mut buf[..read_size])
                    .context(StorageSnafu)?;
                output
                    .write(start + offset, &buf[..read_size])
                    .context(StorageSnafu)?;
            }
        }

        Ok(())
    }
}
