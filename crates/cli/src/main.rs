mod sink;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use itertools::Itertools;
use nxc::crypto::keyset::KeySet;
use nxc::crypto::pki::TrustAnchors;
use nxc::extract::{extract_filesystem, list_files};
use nxc::formats::hfs::HashedFileSystem;
use nxc::formats::nca::{IntegrityCheckLevel, KeyOverrides, Nca};
use nxc::formats::npdm::Npdm;
use nxc::formats::pfs::PartitionFileSystem;
use nxc::formats::pk11::Package1;
use nxc::formats::pk21::Package2;
use nxc::formats::romfs::RomFileSystem;
use nxc::formats::xci::Xci;
use nxc::snafu::{whatever, ErrorCompat, OptionExt, ResultExt, Whatever};
use nxc::storage::{FileRoStorage, FileRwStorage, ReadableStorage, VecStorage};

use crate::sink::DirectorySink;

/// Feeds a single named file through the directory sink.
fn emit_one(
    sink: &mut DirectorySink,
    name: &str,
    storage: &dyn ReadableStorage,
) -> Result<(), Whatever> {
    use nxc::extract::ExtractSink;
    match sink.emit(name, storage) {
        Ok(()) => Ok(()),
        Err(e) => whatever!("Saving {}: {}", name, e),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum InType {
    Nca,
    #[value(alias = "exefs")]
    Pfs0,
    Hfs0,
    Romfs,
    #[value(alias = "gamecard", alias = "gc")]
    Xci,
    #[value(alias = "meta")]
    Npdm,
    #[value(alias = "package1")]
    Pk11,
    #[value(alias = "package2")]
    Pk21,
}

/// Offline inspector and extractor for the console's nested container
/// formats.
#[derive(Parser)]
#[clap(version = "0.1.0")]
struct Opts {
    /// Input file
    file: Utf8PathBuf,

    /// Input file type
    #[clap(short = 't', long = "intype", value_enum, default_value = "nca")]
    intype: InType,

    /// Show file info (the default action)
    #[clap(short, long)]
    info: bool,

    /// Extract data from the file
    #[clap(short = 'x', long)]
    extract: bool,

    /// Verify hashes and signatures, failing reads of bad blocks
    #[clap(short = 'y', long)]
    verify: bool,

    /// Save raw decrypted section dumps instead of unpacking filesystems
    #[clap(short, long)]
    raw: bool,

    /// Load keys from an external directory instead of the system one
    #[clap(short, long)]
    keyset: Option<Utf8PathBuf>,

    /// Set the title key for rights-id crypto
    #[clap(long)]
    titlekey: Option<String>,

    /// Set the body key directly, bypassing key-area decryption
    #[clap(long)]
    contentkey: Option<String>,

    /// Base NCA to resolve a BKTR update against
    #[clap(long)]
    basenca: Option<Utf8PathBuf>,

    /// Output directory for extraction
    #[clap(long)]
    outdir: Option<Utf8PathBuf>,

    /// Save a decrypted copy of the NCA to this path
    #[clap(long)]
    plaintext: Option<Utf8PathBuf>,

    /// List RomFS file paths instead of extracting
    #[clap(long)]
    listromfs: bool,
}

impl Opts {
    fn integrity_level(&self) -> IntegrityCheckLevel {
        if self.verify {
            IntegrityCheckLevel::Full
        } else {
            IntegrityCheckLevel::IgnoreOnInvalid
        }
    }

    fn wants_info(&self) -> bool {
        self.info || !self.extract
    }

    fn outdir(&self) -> Result<DirectorySink, Whatever> {
        let root = self
            .outdir
            .clone()
            .whatever_context("--outdir is required for extraction")?;
        Ok(DirectorySink::new(root))
    }

    fn key_overrides(&self) -> Result<KeyOverrides, Whatever> {
        Ok(KeyOverrides {
            title_key: self
                .titlekey
                .as_deref()
                .map(|s| s.parse())
                .transpose()
                .whatever_context("Parsing --titlekey")?,
            content_key: self
                .contentkey
                .as_deref()
                .map(|s| s.parse())
                .transpose()
                .whatever_context("Parsing --contentkey")?,
        })
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    if let Err(e) = run(&opts) {
        eprintln!("Error: {}", e);
        let causes = e.iter_chain().skip(1).collect::<Vec<_>>();
        if !causes.is_empty() {
            eprintln!("Caused by:");
            for cause in causes {
                eprintln!(" - {}", cause);
            }
        }
        std::process::exit(1);
    }
}

fn run(opts: &Opts) -> Result<(), Whatever> {
    let storage =
        FileRoStorage::open(&opts.file).whatever_context("Opening the input file")?;

    match opts.intype {
        InType::Nca => nca_main(opts, storage),
        InType::Pfs0 => pfs_main(opts, storage),
        InType::Hfs0 => hfs_main(opts, storage),
        InType::Romfs => romfs_main(opts, storage),
        InType::Xci => xci_main(opts, storage),
        InType::Npdm => npdm_main(opts, storage),
        InType::Pk11 => pk11_main(opts, storage),
        InType::Pk21 => pk21_main(opts, storage),
    }
}

fn load_keyset(opts: &Opts) -> Result<KeySet, Whatever> {
    KeySet::from_system(opts.keyset.as_deref().map(|p| p.as_std_path()))
        .whatever_context("Loading the keyset")
}

fn signature_text(status: nxc::crypto::pki::SignatureStatus) -> &'static str {
    use nxc::crypto::pki::SignatureStatus;
    match status {
        SignatureStatus::Ok => "OK",
        SignatureStatus::Invalid => "FAIL",
        SignatureStatus::Unchecked => "UNCHECKED (no modulus loaded)",
    }
}

fn check_text(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "FAIL"
    }
}

fn nca_info(nca: &Nca<FileRoStorage>, anchors: &TrustAnchors, verify: bool) {
    println!("NCA:");
    println!("  Content Type:    {:?}", nca.content_type());
    println!("  Distribution:    {:?}", nca.distribution_type());
    println!("  Title ID:        {}", nca.title_id());
    println!("  SDK Version:     {:08x}", nca.sdk_version());
    println!("  Key Generation:  {}", nca.key_generation());
    println!("  Rights ID:       {}", nca.rights_id());
    if verify {
        println!(
            "  Signature 1:     {}",
            signature_text(nca.verify_header_signature(anchors))
        );
    }
    if let Some(missing) = nca.missing_key_info() {
        println!("  Body Keys:       MISSING ({:?})", missing);
    }

    let hash_results = nca.fs_header_hash_results();
    for index in 0..4 {
        let Some(fs_header) = nca.section_fs_header(index) else {
            continue;
        };
        println!("  Section {}:", index);
        println!("    Partition Type: {:?}", fs_header.format_type);
        println!("    Crypto Type:    {:?}", fs_header.encryption_type);
        println!("    Hash Type:      {:?}", fs_header.hash_type);
        if let Some(hash_ok) = hash_results[index] {
            println!("    FS Header Hash: {}", check_text(hash_ok));
        }
        if fs_header.is_patch_section() {
            println!("    Patch:          BKTR (needs a base NCA)");
        }
    }
}

fn nca_main(opts: &Opts, storage: FileRoStorage) -> Result<(), Whatever> {
    let keys = load_keyset(opts)?;
    let anchors = keys.trust_anchors();
    let level = opts.integrity_level();

    let nca = Nca::with_overrides(&keys, storage, opts.key_overrides()?)
        .whatever_context("Opening the NCA")?;

    if opts.wants_info() {
        nca_info(&nca, &anchors, opts.verify);
    }

    if let Some(path) = &opts.plaintext {
        let out = FileRwStorage::create(path).whatever_context("Creating the plaintext file")?;
        nca.write_plaintext(&out)
            .whatever_context("Writing the decrypted NCA copy")?;
        println!("Saved decrypted copy to {}", path);
    }

    let base_romfs = opts
        .basenca
        .as_ref()
        .map(|path| -> Result<_, Whatever> {
            let base_storage =
                FileRoStorage::open(path).whatever_context("Opening the base NCA")?;
            let base = Nca::new(&keys, base_storage).whatever_context("Parsing the base NCA")?;
            base.base_romfs_storage(level)
                .whatever_context("Locating the base RomFS")
        })
        .transpose()?;

    if opts.listromfs {
        let patch_index = (0..4).find(|&index| {
            nca.section_fs_header(index)
                .map_or(false, |header| header.is_patch_section())
        });
        let romfs_index = (0..4).find(|&index| {
            nca.section_fs_header(index).map_or(false, |header| {
                header.format_type == nxc::formats::nca::NcaFormatType::Romfs
                    && !header.is_patch_section()
            })
        });

        if let Some(index) = patch_index {
            let base = base_romfs
                .whatever_context("This NCA is an update; pass --basenca to resolve its RomFS")?;
            let fs = nca
                .get_patched_section_fs(index, base, level)
                .expect("section disappeared")
                .whatever_context("Opening the patched RomFS")?;
            println!("{}", list_files(&fs).iter().join("\n"));
        } else if let Some(index) = romfs_index {
            let fs = nca
                .get_section_fs(index, level)
                .expect("section disappeared")
                .whatever_context("Opening the RomFS")?;
            println!("{}", list_files(&fs).iter().join("\n"));
        } else {
            whatever!("No RomFS section found");
        }
        return Ok(());
    }

    if !opts.extract {
        return Ok(());
    }
    let mut sink = opts.outdir()?;

    let mut base_romfs = base_romfs;
    for index in 0..4 {
        let Some(fs_header) = nca.section_fs_header(index) else {
            continue;
        };

        if opts.raw {
            let storage = match nca.get_decrypted_section_storage(index) {
                Some(Ok(storage)) => storage,
                Some(Err(e)) => {
                    eprintln!("Skipping section {}: {}", index, e);
                    continue;
                }
                None => continue,
            };
            emit_one(&mut sink, &format!("section{}.bin", index), &storage)?;
            continue;
        }

        if fs_header.is_patch_section() {
            let Some(base) = base_romfs.take() else {
                eprintln!(
                    "Skipping section {}: this is a BKTR update section, pass --basenca",
                    index
                );
                continue;
            };
            let fs = nca
                .get_patched_section_fs(index, base, level)
                .expect("section disappeared")
                .whatever_context("Opening the patched RomFS")?;
            extract_filesystem(&fs, &mut sink).whatever_context("Extracting the patched RomFS")?;
            continue;
        }

        match nca.get_section_fs(index, level) {
            Some(Ok(fs)) => {
                extract_filesystem(&fs, &mut sink)
                    .with_whatever_context(|_| format!("Extracting section {}", index))?;
            }
            Some(Err(e)) => eprintln!("Skipping section {}: {}", index, e),
            None => {}
        }
    }

    Ok(())
}

fn pfs_main(opts: &Opts, storage: FileRoStorage) -> Result<(), Whatever> {
    let fs = PartitionFileSystem::new(storage).whatever_context("Parsing the PFS0")?;

    if opts.wants_info() {
        println!("PFS0:");
        println!("  Files: {}", fs.file_count());
        for path in list_files(&fs) {
            println!("    {}", path);
        }
    }

    if opts.extract {
        extract_filesystem(&fs, &mut opts.outdir()?).whatever_context("Extracting the PFS0")?;
    }
    Ok(())
}

fn hfs_main(opts: &Opts, storage: FileRoStorage) -> Result<(), Whatever> {
    let fs = HashedFileSystem::new(storage).whatever_context("Parsing the HFS0")?;

    if opts.wants_info() || opts.verify {
        println!("HFS0:");
        println!("  Files: {}", fs.file_count());
        let results = fs
            .verify_all()
            .whatever_context("Hashing the HFS0 contents")?;
        for (name, hash_ok) in results {
            println!("    {} [{}]", name, check_text(hash_ok));
        }
    }

    if opts.extract {
        extract_filesystem(&fs, &mut opts.outdir()?).whatever_context("Extracting the HFS0")?;
    }
    Ok(())
}

fn romfs_main(opts: &Opts, storage: FileRoStorage) -> Result<(), Whatever> {
    let fs = RomFileSystem::new(storage).whatever_context("Parsing the RomFS")?;

    if opts.listromfs || opts.wants_info() {
        println!("{}", list_files(&fs).iter().join("\n"));
    }

    if opts.extract {
        extract_filesystem(&fs, &mut opts.outdir()?).whatever_context("Extracting the RomFS")?;
    }
    Ok(())
}

fn xci_main(opts: &Opts, storage: FileRoStorage) -> Result<(), Whatever> {
    let xci = Xci::new(storage).whatever_context("Parsing the XCI")?;
    let partitions = xci
        .partitions()
        .whatever_context("Parsing the sub-partitions")?;

    if opts.wants_info() {
        let header = xci.header();
        println!("XCI:");
        println!("  Cart Size:        {}", header.rom_size.capacity());
        println!("  Package ID:       {:016x}", header.package_id);
        println!(
            "  Root Header Hash: {}",
            check_text(xci.root_header_hash_ok())
        );
        for (ty, partition) in &partitions {
            let Some(partition) = partition else { continue };
            println!("  Partition {} ({} files)", ty.name(), partition.file_count());
            for path in list_files(partition) {
                println!("    {}", path);
            }
        }
    }

    if opts.verify {
        for (ty, partition) in &partitions {
            let Some(partition) = partition else { continue };
            for (name, hash_ok) in partition
                .verify_all()
                .whatever_context("Hashing partition contents")?
            {
                println!("  {}/{} [{}]", ty.name(), name, check_text(hash_ok));
            }
        }
    }

    if opts.extract {
        let root = opts
            .outdir
            .clone()
            .whatever_context("--outdir is required for extraction")?;
        for (ty, partition) in &partitions {
            let Some(partition) = partition else { continue };
            let mut sink = DirectorySink::new(root.join(ty.name()));
            extract_filesystem(partition, &mut sink)
                .with_whatever_context(|_| format!("Extracting the {} partition", ty.name()))?;
        }
    }
    Ok(())
}

fn npdm_main(_opts: &Opts, storage: FileRoStorage) -> Result<(), Whatever> {
    let npdm = Npdm::new(&storage).whatever_context("Parsing the NPDM")?;

    println!("NPDM:");
    println!("  Title Name:        {}", npdm.title_name);
    println!("  Product Code:      {}", npdm.product_code);
    println!("  64-bit:            {}", npdm.is_64bit());
    println!("  Main Thread Prio:  {}", npdm.header.main_thread_priority);
    println!("  Main Thread Core:  {}", npdm.header.main_thread_core);
    println!(
        "  Main Thread Stack: {:#x}",
        npdm.header.main_thread_stack_size
    );
    println!("  Title ID:          {}", npdm.aci0.title_id);
    println!(
        "  ACID Title Range:  {} - {}",
        npdm.acid.title_id_range_min, npdm.acid.title_id_range_max
    );
    println!("  Total Size:        {:#x}", npdm.total_size);

    Ok(())
}

fn pk11_main(opts: &Opts, storage: FileRoStorage) -> Result<(), Whatever> {
    let keys = load_keyset(opts)?;
    let pk11 = Package1::new(&keys, &storage).whatever_context("Parsing the Package1")?;

    if opts.wants_info() {
        println!("Package1:");
        println!("  Build Identifier: {}", pk11.outer.build_identifier());
        println!("  Key Revision:     {}", pk11.outer.key_revision());
        for (name, data) in pk11.sections() {
            println!("  {} ({:#x} bytes)", name, data.len());
        }
    }

    if opts.extract {
        let mut sink = opts.outdir()?;
        for (name, data) in pk11.sections() {
            emit_one(&mut sink, name, &VecStorage::new(data.to_vec()))?;
        }
    }
    Ok(())
}

fn pk21_main(opts: &Opts, storage: FileRoStorage) -> Result<(), Whatever> {
    let keys = load_keyset(opts)?;
    let anchors = keys.trust_anchors();
    let pk21 = Package2::new(&keys, &storage).whatever_context("Parsing the Package2")?;

    if opts.wants_info() {
        println!("Package2:");
        println!("  Key Generation: {}", pk21.key_generation);
        println!("  Version:        {:#x}", pk21.meta.version);
        println!("  Meta CMAC:      {}", check_text(pk21.cmac_ok));
        if opts.verify {
            println!(
                "  Signature:      {}",
                signature_text(pk21.verify_signature(&anchors))
            );
        }
        for section in pk21.sections() {
            println!(
                "  Section {} ({:#x} bytes) [{}]",
                section.index,
                section.data.len(),
                check_text(section.hash_ok)
            );
        }
    }

    if opts.extract {
        let mut sink = opts.outdir()?;
        for section in pk21.sections() {
            emit_one(
                &mut sink,
                &format!("section{}.bin", section.index),
                &VecStorage::new(section.data.clone()),
            )?;
        }
    }
    Ok(())
}
