//! Minimal ISO 9660 image builder with a Joliet supplementary descriptor.
//!
//! The provisioning payload handed to every backend is a small ISO with
//! volume label `CIDATA` containing `meta-data` and `user-data`, the
//! cloud-init NoCloud datasource contract. Base ISO 9660 cannot represent
//! those lowercase, hyphenated names (Level 1 allows 8.3 uppercase only),
//! so a second, Joliet directory hierarchy carries the real names in UCS-2.
//! Building the image in-process keeps the output byte-identical across
//! platforms instead of depending on whichever of `xorriso`, `mkisofs`, or
//! `hdiutil` happens to be installed.
//!
//! Scope: flat images only. Files live in the root directory, with no
//! subdirectories and no boot records; that is all a cloud-init seed needs.
//!
//! References: ECMA-119 (ISO 9660) and the Joliet specification
//! ("Joliet Specification", CD-ROM Recording Spec, May 1995).

/// ISO 9660 logical block size. Fixed by the format.
const SECTOR_SIZE: usize = 2048;

// Image layout, in sectors. The system area (0-15) is left zeroed; files
// start on fresh sector boundaries after the metadata block.
const PVD_SECTOR: usize = 16;
const SVD_SECTOR: usize = 17;
const TERMINATOR_SECTOR: usize = 18;
const PRIMARY_PT_L_SECTOR: usize = 19;
const PRIMARY_PT_M_SECTOR: usize = 20;
const JOLIET_PT_L_SECTOR: usize = 21;
const JOLIET_PT_M_SECTOR: usize = 22;
const PRIMARY_ROOT_SECTOR: usize = 23;
const JOLIET_ROOT_SECTOR: usize = 24;
const FIRST_FILE_SECTOR: usize = 25;

/// Size of a single-directory path table: one 10-byte root entry.
const PATH_TABLE_SIZE: u32 = 10;

/// A file to place in the image's root directory.
pub struct IsoFile<'a> {
    /// Filename as the guest should see it (e.g. `"meta-data"`).
    pub name: &'a str,
    /// File contents.
    pub data: &'a [u8],
}

/// Build a flat ISO 9660 + Joliet image and return its bytes.
///
/// `volume_label` must be ASCII, at most 16 characters (the Joliet volume
/// identifier field holds 16 UCS-2 characters). Panics otherwise; callers
/// pass the fixed `CIDATA` label.
pub fn build_iso(volume_label: &str, files: &[IsoFile<'_>]) -> Vec<u8> {
    assert!(
        volume_label.is_ascii() && volume_label.len() <= 16,
        "volume label must be ASCII, max 16 chars"
    );
    for f in files {
        assert!(
            f.name.is_ascii() && f.name.len() <= 64,
            "file names must be ASCII, max 64 chars"
        );
    }

    // Lay out file extents first so every descriptor can point at them.
    let mut extents: Vec<(usize, usize)> = Vec::with_capacity(files.len());
    let mut next = FIRST_FILE_SECTOR;
    for f in files {
        extents.push((next, f.data.len()));
        next += sectors_for(f.data.len());
    }
    let total_sectors = next;

    let mut iso = vec![0u8; total_sectors * SECTOR_SIZE];

    write_pvd(&mut iso, volume_label, total_sectors as u32);
    write_svd(&mut iso, volume_label, total_sectors as u32);
    write_terminator(&mut iso);

    write_path_table(&mut iso, PRIMARY_PT_L_SECTOR, PRIMARY_ROOT_SECTOR as u32, true);
    write_path_table(&mut iso, PRIMARY_PT_M_SECTOR, PRIMARY_ROOT_SECTOR as u32, false);
    write_path_table(&mut iso, JOLIET_PT_L_SECTOR, JOLIET_ROOT_SECTOR as u32, true);
    write_path_table(&mut iso, JOLIET_PT_M_SECTOR, JOLIET_ROOT_SECTOR as u32, false);

    // Primary hierarchy: mangled Level 1 names for ISO-only readers.
    let primary_idents: Vec<Vec<u8>> = files
        .iter()
        .map(|f| level1_name(f.name).into_bytes())
        .collect();
    write_root_directory(&mut iso, PRIMARY_ROOT_SECTOR, &primary_idents, &extents);

    // Joliet hierarchy: the real names in UCS-2 big-endian. Both
    // hierarchies reference the same file extents.
    let joliet_idents: Vec<Vec<u8>> = files.iter().map(|f| ucs2be(f.name)).collect();
    write_root_directory(&mut iso, JOLIET_ROOT_SECTOR, &joliet_idents, &extents);

    for (i, f) in files.iter().enumerate() {
        let offset = extents[i].0 * SECTOR_SIZE;
        iso[offset..offset + f.data.len()].copy_from_slice(f.data);
    }

    iso
}

/// Fields shared by the primary and supplementary descriptors: numeric
/// metadata and the embedded root directory record at offset 156.
fn fill_descriptor_common(
    vd: &mut [u8],
    total_sectors: u32,
    pt_l_sector: u32,
    pt_m_sector: u32,
    root_sector: u32,
) {
    vd[1..6].copy_from_slice(b"CD001");
    vd[6] = 1; // descriptor version
    put_u32_both(&mut vd[80..88], total_sectors);
    put_u16_both(&mut vd[120..124], 1); // volume set size
    put_u16_both(&mut vd[124..128], 1); // volume sequence number
    put_u16_both(&mut vd[128..132], SECTOR_SIZE as u16);
    put_u32_both(&mut vd[132..140], PATH_TABLE_SIZE);
    vd[140..144].copy_from_slice(&pt_l_sector.to_le_bytes());
    vd[148..152].copy_from_slice(&pt_m_sector.to_be_bytes());

    // Root directory record, embedded inline. Identifier is the single
    // byte 0x00 ("this directory") in both hierarchies.
    let root = dir_record(root_sector, SECTOR_SIZE as u32, &[0x00], true);
    vd[156..156 + root.len()].copy_from_slice(&root);

    // Publisher/preparer/application identifier fields: space-padded blanks.
    vd[190..814].fill(b' ');
    vd[881] = 1; // file structure version
}

/// Primary Volume Descriptor at sector 16. ASCII identifiers.
fn write_pvd(iso: &mut [u8], volume_label: &str, total_sectors: u32) {
    let vd = &mut iso[PVD_SECTOR * SECTOR_SIZE..(PVD_SECTOR + 1) * SECTOR_SIZE];
    vd[0] = 1; // type: primary
    vd[8..40].fill(b' '); // system identifier
    vd[40..72].fill(b' '); // volume identifier
    vd[40..40 + volume_label.len()].copy_from_slice(volume_label.as_bytes());
    fill_descriptor_common(
        vd,
        total_sectors,
        PRIMARY_PT_L_SECTOR as u32,
        PRIMARY_PT_M_SECTOR as u32,
        PRIMARY_ROOT_SECTOR as u32,
    );
}

/// Joliet Supplementary Volume Descriptor at sector 17. Identifiers in
/// UCS-2 big-endian; the escape sequence `%/E` declares UCS-2 Level 3.
fn write_svd(iso: &mut [u8], volume_label: &str, total_sectors: u32) {
    let vd = &mut iso[SVD_SECTOR * SECTOR_SIZE..(SVD_SECTOR + 1) * SECTOR_SIZE];
    vd[0] = 2; // type: supplementary

    // System and volume identifiers hold 16 UCS-2 characters each,
    // padded with UCS-2 spaces.
    for pair in vd[8..72].chunks_exact_mut(2) {
        pair[0] = 0x00;
        pair[1] = b' ';
    }
    let label = ucs2be(volume_label);
    vd[40..40 + label.len()].copy_from_slice(&label);

    vd[88..91].copy_from_slice(b"%/E");

    fill_descriptor_common(
        vd,
        total_sectors,
        JOLIET_PT_L_SECTOR as u32,
        JOLIET_PT_M_SECTOR as u32,
        JOLIET_ROOT_SECTOR as u32,
    );
}

/// Volume Descriptor Set Terminator. Readers scan descriptors from sector
/// 16 until they hit type 255.
fn write_terminator(iso: &mut [u8]) {
    let vd = &mut iso[TERMINATOR_SECTOR * SECTOR_SIZE..(TERMINATOR_SECTOR + 1) * SECTOR_SIZE];
    vd[0] = 255;
    vd[1..6].copy_from_slice(b"CD001");
    vd[6] = 1;
}

/// One-entry path table: just the root directory. The spec requires both a
/// little-endian (L) and big-endian (M) copy.
fn write_path_table(iso: &mut [u8], sector: usize, root_extent: u32, little_endian: bool) {
    let buf = &mut iso[sector * SECTOR_SIZE..];
    buf[0] = 1; // identifier length
    buf[1] = 0; // extended attribute length
    if little_endian {
        buf[2..6].copy_from_slice(&root_extent.to_le_bytes());
        buf[6..8].copy_from_slice(&1u16.to_le_bytes());
    } else {
        buf[2..6].copy_from_slice(&root_extent.to_be_bytes());
        buf[6..8].copy_from_slice(&1u16.to_be_bytes());
    }
    buf[8] = 0x00; // root identifier
    buf[9] = 0x00; // pad to even length
}

/// Write a root directory extent: `.`, `..`, then one record per file.
/// The identifiers differ between hierarchies; extents are shared.
fn write_root_directory(
    iso: &mut [u8],
    sector: usize,
    idents: &[Vec<u8>],
    extents: &[(usize, usize)],
) {
    let self_extent = sector as u32;
    let mut pos = sector * SECTOR_SIZE;

    for special in [&[0x00u8][..], &[0x01u8][..]] {
        let rec = dir_record(self_extent, SECTOR_SIZE as u32, special, true);
        iso[pos..pos + rec.len()].copy_from_slice(&rec);
        pos += rec.len();
    }

    for (ident, &(extent, size)) in idents.iter().zip(extents) {
        let rec = dir_record(extent as u32, size as u32, ident, false);
        assert!(
            pos + rec.len() <= (sector + 1) * SECTOR_SIZE,
            "root directory overflows one sector"
        );
        iso[pos..pos + rec.len()].copy_from_slice(&rec);
        pos += rec.len();
    }
}

/// Build a directory record. The identifier is raw bytes: ASCII for the
/// primary hierarchy, UCS-2 for Joliet; a pad byte keeps the record length
/// even as ECMA-119 requires.
fn dir_record(extent: u32, size: u32, ident: &[u8], is_dir: bool) -> Vec<u8> {
    let pad = if ident.len() % 2 == 0 { 1 } else { 0 };
    let len = 33 + ident.len() + pad;
    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    put_u32_both(&mut rec[2..10], extent);
    put_u32_both(&mut rec[10..18], size);
    rec[25] = if is_dir { 0x02 } else { 0x00 }; // file flags
    put_u16_both(&mut rec[28..32], 1); // volume sequence number
    rec[32] = ident.len() as u8;
    rec[33..33 + ident.len()].copy_from_slice(ident);
    rec
}

/// Encode a name as UCS-2 big-endian for the Joliet hierarchy.
fn ucs2be(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() * 2);
    for c in name.chars() {
        out.push(0x00);
        out.push(c as u8);
    }
    out
}

/// Mangle a name to ISO 9660 Level 1 (8.3 uppercase, `;1` version) for the
/// primary hierarchy. Joliet-unaware readers see these; everyone else uses
/// the UCS-2 names.
fn level1_name(name: &str) -> String {
    let sanitized: String = name
        .to_ascii_uppercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    match sanitized.find('.') {
        Some(dot) => {
            let base = &sanitized[..dot.min(8)];
            let ext = &sanitized[dot + 1..(dot + 4).min(sanitized.len())];
            format!("{base}.{ext};1")
        }
        None => {
            let base = &sanitized[..sanitized.len().min(8)];
            format!("{base};1")
        }
    }
}

/// Sectors needed for `bytes` of data; empty files still occupy one sector.
fn sectors_for(bytes: usize) -> usize {
    if bytes == 0 { 1 } else { bytes.div_ceil(SECTOR_SIZE) }
}

/// ECMA-119 both-endian u32: little-endian then big-endian.
fn put_u32_both(buf: &mut [u8], val: u32) {
    buf[0..4].copy_from_slice(&val.to_le_bytes());
    buf[4..8].copy_from_slice(&val.to_be_bytes());
}

/// ECMA-119 both-endian u16.
fn put_u16_both(buf: &mut [u8], val: u16) {
    buf[0..2].copy_from_slice(&val.to_le_bytes());
    buf[2..4].copy_from_slice(&val.to_be_bytes());
}
