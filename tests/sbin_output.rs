// End-to-end assembly into SBIN binary files.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use sbasm::assembler::{run_with_cli, Cli};
use sbasm::imagestore::IO_SPACE_SIZE;

/// Create a unique scratch directory under `target/`.
fn scratch_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join(format!("sbin-test-{tag}-{}-{}", process::id(), nanos));
    fs::create_dir_all(&dir).expect("create scratch directory");
    dir
}

fn header_field(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

#[test]
fn assembles_program_to_sbin_file() {
    let dir = scratch_dir("basic");
    let src_path = dir.join("prog.s");
    let out_base = dir.join("prog").to_string_lossy().to_string();
    fs::write(
        &src_path,
        concat!(
            "# store a constant to the stack and read it back\n",
            "main:\n",
            "    addiu $sp, $sp, -8\n",
            "    addiu $2, $0, 5\n",
            "    sw $2, 4($sp)\n",
            "    lw $3, 4($sp)\n",
            "    nop\n",
        ),
    )
    .expect("write source");

    let cli = Cli::parse_from([
        "sbasm",
        "-i",
        src_path.to_str().unwrap(),
        "-o",
        out_base.as_str(),
    ]);
    let reports = run_with_cli(&cli).expect("assembly should succeed");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].error_count(), 0);

    let bin = fs::read(format!("{out_base}.bin")).expect("binary output exists");
    let program_len = (bin.len() - 16) as u32;
    assert_eq!(program_len, IO_SPACE_SIZE as u32 + 5 * 4);

    assert_eq!(&bin[0..4], b"SBIN");
    // Entry point is main, directly after the I/O window.
    assert_eq!(header_field(&bin, 4), IO_SPACE_SIZE as u32);
    assert_eq!(header_field(&bin, 8), program_len + 1024);
    assert_eq!(header_field(&bin, 12), program_len + 1024);

    // I/O window is zero-filled, then the instruction words follow
    // big-endian.
    let image = &bin[16..];
    assert!(image[..IO_SPACE_SIZE].iter().all(|&b| b == 0));
    let code = &image[IO_SPACE_SIZE..];
    assert_eq!(&code[0..4], &[0x27, 0xBD, 0xFF, 0xF8]);
    assert_eq!(&code[4..8], &[0x24, 0x02, 0x00, 0x05]);
    assert_eq!(&code[8..12], &[0xAF, 0xA2, 0x00, 0x04]);
    assert_eq!(&code[12..16], &[0x8F, 0xA3, 0x00, 0x04]);
    assert_eq!(&code[16..20], &[0x00, 0x00, 0x00, 0x00]);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn header_honors_stack_heap_and_entry_options() {
    let dir = scratch_dir("options");
    let src_path = dir.join("prog.s");
    let out_base = dir.join("prog").to_string_lossy().to_string();
    fs::write(
        &src_path,
        concat!(
            "start:\n",
            "    lui $2, %hi(value)\n",
            "    addiu $2, $2, %lo(value)\n",
            "value:\n",
            "    .word 42\n",
        ),
    )
    .expect("write source");

    let cli = Cli::parse_from([
        "sbasm",
        "-i",
        src_path.to_str().unwrap(),
        "-o",
        out_base.as_str(),
        "-e",
        "start",
        "-s",
        "2048",
        "-H",
        "512",
    ]);
    run_with_cli(&cli).expect("assembly should succeed");

    let bin = fs::read(format!("{out_base}.bin")).expect("binary output exists");
    let program_len = (bin.len() - 16) as u32;
    assert_eq!(program_len, IO_SPACE_SIZE as u32 + 3 * 4);
    assert_eq!(header_field(&bin, 4), IO_SPACE_SIZE as u32);
    assert_eq!(header_field(&bin, 8), program_len + 2048);
    assert_eq!(header_field(&bin, 12), program_len + 2048 + 512);

    // The forward-referenced data word is little-endian, after the two
    // big-endian instruction words.
    let code = &bin[16 + IO_SPACE_SIZE..];
    assert_eq!(&code[8..12], &[42, 0, 0, 0]);
    // %lo(value) lands in the addiu immediate.
    let value_addr = IO_SPACE_SIZE as u32 + 8;
    let imm = u16::from_be_bytes(code[6..8].try_into().unwrap());
    assert_eq!(u32::from(imm), value_addr & 0xffff);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn source_errors_block_binary_output() {
    let dir = scratch_dir("errors");
    let src_path = dir.join("bad.s");
    let out_base = dir.join("bad").to_string_lossy().to_string();
    fs::write(&src_path, "main:\n    addiu $2, $0, missing\n").expect("write source");

    let cli = Cli::parse_from(["sbasm", "-i", src_path.to_str().unwrap(), "-o", out_base.as_str()]);
    let err = run_with_cli(&cli).expect_err("assembly should fail");
    assert_eq!(err.diagnostics().len(), 1);
    assert_eq!(err.diagnostics()[0].line(), 2);
    assert!(!PathBuf::from(format!("{out_base}.bin")).exists());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_entry_label_is_fatal() {
    let dir = scratch_dir("entry");
    let src_path = dir.join("noentry.s");
    let out_base = dir.join("noentry").to_string_lossy().to_string();
    fs::write(&src_path, "start:\n    nop\n").expect("write source");

    let cli = Cli::parse_from(["sbasm", "-i", src_path.to_str().unwrap(), "-o", out_base.as_str()]);
    let err = run_with_cli(&cli).expect_err("missing entry label should be fatal");
    assert!(err.to_string().contains("Entry label not found"));
    assert!(!PathBuf::from(format!("{out_base}.bin")).exists());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn listing_file_is_written_on_request() {
    let dir = scratch_dir("listing");
    let src_path = dir.join("prog.s");
    let out_base = dir.join("prog").to_string_lossy().to_string();
    fs::write(&src_path, "main:\n    addiu $2, $0, 5\n").expect("write source");

    let cli = Cli::parse_from([
        "sbasm",
        "-i",
        src_path.to_str().unwrap(),
        "-o",
        out_base.as_str(),
        "-l",
    ]);
    run_with_cli(&cli).expect("assembly should succeed");

    let listing = fs::read_to_string(format!("{out_base}.lst")).expect("listing output exists");
    assert!(listing.contains("ADDR"));
    assert!(listing.contains("24 02 00 05"));
    assert!(listing.contains("SYMBOL TABLE"));
    assert!(listing.contains("main"));

    fs::remove_dir_all(&dir).ok();
}
