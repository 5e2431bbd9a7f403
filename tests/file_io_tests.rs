//! End-to-end file content tests: round trips, size translation, sparse
//! files, and integrity failures through the full node stack.

mod common;

use common::harness::{fast_params, mount, mount_with, remount};
use veilfs::config::VolumeParams;
use veilfs::io::cipher::HEADER_SIZE;

fn mac_params() -> VolumeParams {
    VolumeParams {
        block_mac_bytes: 8,
        allow_holes: false,
        ..fast_params()
    }
}

#[test]
fn write_then_read_with_mac_and_header() {
    let m = mount(mac_params());
    m.root.mkdir("/a", 0o755, 0, 0).unwrap();

    let contents = vec![0x41u8; 3000];
    m.write_file("/a/b.txt", &contents);

    let node = m.root.open_node("/a/b.txt", false).unwrap();
    assert_eq!(node.get_size().unwrap(), 3000);
    m.ctx.erase_node("/a/b.txt", &node);

    // stored form: 8-byte file IV header, then per-block 8-byte MACs over
    // 1016-byte payloads; 3000 bytes span three stored blocks
    let stored = std::fs::metadata(m.backing_path("/a/b.txt")).unwrap().len();
    assert_eq!(stored, HEADER_SIZE + 3000 + 3 * 8);

    assert_eq!(m.read_file("/a/b.txt"), contents);
}

#[test]
fn arbitrary_offset_round_trips() {
    let m = mount(mac_params());

    let node = m.create("/scatter.bin");
    let pattern: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();

    // offsets chosen to hit aligned, unaligned, and block-spanning cases
    for &offset in &[0u64, 1, 500, 1015, 1016, 1017, 2000, 5000] {
        node.write(offset, &pattern).unwrap();
        let mut buf = vec![0u8; pattern.len()];
        assert_eq!(node.read(offset, &mut buf).unwrap(), pattern.len());
        assert_eq!(buf, pattern, "round trip at offset {offset}");
    }
    m.ctx.erase_node("/scatter.bin", &node);
}

#[test]
fn interleaved_partial_overwrites() {
    let m = mount(mac_params());
    let node = m.create("/patch.bin");

    let mut expected = vec![0u8; 3000];
    node.write(0, &vec![1u8; 3000]).unwrap();
    expected.fill(1);

    for (offset, len, value) in [(10u64, 5usize, 2u8), (1000, 600, 3), (2999, 1, 4), (1500, 8, 5)]
    {
        node.write(offset, &vec![value; len]).unwrap();
        expected[offset as usize..offset as usize + len].fill(value);
    }

    let mut buf = vec![0u8; 3000];
    node.read(0, &mut buf).unwrap();
    assert_eq!(buf, expected);
    m.ctx.erase_node("/patch.bin", &node);
}

#[test]
fn empty_file_has_size_zero() {
    let m = mount(mac_params());
    let node = m.create("/empty");
    assert_eq!(node.get_size().unwrap(), 0);

    let mut buf = [0u8; 16];
    assert_eq!(node.read(0, &mut buf).unwrap(), 0);
    m.ctx.erase_node("/empty", &node);
}

#[test]
fn byte_at_offset_defines_size_and_zero_fill() {
    let m = mount(mac_params());
    let node = m.create("/tail");

    let n = 2500u64;
    node.write(n, &[0x7F]).unwrap();
    assert_eq!(node.get_size().unwrap(), n + 1);

    let mut buf = vec![0xFFu8; n as usize];
    assert_eq!(node.read(0, &mut buf).unwrap(), n as usize);
    assert!(buf.iter().all(|&b| b == 0), "gap reads back as zeros");
    m.ctx.erase_node("/tail", &node);
}

#[test]
fn corrupted_block_fails_with_ebadmsg() {
    let m = mount(mac_params());
    let contents = vec![0x41u8; 3000];
    m.write_file("/victim", &contents);
    let stored_path = m.backing_path("/victim");

    // flip a data byte inside the second stored block
    let mut raw = std::fs::read(&stored_path).unwrap();
    let second_block = (HEADER_SIZE + 1024 + 20) as usize;
    raw[second_block] ^= 0x01;
    std::fs::write(&stored_path, &raw).unwrap();

    let m = remount(m, |_| {});
    let node = m.root.open_node("/victim", false).unwrap();
    let mut buf = vec![0u8; 3000];

    // the first block is intact
    assert_eq!(node.read(0, &mut buf[..1016]).unwrap(), 1016);
    // the corrupted one fails
    let err = node.read(1016, &mut buf[..1016]).unwrap_err();
    assert_eq!(err.to_errno(), libc::EBADMSG);
    m.ctx.erase_node("/victim", &node);

    // forceDecode downgrades the failure to a warning
    let m = remount(m, |opts| opts.force_decode = true);
    let node = m.root.open_node("/victim", false).unwrap();
    let mut buf = vec![0u8; 3000];
    assert_eq!(node.read(0, &mut buf).unwrap(), 3000);
    assert_ne!(buf, contents, "damaged block decrypts to different bytes");
    m.ctx.erase_node("/victim", &node);
}

#[test]
fn sparse_files_stay_sparse_and_read_as_zeros() {
    let params = VolumeParams {
        allow_holes: true,
        block_mac_bytes: 0,
        ..fast_params()
    };
    let m = mount(params);

    let node = m.create("/holey");
    let offset = 10 * 1024u64;
    node.write(offset, &[0xAA]).unwrap();
    assert_eq!(node.get_size().unwrap(), offset + 1);

    // interior blocks are zero on the backing store
    let raw = std::fs::read(m.backing_path("/holey")).unwrap();
    let interior = &raw[(HEADER_SIZE + 1024) as usize..(HEADER_SIZE + 2048) as usize];
    assert!(interior.iter().all(|&b| b == 0), "hole must stay zeros");

    // and the reader sees plaintext zeros, no decrypt failure
    let mut buf = vec![0xFFu8; 1024];
    assert_eq!(node.read(1024, &mut buf).unwrap(), 1024);
    assert!(buf.iter().all(|&b| b == 0));
    m.ctx.erase_node("/holey", &node);
}

#[test]
fn without_holes_gap_is_encrypted_zeros() {
    let m = mount(mac_params());
    let node = m.create("/dense");
    node.write(5000, &[1u8]).unwrap();
    m.ctx.erase_node("/dense", &node);

    // every stored block is materialized ciphertext
    let raw = std::fs::read(m.backing_path("/dense")).unwrap();
    let body = &raw[HEADER_SIZE as usize..];
    assert!(
        !body.iter().all(|&b| b == 0),
        "no-holes mode must write real ciphertext"
    );
    assert_eq!(raw.len() as u64, HEADER_SIZE + 5001 + 5 * 8);
}

#[test]
fn truncate_then_extend_round_trips() {
    let m = mount(mac_params());
    let node = m.create("/resize");

    let data: Vec<u8> = (0..3000).map(|i| (i % 256) as u8).collect();
    node.write(0, &data).unwrap();
    node.sync(false).unwrap();

    node.truncate(1500).unwrap();
    assert_eq!(node.get_size().unwrap(), 1500);

    node.truncate(2200).unwrap();
    assert_eq!(node.get_size().unwrap(), 2200);

    let mut buf = vec![0u8; 2200];
    assert_eq!(node.read(0, &mut buf).unwrap(), 2200);
    assert_eq!(&buf[..1500], &data[..1500]);
    assert!(buf[1500..].iter().all(|&b| b == 0));
    m.ctx.erase_node("/resize", &node);
}

#[test]
fn contents_survive_a_remount() {
    let m = mount(mac_params());
    let data: Vec<u8> = (0..10_000).map(|i| (i * 31 % 256) as u8).collect();
    m.write_file("/persist.dat", &data);

    let m = remount(m, |_| {});
    assert_eq!(m.read_file("/persist.dat"), data);
}

#[test]
fn reverse_mode_exposes_deterministic_ciphertext() {
    // a plaintext tree, viewed encrypted, without persisting anything
    let plain_dir = tempfile::tempdir().unwrap();
    std::fs::write(plain_dir.path().join("doc.txt"), b"attack at dawn").unwrap();

    let (config, cipher, volume_key) =
        veilfs::config::create_volume(&fast_params(), common::harness::TEST_PASSWORD).unwrap();

    let opts = veilfs::MountOpts {
        root_dir: plain_dir.path().to_path_buf(),
        reverse_encryption: true,
        ..veilfs::MountOpts::default()
    };
    let runtime = veilfs::FsRuntime::new(config, opts.clone(), cipher, volume_key).unwrap();
    let ctx = veilfs::Context::new(std::sync::Arc::new(opts));
    let root = veilfs::DirNode::new(&ctx, plain_dir.path().to_path_buf(), runtime);
    ctx.set_root(std::sync::Arc::clone(&root));

    // listing shows ciphertext names that decode back to the original
    let mut traverse = root.open_dir("/").unwrap();
    let cipher_name = traverse.next_plaintext_name().expect("one entry");
    assert_ne!(cipher_name, "doc.txt");
    assert!(traverse.next_plaintext_name().is_none());

    // opening the ciphertext name yields encrypted contents behind the
    // synthesized header
    let mount_path = format!("/{cipher_name}");
    let node = root.open_node(&mount_path, false).unwrap();
    let size = node.get_size().unwrap();
    assert_eq!(size, 14 + 8);

    let mut view = vec![0u8; size as usize];
    assert_eq!(node.read(0, &mut view).unwrap(), size as usize);
    assert_ne!(&view[8..], b"attack at dawn");

    // the header is a pure function of the backing inode
    let mut header_again = vec![0u8; 8];
    node.read(0, &mut header_again).unwrap();
    assert_eq!(&view[..8], &header_again[..]);

    // nothing may be written through a reverse mount
    assert!(node.write(0, b"nope").is_err());
    ctx.erase_node(&mount_path, &node);

    // the backing tree was left untouched
    assert_eq!(
        std::fs::read(plain_dir.path().join("doc.txt")).unwrap(),
        b"attack at dawn"
    );
}

#[test]
fn blowfish_volume_round_trips() {
    let params = VolumeParams {
        cipher: "Blowfish".into(),
        key_size_bits: 160,
        block_size: 1024,
        ..fast_params()
    };
    let m = mount_with(params, |_| {});
    let data: Vec<u8> = (0..5000).map(|i| (i * 7 % 256) as u8).collect();
    m.write_file("/bf.bin", &data);
    assert_eq!(m.read_file("/bf.bin"), data);
}

#[test]
fn camellia_volume_round_trips() {
    let params = VolumeParams {
        cipher: "CAMELLIA".into(),
        key_size_bits: 256,
        ..fast_params()
    };
    let m = mount_with(params, |_| {});
    let data = vec![0x5Au8; 2048];
    m.write_file("/cm.bin", &data);
    assert_eq!(m.read_file("/cm.bin"), data);
}
