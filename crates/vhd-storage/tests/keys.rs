#![cfg(not(target_arch = "wasm32"))]

use std::fs;
use std::path::Path;

use vhd_storage::chain::{find_keyed_image, open_crypto, ImageChain};
use vhd_storage::crypto::{check_key, Key, KeyDirs, KeyHash, Keystore, SectorCipher};
use vhd_storage::device::FileDevice;
use vhd_storage::{CreateOptions, ErrorClass, OpenMode, VhdError, VhdImage, SECTOR_SIZE};

const CAP: u64 = 1024 * 1024;
const BLOCK: u32 = 64 * 1024;

fn dynamic(path: &Path) -> VhdImage<FileDevice> {
    VhdImage::create(path, &CreateOptions::dynamic(CAP).with_block_size(BLOCK)).unwrap()
}

fn keyfile(dir: &Path, stem: &str, bytes: &[u8]) {
    let bits = bytes.len() * 8;
    fs::write(dir.join(format!("{stem},aes-xts-plain,{bits}.key")), bytes).unwrap();
}

fn key(byte: u8, len: usize) -> Key {
    Key::new(vec![byte; len]).unwrap()
}

#[test]
fn keyhash_accepts_only_its_key() {
    let good = key(0x61, 64);
    let nonce = [7u8; 32];
    let hash = KeyHash::calculate(good.as_bytes(), nonce);
    assert!(hash.is_present());
    check_key(&good, &hash).unwrap();

    let err = check_key(&key(0x62, 64), &hash).unwrap_err();
    assert!(matches!(err, VhdError::BadKey));
    assert_eq!(err.class(), ErrorClass::Key);
}

#[test]
fn keyhash_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vhd");
    let mut img = dynamic(&path);
    let recorded = img.set_key(&key(3, 32)).unwrap();
    img.close().unwrap();

    let img = VhdImage::open_path(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(img.keyhash(), recorded);
    check_key(&key(3, 32), &img.keyhash()).unwrap();
}

#[test]
fn larger_keyfile_is_preferred() {
    let dir = tempfile::tempdir().unwrap();
    let keys = dir.path().join("keys");
    fs::create_dir(&keys).unwrap();
    let path = dir.path().join("disk.vhd");

    let mut img = dynamic(&path);
    img.set_key(&key(0x20, 64)).unwrap();
    img.close().unwrap();
    keyfile(&keys, "disk", &[0x10; 32]);
    keyfile(&keys, "disk", &[0x20; 64]);

    let mut img = VhdImage::open_path(&path, OpenMode::ReadOnly).unwrap();
    let dirs = KeyDirs::new(vec![keys]);
    let found = find_keyed_image(&mut img, Some(&dirs), &mut Keystore::new())
        .unwrap()
        .unwrap();
    assert_eq!(found.key.bits(), 512);
}

#[test]
fn later_directories_are_searched() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty");
    let keys = dir.path().join("keys");
    fs::create_dir(&empty).unwrap();
    fs::create_dir(&keys).unwrap();
    let path = dir.path().join("disk.vhd");

    let mut img = dynamic(&path);
    img.set_key(&key(0x33, 32)).unwrap();
    img.close().unwrap();
    keyfile(&keys, "disk", &[0x33; 32]);

    let list = format!("{},{}", empty.display(), keys.display());
    let mut img = VhdImage::open_path(&path, OpenMode::ReadOnly).unwrap();
    let found = find_keyed_image(&mut img, Some(&KeyDirs::parse(&list)), &mut Keystore::new())
        .unwrap();
    assert!(found.is_some());
}

#[test]
fn keyfile_for_a_clear_image_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let keys = dir.path().join("keys");
    fs::create_dir(&keys).unwrap();
    let path = dir.path().join("clear.vhd");
    dynamic(&path).close().unwrap();
    keyfile(&keys, "clear", &[1; 32]);

    let mut img = VhdImage::open_path(&path, OpenMode::ReadOnly).unwrap();
    let err = find_keyed_image(&mut img, Some(&KeyDirs::new(vec![keys])), &mut Keystore::new())
        .unwrap_err();
    assert!(matches!(err, VhdError::UnexpectedKey(_)), "{err}");
}

#[test]
fn wrong_keyfile_is_a_bad_key() {
    let dir = tempfile::tempdir().unwrap();
    let keys = dir.path().join("keys");
    fs::create_dir(&keys).unwrap();
    let path = dir.path().join("disk.vhd");
    let mut img = dynamic(&path);
    img.set_key(&key(1, 32)).unwrap();
    img.close().unwrap();
    keyfile(&keys, "disk", &[2; 32]);

    let mut img = VhdImage::open_path(&path, OpenMode::ReadOnly).unwrap();
    let err = find_keyed_image(&mut img, Some(&KeyDirs::new(vec![keys])), &mut Keystore::new())
        .unwrap_err();
    assert!(matches!(err, VhdError::BadKey));
}

#[test]
fn keystore_covers_images_without_keyfiles() {
    let dir = tempfile::tempdir().unwrap();
    let keys = dir.path().join("keys");
    fs::create_dir(&keys).unwrap();
    let first = dir.path().join("first.vhd");
    let second = dir.path().join("second.vhd");

    let k = key(0x44, 64);
    let mut a = dynamic(&first);
    let kh = a.set_key(&k).unwrap();
    a.close().unwrap();
    // The second image shares the keyhash but has no keyfile of its own.
    let mut b = dynamic(&second);
    b.set_keyhash(&kh).unwrap();
    b.close().unwrap();
    keyfile(&keys, "first", k.as_bytes());

    let dirs = KeyDirs::new(vec![keys]);
    let mut store = Keystore::new();

    let mut b = VhdImage::open_path(&second, OpenMode::ReadOnly).unwrap();
    let err = find_keyed_image(&mut b, Some(&dirs), &mut store).unwrap_err();
    assert!(matches!(err, VhdError::NoKey(_)));

    let mut a = VhdImage::open_path(&first, OpenMode::ReadOnly).unwrap();
    find_keyed_image(&mut a, Some(&dirs), &mut store).unwrap().unwrap();
    assert_eq!(store.len(), 1);

    let found = find_keyed_image(&mut b, Some(&dirs), &mut store).unwrap().unwrap();
    assert_eq!(found.key.as_bytes(), k.as_bytes());
}

#[test]
fn encrypted_chain_reads_back_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let keys = dir.path().join("keys");
    fs::create_dir(&keys).unwrap();
    let base = dir.path().join("base.vhd");
    let top = dir.path().join("top.vhd");
    let k = key(0x5c, 64);
    keyfile(&keys, "base", k.as_bytes());
    let dirs = KeyDirs::new(vec![keys]);

    let mut b = dynamic(&base);
    b.set_key(&k).unwrap();
    b.bind_cipher(SectorCipher::new(&k).unwrap());
    b.write_sectors(10, &[0xaa; SECTOR_SIZE]).unwrap();
    b.close().unwrap();

    // The stored sector is ciphertext.
    let mut raw = VhdImage::open_path(&base, OpenMode::ReadOnly).unwrap();
    let mut stored = vec![0u8; SECTOR_SIZE];
    raw.read_sectors(10, &mut stored).unwrap();
    assert_ne!(stored, vec![0xaa; SECTOR_SIZE]);
    drop(raw);

    let mut t = VhdImage::snapshot(&top, &base).unwrap();
    let mut store = Keystore::new();
    let kh = open_crypto(&mut t, Some(&dirs), &mut store).unwrap();
    assert!(kh.is_some());
    t.write_sectors(11, &[0xbb; SECTOR_SIZE]).unwrap();
    t.close().unwrap();

    let leaf = VhdImage::open_path(&top, OpenMode::ReadOnly).unwrap();
    let mut chain = ImageChain::open(leaf).unwrap();
    chain.open_crypto(Some(&dirs), &mut Keystore::new()).unwrap();
    let mut buf = vec![0u8; 2 * SECTOR_SIZE];
    chain.read_sectors(10, &mut buf).unwrap();
    assert!(buf[..SECTOR_SIZE].iter().all(|b| *b == 0xaa));
    assert!(buf[SECTOR_SIZE..].iter().all(|b| *b == 0xbb));
}

#[test]
fn encrypted_chain_without_key_dirs_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.vhd");
    let mut b = dynamic(&base);
    b.set_key(&key(9, 32)).unwrap();
    b.close().unwrap();

    let mut img = VhdImage::open_path(&base, OpenMode::ReadOnly).unwrap();
    let err = open_crypto(&mut img, None, &mut Keystore::new()).unwrap_err();
    assert!(matches!(err, VhdError::NoKey(_)));
    assert!(img.cipher().is_none());
}
