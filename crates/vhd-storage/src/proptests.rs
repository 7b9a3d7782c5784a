use crate::bitmap::test_bit;
use crate::device::MemDevice;
use crate::format::{DiskType, Footer};
use crate::{CreateOptions, VhdImage, SECTOR_SIZE};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { first: u64, len: u64, fill: u8 },
    Read { first: u64, len: u64 },
    Reopen,
}

const CAP_SECTORS: u64 = 1024; // 512 KiB
const BLOCK_SIZE: u32 = 16 * 1024;
const SPB: u64 = BLOCK_SIZE as u64 / SECTOR_SIZE as u64;
const MAX_RUN: u64 = 80;
const MAX_OPS: usize = 40;

fn range_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0..CAP_SECTORS).prop_flat_map(|first| (Just(first), 1..=MAX_RUN.min(CAP_SECTORS - first)))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (range_strategy(), any::<u8>())
            .prop_map(|((first, len), fill)| Op::Write { first, len, fill }),
        3 => range_strategy().prop_map(|(first, len)| Op::Read { first, len }),
        1 => Just(Op::Reopen),
    ]
}

fn reopen(img: VhdImage<MemDevice>) -> VhdImage<MemDevice> {
    let bytes = img.into_device().into_vec();
    VhdImage::open(MemDevice::from_vec(bytes)).unwrap()
}

fn check_against_model(ops: Vec<Op>) -> TestCaseResult {
    let opts = CreateOptions::dynamic(CAP_SECTORS * SECTOR_SIZE as u64).with_block_size(BLOCK_SIZE);
    let mut img = VhdImage::create_on(MemDevice::new(), &opts).unwrap();
    let mut model = vec![0u8; CAP_SECTORS as usize * SECTOR_SIZE];
    let mut written = vec![false; CAP_SECTORS as usize];
    let mut first_touch: Vec<u32> = Vec::new();

    for op in ops {
        match op {
            Op::Write { first, len, fill } => {
                for block in (first / SPB)..=((first + len - 1) / SPB) {
                    if !first_touch.contains(&(block as u32)) {
                        first_touch.push(block as u32);
                    }
                }
                let buf = vec![fill; len as usize * SECTOR_SIZE];
                img.write_sectors(first, &buf).unwrap();
                let lo = first as usize * SECTOR_SIZE;
                model[lo..lo + buf.len()].copy_from_slice(&buf);
                written[first as usize..(first + len) as usize].fill(true);
            }
            Op::Read { first, len } => {
                let before = img.bat().allocated_count();
                let mut buf = vec![0xeeu8; len as usize * SECTOR_SIZE];
                img.read_sectors(first, &mut buf).unwrap();
                let lo = first as usize * SECTOR_SIZE;
                prop_assert_eq!(&buf[..], &model[lo..lo + buf.len()]);
                prop_assert_eq!(img.bat().allocated_count(), before);
            }
            Op::Reopen => img = reopen(img),
        }
    }

    // Blocks were appended in the order they were first written to.
    let mut last: Option<u32> = None;
    for &block in &first_touch {
        let entry = img.bat().get(block).unwrap();
        prop_assert!(entry.is_some(), "block {} lost its allocation", block);
        let entry = entry.unwrap_or_default();
        if let Some(prev) = last {
            let bm_secs = img.bm_secs().unwrap() as u32;
            prop_assert!(entry >= prev + bm_secs + SPB as u32, "block {} overlaps", block);
        }
        last = Some(entry);
    }
    prop_assert_eq!(img.bat().allocated_count(), first_touch.len() as u64);

    for &block in &first_touch {
        let bm = img.read_bitmap(block).unwrap();
        for i in 0..SPB {
            let sector = block as u64 * SPB + i;
            prop_assert_eq!(test_bit(&bm, i), written[sector as usize], "sector {}", sector);
        }
        let full = (0..SPB).all(|i| written[(block as u64 * SPB + i) as usize]);
        prop_assert_eq!(img.batmap_test(block), full);
    }

    let mut img = reopen(img);
    let mut all = vec![0u8; model.len()];
    img.read_sectors(0, &mut all).unwrap();
    prop_assert!(all == model, "contents differ after final reopen");
    Ok(())
}

fn disk_type_strategy() -> impl Strategy<Value = DiskType> {
    prop_oneof![
        Just(DiskType::Fixed),
        Just(DiskType::Dynamic),
        Just(DiskType::Differencing),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sparse_image_matches_model(ops in prop::collection::vec(op_strategy(), 1..MAX_OPS)) {
        check_against_model(ops)?;
    }

    #[test]
    fn footer_survives_serialization(
        sectors in 1u64..(1 << 31),
        disk_type in disk_type_strategy(),
        timestamp in any::<u32>(),
        saved in any::<bool>(),
    ) {
        let mut footer = Footer::new(disk_type, sectors * SECTOR_SIZE as u64);
        footer.timestamp = timestamp;
        footer.saved = saved as u8;
        let raw = footer.to_bytes();
        let parsed = Footer::parse(&raw).unwrap();
        prop_assert_eq!(&parsed, &footer);

        // A flipped bit in the size field is caught by the checksum.
        let mut bad = raw;
        bad[48] ^= 0x02;
        prop_assert!(Footer::parse(&bad).is_err());
    }
}
