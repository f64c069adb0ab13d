// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

mod common;

use chirp_common::{OtaResult, Response, FLASH_SECTOR_SIZE};
use chirp_ota::burn::FlashBurner;
use chirp_ota::{OtaError, OtaUserId};
use common::*;
use pretty_assertions::assert_eq;

const USER: OtaUserId = OtaUserId::Firmware;

fn fresh_burner() -> (FlashBurner, SharedFlash) {
    let mut burner = FlashBurner::new();
    burner.bind(USER, FIRMWARE_REGION_LEN);
    (burner, SharedFlash::new())
}

fn erased_offsets(flash: &SharedFlash, since: usize) -> Vec<u32> {
    flash.0.borrow().ops[since..]
        .iter()
        .filter_map(|op| match op {
            FlashOp::Erase(u, o) if *u == USER => Some(*o),
            _ => None,
        })
        .collect()
}

#[test]
fn flush_touches_exactly_the_covered_sectors() {
    // (offset, length) -> expected erased sector offsets
    let cases: &[(u32, usize, &[u32])] = &[
        (0, 4096, &[0]),
        (8192, 2048, &[8192]),
        (0, 4096 + 1, &[0, 4096]),
    ];
    for &(offset, len, expected) in cases {
        let (mut burner, mut flash) = fresh_burner();
        let mut staged = 0;
        while staged < len {
            staged += burner.stage(&vec![0xA5; len - staged]);
            if burner.is_full() && staged < len {
                burner.flush(&mut flash, offset).unwrap();
            }
        }
        // drive everything through one logical write
        burner
            .flush(&mut flash, offset + (staged - burner.fill()) as u32)
            .unwrap();
        let erased = erased_offsets(&flash, 0);
        let mut unique = erased.clone();
        unique.dedup();
        assert_eq!(erased, unique, "no sector erased twice for {offset}+{len}");
        assert_eq!(erased, expected, "sectors for {offset}+{len}");
    }
}

#[test]
fn unaligned_flush_programs_the_pre_chunk_without_an_erase() {
    let (mut burner, mut flash) = fresh_burner();

    // first partial flush erases sector 0 and leaves the cursor at 1000
    burner.stage(&[0x11; 1000]);
    assert_eq!(burner.flush(&mut flash, 0).unwrap(), 1000);
    assert_eq!(erased_offsets(&flash, 0), vec![0]);

    // next window starts mid-sector: only the newly entered sector erases
    let before = flash.0.borrow().ops.len();
    burner.stage(&[0x22; 4096]);
    assert_eq!(burner.flush(&mut flash, 1000).unwrap(), 4096);
    assert_eq!(erased_offsets(&flash, before), vec![FLASH_SECTOR_SIZE]);

    let mem = flash.0.borrow();
    let region = mem.region(USER);
    assert!(region[..1000].iter().all(|&b| b == 0x11));
    assert!(region[1000..5096].iter().all(|&b| b == 0x22));
    assert!(region[5096..8192].iter().all(|&b| b == 0xFF));
}

#[test]
fn rollback_erases_the_failed_span_but_keeps_confirmed_bytes() {
    let (mut burner, mut flash) = fresh_burner();

    // confirmed: [0, 5120)
    burner.stage(&[0x33; 4096]);
    burner.flush(&mut flash, 0).unwrap();
    burner.stage(&[0x44; 1024]);
    burner.flush(&mut flash, 4096).unwrap();

    // failed segment: [5120, 7168)
    burner.stage(&[0x55; 2048]);
    burner.flush(&mut flash, 5120).unwrap();

    burner.rollback(&mut flash, 5120, 7168).unwrap();

    let mem = flash.0.borrow();
    let region = mem.region(USER);
    assert!(region[..4096].iter().all(|&b| b == 0x33));
    assert!(region[4096..5120].iter().all(|&b| b == 0x44));
    assert!(
        region[5120..8192].iter().all(|&b| b == 0xFF),
        "failed span must be blank for the retransmission"
    );
}

#[test]
fn rollback_with_nothing_written_is_a_no_op() {
    let (mut burner, mut flash) = fresh_burner();
    burner.stage(&[0x66; 100]);
    burner.rollback(&mut flash, 4096, 4096).unwrap();
    assert_eq!(burner.fill(), 0, "buffered bytes are discarded");
    assert!(flash.0.borrow().ops.is_empty());
}

#[test]
fn flush_past_the_region_is_a_bounds_error() {
    let (mut burner, mut flash) = fresh_burner();
    burner.stage(&[0x77; 512]);
    let at = FIRMWARE_REGION_LEN - 256;
    assert_eq!(burner.flush(&mut flash, at), Err(OtaError::FlashBounds(at)));
}

#[test]
fn a_clean_transfer_erases_every_image_sector_exactly_once() {
    let mut h = harness();
    let image = make_image(16 * 1024);
    let rsp = transfer_image(&mut h, &image, 4096);
    assert_eq!(
        rsp,
        Response::ResultRsp {
            result: OtaResult::Ok as u8
        }
    );
    let flash = h.flash.0.borrow();
    for sector in (0..16 * 1024).step_by(FLASH_SECTOR_SIZE as usize) {
        assert_eq!(
            flash.erase_count(OtaUserId::Firmware, sector as u32),
            1,
            "sector 0x{sector:x}"
        );
    }
}
