extern crate std;

use std::vec::Vec;

use super::sim::{Nack, NoDelay, SimOis};
use super::*;
use crate::bus::RegisterBus;

const WIDE: u8 = 0x76 >> 1;

static UPDATE_CODE: [u8; 50] = [0x5A; 50];
static FROM_CODE: [u8; 256] = from_code();

const fn from_code() -> [u8; 256] {
    let mut img = [0u8; 256];
    let mut i = 0;
    while i < img.len() {
        img[i] = i as u8;
        i += 1;
    }
    // Embedded program memory image: 4 words.
    img[8] = 4;
    img[9] = 0;
    let sum = 0x0102_0304_0506_0708u64.to_le_bytes();
    let mut j = 0;
    while j < 8 {
        img[12 + j] = sum[j];
        j += 1;
    }
    img
}

static ENTRIES: [CodeEntry; 1] = [CodeEntry {
    index: 0x0701,
    update_code: &UPDATE_CODE,
    update_code_size: 10,
    update_code_checksum: 0x1122_3344_5566_7788,
    from_code: &FROM_CODE,
    from_code_size: 256,
    from_code_checksum: 0x00C0_FFEE,
    from_code_valid_size: 0x40,
}];

static TEMP_COMP: [TempCompensation; 1] = [TempCompensation {
    rcode_x: 0x1111_0001,
    rcode_y: 0x2222_0002,
    rcode_z: 0x3333_0003,
    shag: 4,
    shbg: 5,
    shcg: 6,
    shoutag: 7,
    shoutbg: 8,
    shab: 9,
    shac: 10,
    shaa: 11,
    shbb: 12,
    shbc: 13,
    shba: 14,
    shcb: 15,
    shcc: 16,
    shca: 17,
    tab: 18,
    tac: 19,
    taa: 20,
    tbb: 21,
    tbc: 22,
    tba: 23,
    temp_off: 0x7FFF_0000,
    tag: 24,
    tbg: 25,
    shiftg: 26,
    shoutag1: 27,
    shoutbg1: 28,
    tcx: 0x0C,
    tbx: 0x0B,
    tax: 0x0A,
}];

fn config() -> UpdateConfig {
    UpdateConfig::new(OisTarget::RearWide, 0x10, CodeTable::new(&ENTRIES), &TEMP_COMP)
}

/// Controller with stale firmware identifying as module 0x0701.
fn stale_module() -> SimOis {
    let mut sim = SimOis::new(0x10);
    sim.ram.insert(0x8004, 0x0001);
    sim.ram.insert(0x8008, 0x0000_0007);
    sim.pmem_sum = ENTRIES[0].update_code_checksum;
    sim.flash_sum = ENTRIES[0].from_code_checksum as u32;
    sim.flashed_version = 0x12;
    sim
}

fn ois(sim: &mut SimOis) -> Ois<&mut SimOis, NoDelay> {
    Ois::new(sim, NoDelay::default())
}

// ============================================================================
// Flash primitives
// ============================================================================

#[test]
fn out_of_range_requests_touch_nothing() {
    let mut sim = SimOis::new(WIDE);
    let mut o = ois(&mut sim);

    assert_eq!(
        o.block_erase(FlashArea::Info0, ERASE_ADDRESS_MAX + 1),
        Err(Error::InvalidAddress { address: 0x3D00 })
    );
    assert_eq!(o.block_erase(FlashArea::Trim, 0), Err(Error::InvalidArea { area: 16 }));
    assert_eq!(o.single_read(FlashArea::User, RW_ADDRESS_MAX + 1), Err(Error::InvalidAddress { address: 0x4000 }));
    assert_eq!(o.single_read(FlashArea::Trim, 0), Err(Error::InvalidArea { area: 16 }));
    assert_eq!(o.page_write(FlashArea::Info1, 0x4000, &[0; 16]), Err(Error::InvalidAddress { address: 0x4000 }));
    assert_eq!(o.page_write(FlashArea::Trim, 0, &[0; 16]), Err(Error::InvalidArea { area: 16 }));
    assert_eq!(o.multi_read(FlashArea::User, 0, &mut []), Err(Error::InvalidLength { len: 0 }));
    assert_eq!(o.multi_read(FlashArea::User, 0, &mut [0; 257]), Err(Error::InvalidLength { len: 257 }));
    assert_eq!(o.rewrite_info_area(FlashArea::User, |_| {}), Err(Error::InvalidArea { area: 0 }));

    drop(o);
    assert_eq!(sim.calls, 0);
}

#[test]
fn limits_are_inclusive() {
    let mut sim = SimOis::new(WIDE);
    let mut o = ois(&mut sim);

    o.block_erase(FlashArea::Info2, ERASE_ADDRESS_MAX).unwrap();
    o.page_write(FlashArea::User, RW_ADDRESS_MAX, &[7; 16]).unwrap();
    assert_eq!(o.single_read(FlashArea::User, RW_ADDRESS_MAX).unwrap(), 7);

    let mut words = [0u32; 256];
    o.multi_read(FlashArea::User, 0x3F00, &mut words).unwrap();
    assert_eq!(words[0xF0], 7);
    assert_eq!(words[0], 0xFFFF_FFFF);
}

#[test]
fn page_write_then_block_erase() {
    let mut sim = SimOis::new(WIDE);
    let page: [u32; 16] = core::array::from_fn(|i| 0x100 + i as u32);
    {
        let mut o = ois(&mut sim);
        o.page_write(FlashArea::Info2, 0x0013, &page).unwrap();
        let mut back = [0u32; 16];
        o.multi_read(FlashArea::Info2, 0x0010, &mut back).unwrap();
        assert_eq!(back, page);

        o.block_erase(FlashArea::Info2, 0x0010).unwrap();
        assert_eq!(o.single_read(FlashArea::Info2, 0x0010).unwrap(), 0xFFFF_FFFF);
    }
    assert!(!sim.unlocked);
}

#[test]
fn block_erase_timeout_still_locks() {
    let mut sim = SimOis::new(WIDE);
    sim.fla_int_stuck = true;
    let res = ois(&mut sim).block_erase(FlashArea::Info1, 0);
    assert_eq!(res, Err(Error::Timeout(Stage::FlashCommand)));
    assert_eq!(res.unwrap_err().code(), 0x02);
    assert!(!sim.unlocked);
}

#[test]
fn program_flash_alternates_staging_buffers() {
    let mut sim = SimOis::new(WIDE);
    ois(&mut sim).program_flash(&ENTRIES[0]).unwrap();

    let staging: Vec<u16> = sim.records.iter().filter(|r| r.1 == 0).map(|r| r.0).collect();
    assert_eq!(
        staging,
        [reg::FLASH_RECORD_ODD, reg::FLASH_RECORD_EVEN, reg::FLASH_RECORD_ODD, reg::FLASH_RECORD_EVEN]
    );
    assert_eq!(sim.ctrl_log, [0x08, 0x04, 0x08, 0x04]);
    assert_eq!(sim.io.get(&reg::FLA_MODE), Some(&2));
}

#[test]
fn pmem_download_releases_cpu() {
    let mut sim = SimOis::new(WIDE);
    sim.pmem_sum = 0x0102_0304_0506_0708;
    ois(&mut sim).pmem_download(&CodeTable::new(&ENTRIES), 0x0701).unwrap();

    assert_eq!(sim.io.get(&reg::SYSDSP_REMAP), Some(&0x1400));
    assert_eq!(sim.pmem_loads, 1);
    assert_eq!(sim.pmem_bytes, 20);
    assert!(sim.ram_writes.contains(&(reg::FLASH_CPU_RELEASE, 0)));
}

#[test]
fn pmem_download_unknown_image() {
    let mut sim = SimOis::new(WIDE);
    let res = ois(&mut sim).pmem_download(&CodeTable::new(&ENTRIES), 0x0799);
    assert_eq!(res, Err(Error::UnknownModule { index: 0x0799 }));
    assert_eq!(res.unwrap_err().code(), 0xF0);
    assert_eq!(sim.calls, 0);
}

#[test]
fn lock_repeats_write_protect_request() {
    let mut sim = SimOis::new(WIDE);
    ois(&mut sim).unlock().unwrap();
    assert!(sim.unlocked);

    sim.wp_ignore = 1;
    ois(&mut sim).lock().unwrap();
    assert!(!sim.unlocked);
    assert_eq!(sim.wp_ignore, 0);
}

#[test]
fn pmem_checksum_mismatch() {
    let mut sim = SimOis::new(WIDE);
    sim.pmem_sum = 0xBAD;
    let res = ois(&mut sim).pmem_update(ImageSelect::UpdateCode, &ENTRIES[0]);
    assert_eq!(res, Err(Error::Verify(Stage::Pmem)));
    assert_eq!(res.unwrap_err().code(), 0x22);
    assert_eq!(sim.pmem_bytes, 50);
}

// ============================================================================
// Info areas
// ============================================================================

#[test]
fn seal_makes_page_valid() {
    let mut page = InfoArea::default();
    page.words[0] = 0x0102_0304;
    page.words[63] = 0xABCD_0000;
    assert!(!page.is_valid());

    let sum = page.seal();
    assert_eq!(sum, 1 + 2 + 3 + 4 + 0xAB + 0xCD);
    assert!(page.is_valid());
    assert_eq!(page.words[63] >> 16, 0xABCD);
    assert_eq!(InfoArea::from_le_bytes(&page.to_le_bytes()), page);
}

#[test]
fn gyro_offsets_survive_info_area_rewrite() {
    for v in [0i16, i16::MAX, i16::MIN] {
        let mut sim = SimOis::new(WIDE);
        let offsets = GyroOffsets {
            angle: [(v as i32) << 16, 0x1234 << 16, (v as i32) << 16],
            accel: [(v as i32) << 16, (-5i32) << 16, 0],
        };
        let mut o = ois(&mut sim);
        let sum = o.write_gyro_offsets(&offsets).unwrap();

        let page = o.read_info_area(FlashArea::Info0).unwrap();
        assert!(page.is_valid());
        assert_eq!(page.stored_checksum(), sum);
        assert_eq!(GyroOffsets::decode(&page), offsets);
        drop(o);
        assert_eq!(sim.io.get(&reg::FLA_MODE), Some(&2));
    }
}

#[test]
fn rewrite_keeps_unrelated_words() {
    let mut sim = SimOis::new(WIDE);
    for i in 0..64 {
        sim.flash.insert((FlashArea::Info0 as u8, i), 0x1000 + i);
    }
    let mut o = ois(&mut sim);
    o.write_gyro_offsets(&GyroOffsets::default()).unwrap();

    let page = o.read_info_area(FlashArea::Info0).unwrap();
    assert_eq!(page.words[9], 0x1009);
    assert_eq!(page.words[10], 0);
    assert_eq!(page.words[13], 0x100D);
    assert_eq!(page.words[63] >> 16, 0);
}

#[test]
fn temp_comp_lands_in_info_area_1() {
    let mut sim = SimOis::new(WIDE);
    let mut o = ois(&mut sim);
    o.write_temp_comp(&TEMP_COMP[0]).unwrap();

    let page = o.read_info_area(FlashArea::Info1).unwrap();
    assert!(page.is_valid());
    assert_eq!(page.words[0], 0x1111_0001);
    assert_eq!(page.words[8], 27);
    assert_eq!(page.words[28], 0x7FFF_0000);
    assert_eq!(page.words[29], 0x000C_0B0A);
    assert_eq!(page.words[30], 0xFFFF_FFFF);
}

#[test]
fn corrupted_readback_fails_verification() {
    let mut sim = SimOis::new(WIDE);
    sim.corrupt_info_readback = true;
    let res = ois(&mut sim).write_gyro_offsets(&GyroOffsets::default());
    assert_eq!(res, Err(Error::Verify(Stage::InfoArea)));
    assert_eq!(res.unwrap_err().code(), 0x05);
    assert_eq!(sim.io.get(&reg::FLA_MODE), Some(&2));
}

// ============================================================================
// Gyro calibration
// ============================================================================

fn recal_sim(factory: (i16, i16), recal: (i16, i16)) -> SimOis {
    let mut sim = SimOis::new(0x10);
    sim.ram
        .insert(reg::GYRO_FACTORY_OFFSET, (factory.1 as u16 as u32) << 16 | factory.0 as u16 as u32);
    sim.ram.insert(reg::ANGLE_OFFSET_X, (recal.0 as i32 as u32) << 16);
    sim.ram.insert(reg::ANGLE_OFFSET_Y, (recal.1 as i32 as u32) << 16);
    sim
}

#[test]
fn recalibration_bounds_are_inclusive() {
    let accept = [
        ((0, 0), (0x600, -0x600)),
        ((0x1000 - 0x600, 0), (-0x600, 0)),
        ((0x600 - 0x1000, 0x600), (0x600, 0x600)),
    ];
    for (factory, recal) in accept {
        let mut sim = recal_sim(factory, recal);
        let res = recalibrate(&mut sim, NoDelay::default(), OisTarget::RearWide).unwrap();
        assert_eq!(res.recalibrated, AxisPair { x: recal.0, y: recal.1 });
        assert_eq!(res.diff.x as i32, factory.0 as i32 - recal.0 as i32);
    }
}

#[test]
fn recalibration_rejects_out_of_bounds() {
    let reject = [
        ((0, 0), (0x601, 0)),
        ((0, 0), (0, -0x601)),
        ((0x1001, 0), (0, 0)),
        ((0, -0x1001), (0, 0)),
    ];
    for (factory, recal) in reject {
        let mut sim = recal_sim(factory, recal);
        match recalibrate(&mut sim, NoDelay::default(), OisTarget::RearWide) {
            Err(CalError::OutOfTolerance(r)) => assert!(!r.within_tolerance()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sim.target, 0x10);
    }
}

#[test]
fn recalibration_falls_back_to_live_offsets() {
    let mut sim = recal_sim((0, 0), (0x10, 0x20));
    sim.ram.insert(reg::GYRO_FACTORY_OFFSET, 0xFFFF_FFFF);
    sim.ram.insert(reg::GYRO_OFFSET_X, 0xAAAA_0100);
    sim.ram.insert(reg::GYRO_OFFSET_Y, 0x0200_BBBB);

    let res = ois(&mut sim).recalibrate().unwrap();
    assert_eq!(res.factory, AxisPair { x: 0x100, y: 0x200 });
    assert_eq!(res.diff, AxisPair { x: 0xF0, y: 0x1E0 });
}

#[test]
fn recalibration_hardware_failure() {
    let mut sim = recal_sim((0, 0), (0, 0));
    sim.recal_status = 0x03;
    match ois(&mut sim).recalibrate() {
        Err(CalError::Hardware { status: 0x03, .. }) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn persisted_offsets_are_readable() {
    let mut sim = recal_sim((0, 0), (-0x123, 0x45));
    let mut o = ois(&mut sim);
    let res = o.recalibrate().unwrap();
    o.persist_offsets(&res).unwrap();

    let stored = GyroOffsets::decode(&o.read_info_area(FlashArea::Info0).unwrap());
    assert_eq!(stored.angle[0] >> 16, -0x123);
    assert_eq!(stored.angle[1] >> 16, 0x45);
}

#[test]
fn correction_profile_swaps_halves() {
    let map = CorrectionProfile {
        sources: [[0x6000, 0x6004, 0x6008, 0x600C], [0x6010, 0x6014, 0x6018, 0x601C]],
        targets: [0x1A28, 0x1A2C, 0x1A30, 0x1A34],
    };
    let mut sim = SimOis::new(0x10);
    sim.ram.insert(0x6014, 0x1234_5678);

    let res = correct_from_profile(&mut sim, NoDelay::default(), OisTarget::RearTele, &map, 2);
    assert_eq!(res, Err(CalError::InvalidProfile { index: 2 }));
    assert_eq!(sim.calls, 0);

    correct_from_profile(&mut sim, NoDelay::default(), OisTarget::RearTele, &map, 1).unwrap();
    assert_eq!(sim.ram.get(&0x1A2C), Some(&0x3412_7856));
    assert!(sim.targets_seen.iter().all(|&t| t == 0x78 >> 1));
}

// ============================================================================
// Update orchestration
// ============================================================================

#[test]
fn current_firmware_is_left_alone() {
    let mut sim = stale_module();
    sim.ram.insert(reg::FW_VERSION, 0x0000_0110);
    let outcome = check_and_update(&mut sim, NoDelay::default(), &config()).unwrap();
    assert_eq!(outcome, UpdateOutcome::UpToDate { version: 0x10 });
    assert_eq!(sim.pmem_loads, 0);
}

#[test]
fn update_flashes_and_restores_target() {
    let mut sim = stale_module();
    let outcome = check_and_update(&mut sim, NoDelay::default(), &config()).unwrap();

    assert_eq!(outcome, UpdateOutcome::Updated { version: 0x12, attempts: 1 });
    assert_eq!(sim.target, 0x10);
    assert!(sim.targets_seen.iter().all(|&t| t == WIDE));

    let page = ois(&mut sim).read_info_area(FlashArea::Info1).unwrap();
    assert_eq!(page.words[29], 0x000C_0B0A);
}

#[test]
fn update_retries_once() {
    let mut sim = stale_module();
    sim.fail_flash_checksum = 1;
    let outcome = check_and_update(&mut sim, NoDelay::default(), &config()).unwrap();

    assert_eq!(outcome, UpdateOutcome::Updated { version: 0x12, attempts: 2 });
    assert_eq!(sim.pmem_loads, 2);
}

#[test]
fn update_gives_up_after_two_attempts() {
    let mut sim = stale_module();
    sim.fail_flash_checksum = 5;
    let res = check_and_update(&mut sim, NoDelay::default(), &config());

    assert_eq!(res, Err(Error::Verify(Stage::FlashChecksum)));
    assert_eq!(res.unwrap_err().code(), 0x52);
    assert_eq!(sim.pmem_loads, 2);
    assert_eq!(sim.target, 0x10);
    assert!(!sim.unlocked);
}

#[test]
fn unknown_module_never_flashes() {
    let mut sim = stale_module();
    sim.ram.insert(0x8008, 0x0000_0009);
    let res = check_and_update(&mut sim, NoDelay::default(), &config());

    assert_eq!(res, Err(Error::UnknownModule { index: 0x0901 }));
    assert_eq!(sim.pmem_loads, 0);
    assert!(sim.ctrl_log.is_empty());
    assert_eq!(sim.target, 0x10);
}

#[test]
fn bus_errors_are_not_retried() {
    let mut sim = stale_module();
    // Fails inside the first program memory download.
    sim.nack_at = Some(12);
    let res = check_and_update(&mut sim, NoDelay::default(), &config());

    assert_eq!(res, Err(Error::Bus(Nack)));
    assert_eq!(sim.pmem_loads, 1);
    assert_eq!(sim.target(), 0x10);
}

#[test]
fn image_index_from_identity_words() {
    let cfg = config();
    assert_eq!(cfg.image_index(0, 0), 0x0901);
    assert_eq!(cfg.image_index(0x1234_5607, 0xFF03), 0x0703);
    assert_eq!(OisTarget::from_sensor_id(0x481), Some(OisTarget::RearTele));
    assert_eq!(OisTarget::from_sensor_id(0x100), None);
}

// ============================================================================
// User area
// ============================================================================

#[test]
fn user_area_unsupported_on_old_revision() {
    let mut sim = SimOis::new(WIDE);
    sim.io.insert(reg::SYSDSP_CVER, 0x0141);
    let res = ois(&mut sim).write_user_area(UareaCursor::At(0), &[1, 2, 3]);
    assert_eq!(res, Err(Error::Unsupported));
}

#[test]
fn user_area_write_then_read() {
    let mut sim = SimOis::new(WIDE);
    let mut o = ois(&mut sim);

    assert_eq!(
        o.write_user_area(UareaCursor::At(0), &[0; UAREA_WRITE_MAX + 1]),
        Err(Error::InvalidLength { len: 255 })
    );
    o.write_user_area(UareaCursor::At(0x10), &[1, 2, 3, 4]).unwrap();
    o.write_user_area_words(UareaCursor::Continue, &[0xA1B2_C3D4]).unwrap();

    let mut buf = [0u8; 8];
    o.read_user_area(UareaCursor::At(0x10), &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 0xD4, 0xC3, 0xB2, 0xA1]);

    let mut words = [0u8; 4];
    o.read_user_area_words(UareaCursor::At(0x14), &mut words).unwrap();
    assert_eq!(words, [0xD4, 0xC3, 0xB2, 0xA1]);
}

#[test]
fn user_area_commit_locks_again() {
    let mut sim = SimOis::new(WIDE);
    ois(&mut sim).commit_user_area().unwrap();
    assert!(!sim.unlocked);
    assert!(sim.ram_writes.contains(&(reg::UAREA_PROGRAM, 0)));
}
