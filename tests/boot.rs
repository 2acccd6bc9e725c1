// End-to-end tests exercising the public API the way an external loader
// would: build a `Configuration`, hand it a BIOS (and optionally a
// PSX-EXE) image, and drive the returned `Machine` through a few batches.

use psx_core::config::BootMode;
use psx_core::spu::NullSink;
use psx_core::{boot, Configuration, Region};

/// A BIOS image of all zero words. MIPS opcode 0 decodes as `sll $0, $0, 0`
/// (architecturally a NOP), so a zeroed image is a valid, infinitely
/// NOP-slidable program without needing a real ROM dump.
fn blank_bios() -> Vec<u8> {
    vec![0u8; psx_core::memory::BIOS_SIZE]
}

#[test]
fn bios_only_boot_runs_batches_without_aborting() {
    let config = Configuration::new("scph1001.bin");
    let mut machine = boot(&config, &blank_bios(), None).expect("boot should succeed");

    let mut sink = NullSink;
    for _ in 0..8 {
        machine.run_batch(&mut sink).expect("batch should execute cleanly");
    }

    assert!(machine.global_cycles > 0);
    assert!(machine.dynarec.blocks_compiled() > 0);
}

#[test]
fn psx_exe_boot_mode_without_an_image_is_rejected() {
    let mut config = Configuration::new("scph1001.bin");
    config.boot_mode = BootMode::PsxExe;
    // No `image_path` set: `validate` (called from `boot`) must reject this
    // before any BIOS/EXE bytes are touched.
    assert!(boot(&config, &blank_bios(), None).is_err());
}

#[test]
fn psx_exe_hand_off_redirects_execution_to_the_entry_point() {
    const TEXT_DESTINATION: u32 = 0x8001_0000;
    const MAGIC: &[u8; 8] = b"PS-X EXE";
    const HEADER_SIZE: usize = 2048;

    let mut exe = vec![0u8; HEADER_SIZE + 16];
    exe[0..8].copy_from_slice(MAGIC);
    exe[0x10..0x14].copy_from_slice(&TEXT_DESTINATION.to_le_bytes()); // initial_pc
    exe[0x14..0x18].copy_from_slice(&0u32.to_le_bytes()); // initial_gp
    exe[0x18..0x1C].copy_from_slice(&TEXT_DESTINATION.to_le_bytes()); // text_destination
    exe[0x1C..0x20].copy_from_slice(&16u32.to_le_bytes()); // text_size
    exe[0x30..0x34].copy_from_slice(&0x801F_0000u32.to_le_bytes()); // initial_sp_base
    // text bytes stay zeroed: a run of NOPs at the entry point.

    let mut config = Configuration::new("scph1001.bin");
    config.boot_mode = BootMode::PsxExe;
    config.image_path = Some("game.exe".into());

    let mut machine = boot(&config, &blank_bios(), Some(&exe)).expect("boot should succeed");
    assert_eq!(machine.cpu.pc, TEXT_DESTINATION);
    assert!(machine.is_executable_boot());

    let mut sink = NullSink;
    machine.run_batch(&mut sink).expect("batch should execute cleanly");
    assert!(machine.global_cycles > 0);
}

/// Hand-assembles a short real MIPS sequence -- arithmetic, a store, a load,
/// a taken branch with its delay slot, and a syscall trap -- and checks the
/// architectural state it leaves behind. This is the one test in the suite
/// that actually exercises emitted block code end to end rather than an
/// all-NOP program, covering delay-slot ordering, the load/store helper
/// calls, and the trap path together.
#[test]
fn branch_delay_slot_and_memory_access_produce_expected_state() {
    const TEXT_DESTINATION: u32 = 0x8001_0000;
    const MAGIC: &[u8; 8] = b"PS-X EXE";
    const HEADER_SIZE: usize = 2048;

    let words: [u32; 10] = [
        0x2408_0001, // addiu $t0, $zero, 1
        0x2409_0002, // addiu $t1, $zero, 2
        0xAC09_0000, // sw    $t1, 0($zero)
        0x8C0A_0000, // lw    $t2, 0($zero)
        0x1108_0002, // beq   $t0, $t0, +2        (always taken)
        0x240C_7777, // addiu $t4, $zero, 0x7777  (delay slot, always runs)
        0x240D_DEAD, // addiu $t5, $zero, 0xDEAD  (skipped by the branch)
        0x014C_7021, // addu  $t6, $t2, $t4       (branch target)
        0x0000_000C, // syscall
        0x0000_0000, // nop (padding past the syscall)
    ];

    let mut exe = vec![0u8; HEADER_SIZE + words.len() * 4];
    exe[0..8].copy_from_slice(MAGIC);
    exe[0x10..0x14].copy_from_slice(&TEXT_DESTINATION.to_le_bytes());
    exe[0x14..0x18].copy_from_slice(&0u32.to_le_bytes());
    exe[0x18..0x1C].copy_from_slice(&TEXT_DESTINATION.to_le_bytes());
    exe[0x1C..0x20].copy_from_slice(&((words.len() * 4) as u32).to_le_bytes());
    exe[0x30..0x34].copy_from_slice(&0x801F_0000u32.to_le_bytes());
    for (i, word) in words.iter().enumerate() {
        exe[HEADER_SIZE + i * 4..HEADER_SIZE + i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }

    let mut config = Configuration::new("scph1001.bin");
    config.boot_mode = BootMode::PsxExe;
    config.image_path = Some("game.exe".into());

    let mut machine = boot(&config, &blank_bios(), Some(&exe)).expect("boot should succeed");
    assert_eq!(machine.cpu.pc, TEXT_DESTINATION);

    let mut sink = NullSink;
    machine.run_batch(&mut sink).expect("batch should execute cleanly");

    assert_eq!(machine.cpu.gpr[8], 1); // $t0
    assert_eq!(machine.cpu.gpr[9], 2); // $t1
    assert_eq!(machine.cpu.gpr[10], 2); // $t2, loaded back from the store
    assert_eq!(machine.cpu.gpr[12], 0x7777); // $t4, set by the delay slot
    assert_eq!(machine.cpu.gpr[13], 0); // $t5, skipped by the taken branch
    assert_eq!(machine.cpu.gpr[14], 0x7779); // $t6, computed at the branch target
    assert_eq!(machine.bus.read(0, psx_core::memory::Size::Word) & 0xFFFF, 2);

    // The syscall raised a guest exception: CAUSE.EXCCODE and EPC record it
    // even after further BIOS instructions have run and moved `pc` on.
    let exccode = (machine.cpu.cop0_regs[psx_core::cpu::cop0reg::CAUSE] >> 2) & 0x1F;
    assert_eq!(exccode, 8); // Syscall
    assert_eq!(machine.cpu.cop0_regs[psx_core::cpu::cop0reg::EPC], TEXT_DESTINATION + 32);
}

#[test]
fn pal_region_uses_a_longer_frame_than_ntsc() {
    let ntsc = Configuration::new("scph1001.bin");
    let mut pal = Configuration::new("scph5500.bin");
    pal.region = Region::Pal;

    assert!(Region::Pal.scanlines_per_frame() > ntsc.region.scanlines_per_frame());
}
