pub mod config;
pub mod cpu;
pub mod devices;
pub mod dispatch;
pub mod dynarec;
pub mod error;
pub mod gte;
pub mod memory;
pub mod psexe;
pub mod scheduler;
pub mod spu;

pub use config::{BootMode, Configuration};
pub use dispatch::Machine;
pub use error::{CoreError, CoreResult};
pub use scheduler::Region;

/// Boots a `Machine` from a validated `Configuration`, loading the BIOS
/// image and (for `BootMode::PsxExe`) parsing and side-loading the
/// executable before returning control to the caller's run loop.
pub fn boot(config: &Configuration, bios_image: &[u8], exe_image: Option<&[u8]>) -> CoreResult<Machine> {
    config.validate().map_err(CoreError::Fatal)?;

    let mut machine = Machine::new(config.region)?;
    machine.load_bios(bios_image)?;

    if config.boot_mode == BootMode::PsxExe {
        let data = exe_image.ok_or_else(|| CoreError::Fatal("PSX-EXE boot mode selected but no image was supplied".into()))?;
        let path = config.image_path.clone().unwrap_or_else(|| "<memory>".into());
        let exe = psexe::PsxExe::parse(&path, data)?;
        exe.load_into(&mut machine.bus);
        machine.hand_off_to_executable(exe.initial_pc, exe.initial_gp, exe.initial_sp());
    }

    Ok(machine)
}
