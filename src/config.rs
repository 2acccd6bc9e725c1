// Configuration record the external loader populates before handing it to
// the core. Parsing an INI/TOML file or command line into this struct is
// out of scope for the core itself; `main.rs` is the one caller that does
// it, via `clap`.

use crate::scheduler::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Run the BIOS shell to completion, as a real console would.
    BiosOnly,
    /// Load a PSX-EXE and hand off to it once the BIOS shell reaches the
    /// side-load intercept address.
    PsxExe,
    /// Boot from a disc image (CD-ROM streaming is an external
    /// collaborator this core does not implement; selecting this mode
    /// only changes which stub responses the BIOS sees).
    Iso,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub bios_path: String,
    pub boot_mode: BootMode,
    /// Path to the PSX-EXE or ISO image, required unless `boot_mode` is
    /// `BiosOnly`.
    pub image_path: Option<String>,
    pub region: Region,
    pub audio_enabled: bool,
    pub controller_enabled: bool,
    /// Throttle `run_batch` calls to real time using the host clock.
    /// Disabled for headless/test runs that want to run as fast as possible.
    pub frame_limit_enabled: bool,
    /// Skip SPU frame mixing entirely; useful when profiling the dynarec in
    /// isolation since ADPCM decode and mixing are otherwise always-on.
    pub spu_disabled: bool,
    /// Skip GPU register emulation beyond the bare ready-status stub; the
    /// core has no rasterizer, so this only controls whether GP0/GP1 writes
    /// are logged for debugging.
    pub gpu_trace_disabled: bool,
}

impl Configuration {
    pub fn new(bios_path: impl Into<String>) -> Self {
        Self {
            bios_path: bios_path.into(),
            boot_mode: BootMode::BiosOnly,
            image_path: None,
            region: Region::Ntsc,
            audio_enabled: true,
            controller_enabled: true,
            frame_limit_enabled: true,
            spu_disabled: false,
            gpu_trace_disabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.boot_mode, BootMode::BiosOnly) && self.image_path.is_none() {
            return Err(format!("boot mode {:?} requires an image path", self.boot_mode));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_boots_bios_only() {
        let config = Configuration::new("scph1001.bin");
        assert_eq!(config.boot_mode, BootMode::BiosOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn psx_exe_boot_mode_requires_an_image_path() {
        let mut config = Configuration::new("scph1001.bin");
        config.boot_mode = BootMode::PsxExe;
        assert!(config.validate().is_err());
        config.image_path = Some("game.exe".into());
        assert!(config.validate().is_ok());
    }
}
