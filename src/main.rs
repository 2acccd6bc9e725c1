use std::fs;

use clap::Parser;

use psx_core::config::BootMode;
use psx_core::{boot, Configuration, CoreResult, Region};

#[derive(Parser)]
#[command(name = "psx-core", about = "PlayStation dynarec/scheduler/GTE/SPU core")]
struct Args {
    /// Path to the BIOS ROM image.
    #[arg(long)]
    bios: String,

    /// Path to a PSX-EXE to side-load once the BIOS shell reaches the
    /// side-load intercept, instead of running the full BIOS shell.
    #[arg(long)]
    exe: Option<String>,

    #[arg(long, value_enum, default_value = "ntsc")]
    region: RegionArg,

    #[arg(long)]
    no_audio: bool,

    #[arg(long)]
    no_frame_limit: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum RegionArg {
    Ntsc,
    Pal,
}

impl From<RegionArg> for Region {
    fn from(value: RegionArg) -> Self {
        match value {
            RegionArg::Ntsc => Region::Ntsc,
            RegionArg::Pal => Region::Pal,
        }
    }
}

fn main() -> CoreResult<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Configuration::new(&args.bios);
    config.region = args.region.into();
    config.audio_enabled = !args.no_audio;
    config.frame_limit_enabled = !args.no_frame_limit;
    if args.exe.is_some() {
        config.boot_mode = BootMode::PsxExe;
        config.image_path = args.exe.clone();
    }

    let bios_image = fs::read(&args.bios).map_err(|source| psx_core::CoreError::BiosLoad { path: args.bios.clone(), source })?;
    let exe_image = args.exe.as_ref().map(fs::read).transpose().map_err(|source| psx_core::CoreError::BiosLoad { path: config.image_path.clone().unwrap_or_default(), source })?;

    let mut machine = boot(&config, &bios_image, exe_image.as_deref())?;

    let mut sink: Box<dyn psx_core::spu::AudioSink> = if config.audio_enabled {
        match psx_core::spu::RodioSink::try_new() {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                log::warn!("audio output unavailable ({e}), running muted");
                Box::new(psx_core::spu::NullSink)
            }
        }
    } else {
        Box::new(psx_core::spu::NullSink)
    };

    const GUEST_CLOCK_HZ: f64 = 33_868_800.0;
    let mut blocks_reported = 0usize;
    let mut batch_started_at = std::time::Instant::now();
    loop {
        let cycles_before = machine.global_cycles;
        machine.run_batch(sink.as_mut())?;

        if config.frame_limit_enabled {
            let guest_elapsed = (machine.global_cycles - cycles_before) as f64 / GUEST_CLOCK_HZ;
            let target = std::time::Duration::from_secs_f64(guest_elapsed);
            let actual = batch_started_at.elapsed();
            if target > actual {
                std::thread::sleep(target - actual);
            }
            batch_started_at = std::time::Instant::now();
        }

        if machine.dynarec.blocks_compiled() - blocks_reported > 10_000 {
            blocks_reported = machine.dynarec.blocks_compiled();
            log::info!("blocks compiled: {blocks_reported}, cycles: {}", machine.global_cycles);
        }
    }
}
