use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, warn};

use chaosflash::bootstrap::boot;
use chaosflash::bytestream::{SerialStream, UnixSocketStream};
use chaosflash::fullflash::FullflashBackend;
use chaosflash::patch_engine::{PatchEngine, PatchOptions};
use chaosflash::{vkp, ChaosProtocol, FlashDevice};

const EMULATOR_SOCKET_PATH: &str = "/tmp/siemens.sock";

#[derive(Parser, Debug)]
#[command(version, about = "Patches Siemens PMB887x flash over the Chaos service-mode loader")]
struct Args {
    /// Serial port path (e.g. /dev/ttyUSB0 or COM3).
    #[arg(long)]
    serial: Option<String>,

    /// Baud rate to request after boot, via SetSpeed.
    #[arg(long, default_value_t = 115200)]
    speed: u32,

    /// Path to the Chaos bootloader binary to upload.
    #[arg(long)]
    loader: Option<PathBuf>,

    /// Connect to the emulator's unix socket instead of a serial port.
    #[arg(long)]
    emulator: bool,

    /// Use a local fullflash dump file instead of a real phone.
    #[arg(long)]
    use_fullflash_not_phone: bool,

    /// Path to the fullflash dump file, when --use_fullflash_not_phone is set.
    #[arg(long)]
    use_fullflash_file_path: Option<PathBuf>,

    /// Read a region of flash to --flash_file.
    #[arg(long)]
    read_flash: bool,

    /// Write --flash_file's contents to flash.
    #[arg(long)]
    write_flash: bool,

    /// File used by --read_flash (destination) or --write_flash (source).
    #[arg(long)]
    flash_file: Option<PathBuf>,

    /// Base address, as a hex integer, for --read_flash / --write_flash.
    #[arg(long, value_parser = parse_hex_addr)]
    base_addr: Option<u32>,

    /// Number of bytes to read, for --read_flash.
    #[arg(long)]
    length: Option<u32>,

    /// Apply a VKP patch.
    #[arg(long)]
    apply_patch: bool,

    /// Revert a previously applied VKP patch.
    #[arg(long)]
    revert_patch: bool,

    /// Check the patch against device contents without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Proceed past pre-image mismatches instead of aborting.
    #[arg(long)]
    force: bool,

    /// Path to a local VKP file, or a decimal numeric ID to fetch remotely.
    #[arg(long)]
    patch_file: Option<String>,

    /// Increase log verbosity.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all but warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_hex_addr(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).map_err(|e| e.to_string())
}

enum Backend {
    Serial(ChaosProtocol<SerialStream>),
    Emulator(ChaosProtocol<UnixSocketStream>),
    Fullflash(FullflashBackend),
}

impl FlashDevice for Backend {
    async fn ping(&mut self) -> chaosflash::Result<bool> {
        match self {
            Backend::Serial(d) => d.ping().await,
            Backend::Emulator(d) => d.ping().await,
            Backend::Fullflash(d) => d.ping().await,
        }
    }

    async fn read_info(&mut self) -> chaosflash::Result<chaosflash::PhoneInfo> {
        match self {
            Backend::Serial(d) => d.read_info().await,
            Backend::Emulator(d) => d.read_info().await,
            Backend::Fullflash(d) => d.read_info().await,
        }
    }

    async fn read_flash(&mut self, addr: u32, size: u32) -> chaosflash::Result<Vec<u8>> {
        match self {
            Backend::Serial(d) => d.read_flash(addr, size).await,
            Backend::Emulator(d) => d.read_flash(addr, size).await,
            Backend::Fullflash(d) => d.read_flash(addr, size).await,
        }
    }

    async fn write_flash(&mut self, addr: u32, data: &[u8]) -> chaosflash::Result<()> {
        match self {
            Backend::Serial(d) => d.write_flash(addr, data).await,
            Backend::Emulator(d) => d.write_flash(addr, data).await,
            Backend::Fullflash(d) => d.write_flash(addr, data).await,
        }
    }

    async fn set_speed(&mut self, rate: u32) -> chaosflash::Result<()> {
        match self {
            Backend::Serial(d) => d.set_speed(rate).await,
            Backend::Emulator(d) => d.set_speed(rate).await,
            Backend::Fullflash(d) => d.set_speed(rate).await,
        }
    }

    async fn disconnect(&mut self) -> chaosflash::Result<()> {
        match self {
            Backend::Serial(d) => d.disconnect().await,
            Backend::Emulator(d) => d.disconnect().await,
            Backend::Fullflash(d) => d.disconnect().await,
        }
    }
}

async fn connect(args: &Args) -> Result<Backend> {
    if args.use_fullflash_not_phone {
        let path = args
            .use_fullflash_file_path
            .as_ref()
            .context("--use_fullflash_file_path is required with --use_fullflash_not_phone")?;
        let backend = FullflashBackend::open(
            path.to_str().context("fullflash path is not valid UTF-8")?,
        )
        .await
        .context("failed to open fullflash file")?;
        return Ok(Backend::Fullflash(backend));
    }

    let loader = args
        .loader
        .as_ref()
        .context("--loader is required to boot a real or emulated device")?;
    let loader_bytes = std::fs::read(loader).context("failed to read Chaos loader binary")?;

    if args.emulator {
        info!("waiting for emulator to connect on {EMULATOR_SOCKET_PATH}");
        let stream = UnixSocketStream::connect(EMULATOR_SOCKET_PATH)
            .await
            .context("failed to connect to emulator socket")?;
        let (stream, family) = boot(stream, &loader_bytes).await.context("bootstrap failed")?;
        info!("booted, phone family {family:?}");
        let chaos = ChaosProtocol::activate(stream).await.context("chaos activation failed")?;
        return Ok(Backend::Emulator(chaos));
    }

    let serial_path = args
        .serial
        .as_ref()
        .context("--serial <path> is required unless --emulator or --use_fullflash_not_phone is set")?;
    let stream = SerialStream::open(serial_path, 115200).context("failed to open serial port")?;
    let (stream, family) = boot(stream, &loader_bytes).await.context("bootstrap failed")?;
    info!("booted, phone family {family:?}");
    let chaos = ChaosProtocol::activate(stream).await.context("chaos activation failed")?;
    Ok(Backend::Serial(chaos))
}

async fn load_patch_text(patch_file: &str) -> Result<String> {
    if let Some(id) = chaosflash::remote::parse_numeric_id(patch_file) {
        info!("fetching patch {id} from the remote archive");
        return chaosflash::remote::fetch_patch(id)
            .await
            .context("failed to fetch remote patch");
    }
    std::fs::read_to_string(patch_file).context("failed to read patch file")
}

async fn run(args: Args) -> Result<()> {
    let mut device = connect(&args).await?;

    let outcome = execute(&args, &mut device).await;

    if let Err(e) = device.disconnect().await {
        warn!("failed to disconnect cleanly: {e:#}");
    }

    outcome
}

async fn execute(args: &Args, device: &mut Backend) -> Result<()> {
    if args.speed != 115200 {
        device
            .set_speed(args.speed)
            .await
            .context("failed to negotiate baud rate")?;
    }

    if args.read_flash {
        let base_addr = args.base_addr.context("--base_addr is required with --read_flash")?;
        let length = args.length.context("--length is required with --read_flash")?;
        let flash_file = args.flash_file.as_ref().context("--flash_file is required with --read_flash")?;
        let data = device
            .read_flash(base_addr, length)
            .await
            .context("read_flash failed")?;
        std::fs::write(flash_file, data).context("failed to write flash dump")?;
    }

    if args.write_flash {
        let base_addr = args.base_addr.context("--base_addr is required with --write_flash")?;
        let flash_file = args.flash_file.as_ref().context("--flash_file is required with --write_flash")?;
        let data = std::fs::read(flash_file).context("failed to read flash source file")?;
        device
            .write_flash(base_addr, &data)
            .await
            .context("write_flash failed")?;
    }

    if args.apply_patch || args.revert_patch {
        let patch_file = args.patch_file.as_ref().context("--patch_file is required to apply or revert a patch")?;
        let patch_text = load_patch_text(patch_file).await?;
        let chunks = vkp::parse(&patch_text).context("failed to parse patch")?;

        let options = PatchOptions {
            revert: args.revert_patch,
            dry_run: args.dry_run,
            force: args.force,
        };
        let mut engine = PatchEngine::new(device, options);
        engine.apply(&chunks).await.context("patch application failed")?;
        info!("patch {}", if args.dry_run { "verified" } else { "applied" });
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.quiet {
        "warn"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if let Err(e) = run(args).await {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}
