use anyhow::Result;
use clap::Parser;

use obsisp::Flashing;

#[derive(clap::Parser)]
#[clap(
    name = "obsisp",
    about = "In-circuit programmer for OnBright OBS38S003 MCUs, over a two-wire bus bridge",
    version
)]
struct Cli {
    /// Serial port of the bus bridge; picks the first detected port when omitted
    #[clap(short, long, global = true)]
    port: Option<String>,

    /// Log every bus transaction
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Get info about the connected chip
    Info {},
    /// Reset the target (no acknowledge is possible for this request)
    Reset {},
    /// Erase the entire chip
    Erase {},
    /// Download a firmware image, verify it and reset
    Flash {
        /// Intel-HEX, plain hex or raw binary firmware file
        path: String,
    },
    /// Verify flash content against a firmware image
    Verify {
        path: String,
    },
    /// Hexdump a flash range
    Dump {
        /// First flash address to read
        #[clap(default_value = "0")]
        start: u16,
        /// Number of bytes to read
        #[clap(default_value = "8192")]
        length: usize,
    },
    /// Show the named configuration fuses
    Fuses {},
    /// Set one configuration fuse and read it back
    SetFuse {
        /// Fuse offset in the config space
        offset: u8,
        /// Value to program
        value: u8,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let mut flashing = Flashing::new_from_serial(cli.port.as_deref())?;
    match cli.command {
        Command::Info {} => {
            flashing.dump_info()?;
        }
        Command::Reset {} => {
            flashing.reset();
        }
        Command::Erase {} => {
            flashing.erase()?;
        }
        Command::Flash { path } => {
            flashing.dump_info()?;
            let image = obsisp::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", image.len());
            flashing.flash(&image)?;
            flashing.verify(&image)?;
            flashing.reset();
        }
        Command::Verify { path } => {
            let image = obsisp::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", image.len());
            flashing.verify(&image)?;
        }
        Command::Dump { start, length } => {
            let data = flashing.dump(start, length)?;
            let mut out = Vec::new();
            hxdmp::hexdump(&data, &mut out)?;
            println!("{}", String::from_utf8_lossy(&out));
        }
        Command::Fuses {} => {
            for (fuse, value) in flashing.dump_fuses()? {
                println!("{} (0x{:02x}) = 0x{:02x}", fuse.name, fuse.offset, value);
            }
        }
        Command::SetFuse { offset, value } => {
            flashing.set_fuse(offset, value)?;
        }
    }

    Ok(())
}
