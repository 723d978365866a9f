use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use clap::{Parser, Subcommand};
use tokio_util::codec::Decoder;
use tracing::{error, info};

use wedo_core::device::SetupProfile;
use wedo_core::protocol::ProtocolTable;
use wedo_core::{
    Command, CommandKind, DecodeError, DeviceKind, FrameCodec, Manager, ManagerConfig,
    MockScanner, WEDO2_V1,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "WeDo 2.0 hub protocol tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Encode a command frame and print it as hex
    Encode {
        #[command(subcommand)]
        command: EncodeCmd,
    },
    /// Decode hub notification bytes (hex), resynchronising after garbage
    Decode {
        /// Hex bytes, spaces allowed; all arguments form one stream
        #[arg(required = true)]
        hex: Vec<String>,

        /// Decode host-to-hub command frames instead
        #[arg(long)]
        command: bool,
    },
    /// Print the protocol table
    Table,
    /// Show the effective configuration
    Config {
        /// TOML file to load
        path: Option<PathBuf>,

        /// Write the defaults to PATH instead of reading it
        #[arg(long, requires = "path")]
        write_default: bool,
    },
    /// Run a scripted session against a mock hub
    Demo {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum EncodeCmd {
    /// Motor power, -100..=100
    Motor {
        #[arg(long, default_value_t = 0)]
        port: u8,
        #[arg(long, allow_hyphen_values = true)]
        power: i32,
        /// Correlation identifier
        #[arg(long, default_value_t = 1)]
        seq: u8,
    },
    /// RGB colour for the hub LED
    Led {
        #[arg(long, default_value_t = 6)]
        port: u8,
        red: u8,
        green: u8,
        blue: u8,
    },
    /// Palette colour for the hub LED, 0..=10
    Index {
        #[arg(long, default_value_t = 6)]
        port: u8,
        index: u8,
    },
    /// Port setup for a device kind, using its table profile
    Setup {
        #[arg(long)]
        port: u8,
        /// Device type byte, e.g. 0x22
        #[arg(long, value_parser = parse_byte)]
        kind: u8,
        #[arg(long, default_value_t = 1)]
        seq: u8,
    },
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{}': {}", s, e))
}

fn parse_hex(parts: &[String]) -> Result<Vec<u8>> {
    let digits: String = parts
        .iter()
        .flat_map(|p| p.chars())
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn encode(codec: &FrameCodec, cmd: EncodeCmd) -> Result<()> {
    let command = match cmd {
        EncodeCmd::Motor { port, power, seq } => {
            Command::new(port, CommandKind::MotorPower { power }).with_correlation(seq)
        }
        EncodeCmd::Led {
            port,
            red,
            green,
            blue,
        } => Command::new(port, CommandKind::LedRgb { red, green, blue }),
        EncodeCmd::Index { port, index } => Command::new(port, CommandKind::LedIndex { index }),
        EncodeCmd::Setup { port, kind, seq } => {
            let kind = DeviceKind(kind);
            let profile: SetupProfile = codec
                .table()
                .device(kind)
                .and_then(|spec| spec.setup)
                .with_context(|| format!("device kind {} needs no port setup", kind))?;
            Command::new(port, CommandKind::setup(kind, profile)).with_correlation(seq)
        }
    };

    let frame = codec.encode(&command)?;
    let endpoint = codec
        .endpoint(command.opcode())
        .context("opcode has no endpoint")?;
    println!("{}", hex(&frame));
    info!(cmd = %command, endpoint = endpoint.characteristic(), "Encoded");
    Ok(())
}

fn decode(codec: &FrameCodec, bytes: Vec<u8>, commands: bool) -> Result<()> {
    if commands {
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let command = codec.decode_command(rest)?;
            let len = usize::from(rest[0]);
            println!("{:<24} {}", command.to_string(), hex(&rest[..len]));
            rest = &rest[len..];
        }
        return Ok(());
    }

    let mut codec = *codec;
    let mut buf = BytesMut::from(bytes.as_slice());
    loop {
        match Decoder::decode(&mut codec, &mut buf) {
            Ok(Some(message)) => println!("{}", message),
            Ok(None) => break,
            Err(DecodeError::Malformed { reason, discarded }) => {
                println!("discarded {} byte(s): {}", discarded, reason);
            }
            Err(e) => return Err(e.into()),
        }
    }
    if !buf.is_empty() {
        println!("incomplete trailing frame: {}", hex(&buf));
    }
    Ok(())
}

fn print_table(table: &ProtocolTable) {
    println!(
        "{} v{}: {} ports, frames {}..={} bytes, {:?} checksum",
        table.name,
        table.version,
        table.port_count,
        table.min_frame_len,
        table.max_frame_len,
        table.checksum
    );

    println!("\nOutbound:");
    for spec in table.outbound {
        println!(
            "  0x{:02X}  {:<12} {:?} {:?}",
            spec.code, spec.opcode.to_string(), spec.endpoint, spec.ack
        );
    }

    println!("\nInbound:");
    for spec in table.inbound {
        println!("  0x{:02X}  {:?} payload {:?}", spec.code, spec.kind, spec.payload);
    }

    println!("\nDevices:");
    for spec in table.devices {
        let setup = match spec.setup {
            Some(p) => format!("mode={} format={} delta={}", p.mode, p.format, p.delta),
            None => "-".to_string(),
        };
        println!(
            "  {}  {:<10} caps={} value={:?} setup: {}",
            spec.kind, spec.name, spec.capabilities, spec.value, setup
        );
    }

    println!("\nErrors:");
    for (code, name) in table.errors {
        println!("  0x{:02X}  {}", code, name);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ManagerConfig> {
    match path {
        Some(path) => ManagerConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ManagerConfig::default()),
    }
}

async fn demo(config: ManagerConfig) -> Result<()> {
    let scanner = Arc::new(MockScanner::new());
    let mock = scanner.add_hub("00:16:53:00:00:01", "WeDo 2.0 Hub (mock)");
    mock.set_auto_ack(true);

    let mut manager = Manager::new(scanner, config);
    let hubs = manager.discover().await?;
    let hub = hubs[0].clone();
    let reader = tokio::spawn({
        let hub = hub.clone();
        async move { hub.run().await }
    });

    // Handles are usable before their ports attach; commands wait in order.
    let motor = hub.motor(0)?;
    let tilt = hub.tilt_sensor(1)?;
    let led = hub.led(6)?;
    mock.attach(0, DeviceKind::MOTOR);
    mock.attach(1, DeviceKind::TILT);
    mock.attach(6, DeviceKind::RGB_LED);

    let ack = motor.set_power(50).await?;
    info!(%ack, "Motor running");

    let _subscription = tilt.on_change(|direction| info!(%direction, "Tilt changed"))?;
    mock.sensor(1, &[180]);

    led.blink("green", Duration::from_secs(1)).await?;
    motor.stop().await?;
    info!(tilt = %tilt.tilt()?, "Final tilt");

    hub.shutdown();
    let exit = reader.await??;
    info!(?exit, "Hub stopped");

    println!("Frames written:");
    for (endpoint, frame) in mock.writes() {
        println!("  {:<14} {}", format!("{:?}", endpoint), hex(&frame));
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let codec = FrameCodec::default();
    match args.command {
        Cmd::Encode { command } => encode(&codec, command),
        Cmd::Decode { hex, command } => decode(&codec, parse_hex(&hex)?, command),
        Cmd::Table => {
            print_table(&WEDO2_V1);
            Ok(())
        }
        Cmd::Config {
            path,
            write_default,
        } => {
            if write_default {
                if let Some(path) = &path {
                    ManagerConfig::default().save_to_file(path)?;
                    info!(path = %path.display(), "Default configuration written");
                }
                return Ok(());
            }
            let config = load_config(path.as_ref())?;
            println!("{:#?}", config);
            Ok(())
        }
        Cmd::Demo { config } => demo(load_config(config.as_ref())?).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
