//! SCHC Compressor Binary
//!
//! Compresses and decompresses IPv6/UDP/CoAP packets against a device's rule
//! set, either one hex packet at a time or over a whole pcapng capture.

use std::fs::File;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pcap_file::pcapng::{Block, PcapNgReader};
use schc_coap::{
    CompressionContext, DeviceContext, Direction, LinkLayer, RuleSet, compress_packet,
    decompress_packet,
};
use tracing::{debug, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "schc-compressor")]
#[command(about = "SCHC header compression for IPv6/UDP/CoAP", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Path to the rules JSON file
    #[arg(short, long, global = true, default_value = "samples/coap_device.json")]
    rules: PathBuf,

    /// Device whose context is used
    #[arg(long, global = true, default_value_t = 1)]
    device: u32,

    /// Packet direction
    #[arg(long, global = true, value_enum, default_value_t = DirectionArg::Up)]
    direction: DirectionArg,

    /// Enable debug logging (field-by-field rule selection)
    #[arg(short, long, global = true, default_value_t = false)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress one hex-encoded IPv6 packet
    Compress {
        /// Packet bytes as hex
        packet: String,

        /// Largest compressed packet the link accepts, in bytes
        #[arg(long)]
        capacity: Option<usize>,
    },
    /// Decompress one hex-encoded SCHC packet
    Decompress {
        /// Compressed bytes as hex
        data: String,
    },
    /// Compress every IPv6 packet of a pcapng capture
    Pcap {
        /// Path to the pcapng file
        file: PathBuf,

        /// Link layer header in front of IPv6: none, ethernet or a byte count
        #[arg(long, default_value = "ethernet", value_parser = parse_link_layer)]
        link_layer: LinkLayer,

        /// Maximum number of packets to process (0 = all)
        #[arg(short, long, default_value_t = 0)]
        max_packets: usize,

        /// Verify compression by decompressing and comparing with original
        #[arg(short = 'v', long, default_value_t = false)]
        verify: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum DirectionArg {
    Up,
    Down,
}

impl From<DirectionArg> for Direction {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Up => Direction::Up,
            DirectionArg::Down => Direction::Down,
        }
    }
}

fn parse_link_layer(s: &str) -> std::result::Result<LinkLayer, String> {
    match s.to_ascii_lowercase().as_str() {
        "none" | "raw" => Ok(LinkLayer::None),
        "ethernet" | "eth" => Ok(LinkLayer::Ethernet),
        other => other
            .parse::<usize>()
            .map(LinkLayer::Custom)
            .map_err(|_| format!("expected none, ethernet or a byte count, got '{s}'")),
    }
}

fn setup_logging(debug: bool) -> Result<()> {
    let default = if debug { LevelFilter::DEBUG } else { LevelFilter::WARN };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("SCHC_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set up logging: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.common.debug)?;

    let ruleset = RuleSet::from_file(&cli.common.rules)
        .with_context(|| format!("Failed to load rules from {}", cli.common.rules.display()))?;
    let device = ruleset
        .device(cli.common.device)
        .context("Failed to select device")?;
    let direction = Direction::from(cli.common.direction);

    match cli.command {
        Command::Compress { packet, capacity } => {
            run_compress(device, direction, &packet, capacity)
        }
        Command::Decompress { data } => run_decompress(device, direction, &data),
        Command::Pcap {
            file,
            link_layer,
            max_packets,
            verify,
        } => run_pcap(device, direction, &file, link_layer, max_packets, verify),
    }
}

fn decode_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).context("Input is not valid hex")
}

fn run_compress(
    device: &DeviceContext,
    direction: Direction,
    packet: &str,
    capacity: Option<usize>,
) -> Result<()> {
    let bytes = decode_hex(packet)?;
    let mut ctx = CompressionContext::for_device(device, direction);
    if let Some(capacity) = capacity {
        ctx = ctx.with_capacity(capacity);
    }

    let compressed = compress_packet(device, &mut ctx, &bytes).context("Compression failed")?;
    println!("{}", hex::encode(&compressed.data));
    eprintln!(
        "{} bytes -> {} bytes (Rule: {}/{} - Saved: {} bits)",
        bytes.len(),
        compressed.data.len(),
        compressed.rule_id,
        compressed.rule_id_length,
        compressed.stats.savings_bits()
    );
    Ok(())
}

fn run_decompress(device: &DeviceContext, direction: Direction, data: &str) -> Result<()> {
    let bytes = decode_hex(data)?;
    let ctx = CompressionContext::for_device(device, direction);
    let decompressed = decompress_packet(device, &ctx, &bytes).context("Decompression failed")?;
    println!("{}", hex::encode(&decompressed.data));
    eprintln!(
        "{} bytes -> {} bytes (Rule: {}/{})",
        bytes.len(),
        decompressed.data.len(),
        decompressed.rule_id,
        decompressed.rule_id_length
    );
    Ok(())
}

/// Running totals over a capture
#[derive(Debug, Default)]
struct Summary {
    packets: usize,
    compressed: usize,
    skipped: usize,
    verified: usize,
    verify_failures: usize,
    original_header_bits: usize,
    compressed_header_bits: usize,
}

impl Summary {
    fn print(&self) {
        println!("\n{}", "=".repeat(80));
        println!("SUMMARY");
        println!("{}", "=".repeat(80));
        println!("Total packets processed:    {}", self.packets);
        println!("Compressed:                 {}", self.compressed);
        println!("Skipped:                    {}", self.skipped);
        if self.verified + self.verify_failures > 0 {
            println!(
                "Verified round trips:       {} ok, {} failed",
                self.verified, self.verify_failures
            );
        }
        println!(
            "Total original header:      {} bits ({} bytes)",
            self.original_header_bits,
            self.original_header_bits.div_ceil(8)
        );
        println!(
            "Total compressed header:    {} bits ({} bytes)",
            self.compressed_header_bits,
            self.compressed_header_bits.div_ceil(8)
        );
        if self.original_header_bits > 0 {
            let saved = self.original_header_bits as i64 - self.compressed_header_bits as i64;
            println!(
                "Total bits saved:           {} bits ({:.1}%)",
                saved,
                100.0 * saved as f64 / self.original_header_bits as f64
            );
            println!(
                "Compression ratio:          {:.2}:1",
                self.original_header_bits as f64 / self.compressed_header_bits.max(1) as f64
            );
        }
        println!("{}", "=".repeat(80));
    }
}

/// Direction of a captured packet, judged by which side carries the device address.
fn packet_direction(packet: &[u8], device: Option<Ipv6Addr>, fallback: Direction) -> Direction {
    let (Some(device), Some(src), Some(dst)) = (device, packet.get(8..24), packet.get(24..40))
    else {
        return fallback;
    };
    let device = device.octets();
    if src == device {
        Direction::Up
    } else if dst == device {
        Direction::Down
    } else {
        fallback
    }
}

fn run_pcap(
    device: &DeviceContext,
    direction: Direction,
    path: &Path,
    link_layer: LinkLayer,
    max_packets: usize,
    verify: bool,
) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = PcapNgReader::new(file).context("Failed to create pcapng reader")?;
    let mut summary = Summary::default();

    println!("{}", "=".repeat(80));
    println!("Processing {}", path.display());
    println!("{}\n", "=".repeat(80));

    while let Some(block) = reader.next_block() {
        if max_packets > 0 && summary.packets >= max_packets {
            break;
        }
        let block = match block {
            Ok(block) => block,
            Err(pcap_file::PcapError::IncompleteBuffer) => break,
            Err(e) => bail!("Error reading packet: {e}"),
        };
        let Block::EnhancedPacket(epb) = block else {
            continue;
        };
        summary.packets += 1;

        let packet = match link_layer.strip(&epb.data) {
            Ok(packet) => packet,
            Err(e) => {
                summary.skipped += 1;
                warn!(packet = summary.packets, error = %e, "skipping frame");
                continue;
            }
        };
        let direction = packet_direction(packet, device.device_address, direction);
        let mut ctx = CompressionContext::for_device(device, direction);

        let compressed = match compress_packet(device, &mut ctx, packet) {
            Ok(compressed) => compressed,
            Err(e) => {
                summary.skipped += 1;
                println!("Packet {}: SKIPPED ({e})", summary.packets);
                continue;
            }
        };
        summary.compressed += 1;
        summary.original_header_bits += compressed.stats.original_header_bits;
        summary.compressed_header_bits += compressed.stats.compressed_header_bits;

        println!(
            "Packet {}: {:?} {} bytes -> {} bytes (Rule: {}/{} - Saved: {} bits)",
            summary.packets,
            direction,
            packet.len(),
            compressed.data.len(),
            compressed.rule_id,
            compressed.rule_id_length,
            compressed.stats.savings_bits()
        );
        debug!(data = %hex::encode(&compressed.data), "compressed");

        if verify {
            match decompress_packet(device, &ctx, &compressed.data) {
                Ok(decompressed) if decompressed.data == packet => {
                    summary.verified += 1;
                    println!("  ✓ Verification: PASSED");
                }
                Ok(decompressed) => {
                    summary.verify_failures += 1;
                    println!("  ✗ Verification: FAILED");
                    for (i, (a, b)) in packet.iter().zip(&decompressed.data).enumerate() {
                        if a != b {
                            println!(
                                "    Diff at byte {i}: original=0x{a:02x}, decompressed=0x{b:02x}"
                            );
                        }
                    }
                    if packet.len() != decompressed.data.len() {
                        println!(
                            "    Length mismatch: original={}, decompressed={}",
                            packet.len(),
                            decompressed.data.len()
                        );
                    }
                }
                Err(e) => {
                    summary.verify_failures += 1;
                    println!("  ✗ Verification ERROR: {e}");
                }
            }
        }
    }

    summary.print();
    Ok(())
}
