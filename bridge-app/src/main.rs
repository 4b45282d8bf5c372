// flexbridge -- run the SmartSDR control bridge, or poke at its pieces
// from the command line.
//
// Usage:
//   flexbridge run
//   flexbridge --config ./flexbridge.toml run
//   flexbridge --host 192.168.1.100 run --display 0.0.0.0:4993
//   flexbridge discover --timeout 5
//   flexbridge decode "00 01 FF 38 00 00 00 00 00 00 00 00 00 00 00 00"
//   flexbridge check-keys
//   flexbridge print-config

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use flexbridge::{Bridge, BridgeConfig};
use flexbridge_core::{s_units_from_dbm, watts_from_dbm};
use flexbridge_flex::discovery::{self, Discovery};
use flexbridge_flex::telemetry;
use flexbridge_flex::{MeterMap, MeterRole};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// flexbridge -- bridge a SmartSDR radio to a remote display/input surface.
#[derive(Parser)]
#[command(name = "flexbridge", version, about)]
struct Cli {
    /// Config file. Defaults to ./flexbridge.toml, then
    /// /etc/flexbridge/flexbridge.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Radio address (e.g. 192.168.1.100). Skips discovery.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Radio TCP command port.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the bridge and serve the display until Ctrl-C.
    Run {
        /// Display listen address (e.g. 127.0.0.1:4993).
        #[arg(long)]
        display: Option<String>,
    },

    /// Listen for a radio announcement and print the first one found.
    Discover {
        /// Seconds to listen before giving up.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Decode one telemetry datagram given as hex.
    Decode {
        /// Payload bytes, e.g. "0001FF38..." or "00 01 FF 38 ...".
        hex: String,
    },

    /// Validate the key bindings in the config file.
    CheckKeys,

    /// Print the effective configuration as TOML.
    PrintConfig,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load the config file and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<(BridgeConfig, Option<PathBuf>)> {
    let (mut config, source) = BridgeConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    apply_overrides(cli, &mut config);
    Ok((config, source))
}

fn apply_overrides(cli: &Cli, config: &mut BridgeConfig) {
    if let Some(host) = &cli.host {
        config.radio.host = Some(host.clone());
    }
    if let Some(port) = cli.port {
        config.radio.command_port = port;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    match &cli.command {
        Command::Run {
            display: Some(display),
        } => config.display.listen = display.clone(),
        Command::Discover {
            timeout: Some(secs),
        } => config.discovery.timeout_ms = secs.saturating_mul(1_000),
        _ => {}
    }
}

/// Parse hex bytes, ignoring whitespace, `:` and `-` separators and an
/// optional `0x` prefix.
fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits ({})", digits.len());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(config: BridgeConfig) -> Result<()> {
    let bridge = Bridge::new(config);

    if let Err(e) = bridge.start().await {
        bridge.shutdown().await;
        return Err(e).context("failed to start bridge");
    }

    if let Some(addr) = bridge.display_addr().await {
        println!("Display server listening on {addr}");
    }
    if let Some(addr) = bridge.radio_addr().await {
        println!("Connected to radio at {addr}");
    }
    println!("Bridge running (Ctrl-C to stop)...");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;

    println!("Stopping...");
    bridge.shutdown().await;
    Ok(())
}

async fn cmd_discover(config: &BridgeConfig) -> Result<()> {
    let cfg = &config.discovery;
    println!(
        "Listening for radio announcements on UDP {} ({} ms)...",
        cfg.port, cfg.timeout_ms
    );

    let found = discovery::discover_on_port(cfg.port, cfg.timeout(), &cfg.marker())
        .await
        .context("discovery failed")?;

    match found {
        Discovery::Found(radio) => {
            println!();
            println!("  Model:     {}", radio.model);
            println!("  Serial:    {}", radio.serial);
            println!("  Nickname:  {}", radio.nickname);
            println!("  Address:   {}", radio.command_addr());
            println!("  Firmware:  {}", radio.firmware_version);
        }
        Discovery::NotFound => println!("No radio found."),
    }
    Ok(())
}

fn cmd_decode(hex: &str) -> Result<()> {
    let bytes = parse_hex_bytes(hex)?;
    let reading = telemetry::decode(&bytes).context("cannot decode datagram")?;

    println!("Meter id:  {}", reading.meter_id);
    println!("Value:     {:.4} dBm", reading.value_dbm);

    match MeterMap::default().role_for_id(reading.meter_id) {
        Some(MeterRole::SMeter) => println!(
            "Role:      s-meter ({})",
            s_units_from_dbm(reading.value_dbm)
        ),
        Some(MeterRole::ForwardPower) => println!(
            "Role:      forward-power ({:.1} W)",
            watts_from_dbm(reading.value_dbm)
        ),
        Some(MeterRole::Swr) => println!("Role:      swr ({:.2}:1)", reading.value_dbm),
        None => println!("Role:      unmapped"),
    }
    Ok(())
}

fn cmd_check_keys(config: &BridgeConfig) -> Result<()> {
    if config.keys.is_empty() {
        println!("No key bindings configured.");
        return Ok(());
    }

    let mut failed = 0;
    for key in &config.keys {
        match key.validate() {
            Ok(registered) => {
                let mode = registered.mode.map_or("-", |m| m.as_str());
                println!("  OK    {:<20}  {:<18}  {}", registered.id, mode, registered.description);
            }
            Err(e) => {
                failed += 1;
                println!("  FAIL  {e}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} key binding(s) are invalid", config.keys.len());
    }
    println!();
    println!("{} key binding(s) valid.", config.keys.len());
    Ok(())
}

fn cmd_print_config(config: &BridgeConfig, source: Option<&PathBuf>) -> Result<()> {
    match source {
        Some(path) => println!("# loaded from {}", path.display()),
        None => println!("# built-in defaults"),
    }
    print!(
        "{}",
        config
            .to_toml_string()
            .context("failed to render configuration")?
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `decode` needs no configuration.
    if let Command::Decode { hex } = &cli.command {
        return cmd_decode(hex);
    }

    let (config, source) = load_config(&cli)?;
    flexbridge::logging::init_logging(Some(&config.logging.level));
    if let Some(path) = &source {
        tracing::debug!(path = %path.display(), "Loaded configuration");
    }

    match cli.command {
        Command::Run { .. } => cmd_run(config).await,
        Command::Discover { .. } => cmd_discover(&config).await,
        Command::CheckKeys => cmd_check_keys(&config),
        Command::PrintConfig => cmd_print_config(&config, source.as_ref()),
        Command::Decode { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(
            parse_hex_bytes("00 01 ff:38").unwrap(),
            vec![0x00, 0x01, 0xFF, 0x38]
        );
        assert_eq!(parse_hex_bytes("0x0A0b").unwrap(), vec![0x0A, 0x0B]);
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn overrides_apply() {
        let cli = Cli::parse_from([
            "flexbridge",
            "--host",
            "10.1.1.1",
            "--port",
            "5000",
            "--log-level",
            "debug",
            "run",
            "--display",
            "0.0.0.0:5555",
        ]);
        let mut config = BridgeConfig::default();
        apply_overrides(&cli, &mut config);
        assert_eq!(config.radio.host.as_deref(), Some("10.1.1.1"));
        assert_eq!(config.radio.command_port, 5000);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.display.listen, "0.0.0.0:5555");

        let cli = Cli::parse_from(["flexbridge", "discover", "--timeout", "7"]);
        let mut config = BridgeConfig::default();
        apply_overrides(&cli, &mut config);
        assert_eq!(config.discovery.timeout_ms, 7_000);
        assert_eq!(config.radio.host, None);
    }

    #[test]
    fn decode_short_payload_fails() {
        assert!(cmd_decode("0001FF38").is_err());
        assert!(cmd_decode("0001FF38000000000000000000000000").is_ok());
    }
}
