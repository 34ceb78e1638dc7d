//! MeshTunnel CLI
//!
//! Relays TCP (and optionally UDP) traffic from one address to another.
//! This binary links no overlay client, so both sides must be socket
//! addresses; applications embedding the relay supply their own provider.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::future::select_all;
use tracing::{error, info};

use meshtunnel_core::{AcceptAddrs, Account, TunnelConfig};
use meshtunnel_logging::{try_init as try_init_logging, LogLevel};
use meshtunnel_relay::Tunnel;
use meshtunnel_settings::Settings;

/// MeshTunnel - relay streams and datagrams between two addresses
#[derive(Parser, Debug)]
#[command(name = "meshtunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of overlay sub-clients [default: 4]
    #[arg(short = 'n')]
    clients: Option<usize>,

    /// Secret seed (hex)
    #[arg(short = 's', default_value = "")]
    seed: String,

    /// Overlay address identifier
    #[arg(short = 'i', default_value = "")]
    identifier: String,

    /// From address ("nkn" or host:port), comma separated for several tunnels
    #[arg(long)]
    from: String,

    /// To address (overlay address or host:port), comma separated for several tunnels
    #[arg(long)]
    to: String,

    /// Dial timeout in milliseconds, 0 for none
    #[arg(short = 't', default_value_t = 0)]
    dial_timeout: u64,

    /// Accept addresses (comma separated regular expressions)
    #[arg(long)]
    accept: Option<String>,

    /// Enable NAT traversal mode
    #[arg(long)]
    nat: bool,

    /// NAT traversal service node allowed countries (comma separated ISO codes)
    #[arg(long)]
    country: Option<String>,

    /// NAT traversal service name
    #[arg(long)]
    tsn: Option<String>,

    /// NAT traversal subscription prefix
    #[arg(long)]
    tsp: Option<String>,

    /// NAT traversal max price per MB [default: 0.01]
    #[arg(long)]
    nat_max_price: Option<String>,

    /// NAT traversal min nano pay fee [default: 0.00001]
    #[arg(long)]
    nat_min_fee: Option<String>,

    /// NAT traversal nano pay fee ratio [default: 0.1]
    #[arg(long)]
    nat_fee_ratio: Option<f64>,

    /// Download the geo database for country filtering
    #[arg(long)]
    nat_download_geo_db: bool,

    /// Path of the geo database [default: .]
    #[arg(long)]
    nat_geo_db_path: Option<String>,

    /// Measure NAT traversal node bandwidth
    #[arg(long)]
    nat_measure_bandwidth: bool,

    /// Session MTU, 0 for the default
    #[arg(long, default_value_t = 0)]
    mtu: u32,

    /// Seed RPC servers (comma separated)
    #[arg(long, default_value = "")]
    rpc: String,

    /// Also relay UDP (requires --nat)
    #[arg(long)]
    udp: bool,

    /// Seconds before an idle UDP session is purged, 0 for never
    #[arg(long, default_value_t = 0)]
    udp_idle: u32,

    /// JSON settings file applied before the flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Settings file (if any) overridden by the flags
    fn tunnel_config(&self) -> Result<TunnelConfig> {
        let mut config = match &self.config {
            Some(path) => Settings::load_from(path)
                .with_context(|| format!("loading {}", path.display()))?
                .tunnel,
            None => TunnelConfig::default(),
        };

        let rpc = split_list(&self.rpc);
        let flags = TunnelConfig {
            num_sub_clients: self.clients.unwrap_or(0),
            accept_addrs: self.accept.as_deref().map(split_list),
            udp: self.udp,
            udp_idle_secs: self.udp_idle,
            verbose: self.verbose,
            ..TunnelConfig::default()
        };
        config.merge_from(flags);

        if !rpc.is_empty() {
            config.client.seed_rpc_servers = rpc.clone();
            config.wallet.seed_rpc_servers = rpc;
        }
        if self.mtu != 0 {
            config.client.session.mtu = self.mtu;
        }
        if self.dial_timeout != 0 {
            config.dial.dial_timeout_ms = self.dial_timeout;
        }

        // Only flags actually given replace what the settings file holds.
        let nat = &mut config.nat;
        if let Some(name) = &self.tsn {
            nat.service_name = name.clone();
        }
        if let Some(prefix) = &self.tsp {
            nat.subscription_prefix = prefix.clone();
        }
        if let Some(price) = &self.nat_max_price {
            nat.max_price = price.clone();
        }
        if let Some(fee) = &self.nat_min_fee {
            nat.min_nano_pay_fee = fee.clone();
        }
        if let Some(ratio) = self.nat_fee_ratio {
            nat.nano_pay_fee_ratio = ratio;
        }
        if let Some(countries) = &self.country {
            nat.allowed_countries = split_list(countries);
        }
        if let Some(path) = &self.nat_geo_db_path {
            nat.geo_db_path = path.clone();
        }
        nat.download_geo_db |= self.nat_download_geo_db;
        nat.measure_bandwidth |= self.nat_measure_bandwidth;

        Ok(config)
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.tunnel_config()?;

    if let Some(patterns) = &config.accept_addrs {
        // Fail on a bad pattern before anything binds.
        AcceptAddrs::new(patterns).context("invalid --accept")?;
    }

    let account = if cli.seed.is_empty() {
        Account::generate()
    } else {
        Account::from_seed_hex(&cli.seed).context("invalid seed")?
    };

    let from = split_list(&cli.from);
    let to = split_list(&cli.to);
    if from.is_empty() {
        bail!("--from is required");
    }

    let tunnels = Tunnel::new_tunnels(
        None,
        &account,
        &cli.identifier,
        &from,
        &to,
        cli.nat,
        Some(config),
    )
    .await
    .context("creating tunnel")?;

    let runs = tunnels
        .iter()
        .map(|tunnel| {
            let tunnel = tunnel.clone();
            Box::pin(async move { tunnel.start().await })
        })
        .collect::<Vec<_>>();

    tokio::select! {
        (result, index, _) = select_all(runs) => {
            for tunnel in &tunnels {
                let _ = tunnel.close().await;
            }
            result.with_context(|| format!("tunnel {} stopped", tunnels[index].from_addr()))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            for tunnel in &tunnels {
                if let Err(e) = tunnel.close().await {
                    error!("Closing tunnel {}: {}", tunnel.from_addr(), e);
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _ = try_init_logging(LogLevel::from_verbose(cli.verbose));

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["meshtunnel"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_requires_from_and_to() {
        assert!(Cli::try_parse_from(["meshtunnel", "--from", "127.0.0.1:1"]).is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = parse(&[
            "--from", "127.0.0.1:8000",
            "--to", "127.0.0.1:9000",
            "-n", "8",
            "-t", "1500",
            "--udp", "--nat",
            "--udp-idle", "30",
            "--accept", "^a\\., ^b\\.",
            "--rpc", "http://seed-1:30003,http://seed-2:30003",
            "--mtu", "1400",
            "--country", "US, DE",
        ]);
        let config = cli.tunnel_config().unwrap();

        assert_eq!(config.num_sub_clients, 8);
        assert_eq!(config.dial.dial_timeout_ms, 1500);
        assert!(config.udp);
        assert_eq!(config.udp_idle_secs, 30);
        assert_eq!(
            config.accept_addrs,
            Some(vec!["^a\\.".to_string(), "^b\\.".to_string()])
        );
        assert_eq!(config.client.seed_rpc_servers.len(), 2);
        assert_eq!(config.wallet.seed_rpc_servers, config.client.seed_rpc_servers);
        assert_eq!(config.client.session.mtu, 1400);
        assert_eq!(config.nat.allowed_countries, vec!["US", "DE"]);
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--from", "nkn", "--to", "127.0.0.1:9000"]);
        let config = cli.tunnel_config().unwrap();
        assert_eq!(config.num_sub_clients, 4);
        assert_eq!(config.accept_addrs, None);
        assert_eq!(config.dial.timeout(), None);
        assert_eq!(config.udp_idle_time(), None);
        assert_eq!(config.nat.max_price, "0.01");
    }

    #[test]
    fn test_settings_file_nat_values_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.tunnel.nat.service_name = "reverse".to_string();
        settings.tunnel.nat.max_price = "0.5".to_string();
        settings.tunnel.nat.nano_pay_fee_ratio = 0.25;
        settings.tunnel.nat.geo_db_path = "/var/lib/geo".to_string();
        settings.tunnel.nat.allowed_countries = vec!["FR".to_string()];
        settings.tunnel.nat.measure_bandwidth = true;
        settings.save_to(&path).unwrap();

        let path_arg = path.to_string_lossy().into_owned();
        let cli = parse(&[
            "--from", "127.0.0.1:8000",
            "--to", "127.0.0.1:9000",
            "--config", &path_arg,
            "--tsp", "sub.",
        ]);
        let nat = cli.tunnel_config().unwrap().nat;

        assert_eq!(nat.service_name, "reverse");
        assert_eq!(nat.max_price, "0.5");
        assert_eq!(nat.nano_pay_fee_ratio, 0.25);
        assert_eq!(nat.geo_db_path, "/var/lib/geo");
        assert_eq!(nat.allowed_countries, vec!["FR"]);
        assert!(nat.measure_bandwidth);
        assert_eq!(nat.subscription_prefix, "sub.");
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
