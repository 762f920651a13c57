use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use loxy_net::{CaRoot, KeyAlgorithm, generate_ca, write_ca_to_dir};
use loxy_proxy::{HandlerOptions, ProxyConfig, ProxyHandler, ProxyServer};
use loxy_transport::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "loxy", version, about = "Forward HTTP/HTTPS proxy with TLS interception")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Intercept CONNECT tunnels with forged certificates.
    #[arg(long, value_name = "BOOL", action = ArgAction::Set)]
    mitm: Option<bool>,

    /// CA certificate (PEM) used to sign forged certificates.
    #[arg(long = "cert-path", value_name = "PATH")]
    cert_path: Option<PathBuf>,

    /// CA private key (PEM).
    #[arg(long = "key-path", value_name = "PATH")]
    key_path: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8080.
    #[arg(long, value_name = "HOST:PORT")]
    listen: Option<String>,

    /// TOML configuration file. Flags override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a new self-signed CA certificate and key to a directory.
    GenCa {
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
        #[arg(long, default_value = "Loxy Proxy CA")]
        common_name: String,
        /// Use an RSA-2048 key instead of ECDSA P-256.
        #[arg(long)]
        rsa: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Some(Command::GenCa {
        out,
        common_name,
        rsa,
    }) = &cli.command
    {
        return gen_ca(out, common_name, *rsa);
    }

    let config = load_config(&cli)?;
    let transport = Client::new(config.client_config()).map_err(|err| err.to_string())?;
    let mut handler = ProxyHandler::new(Arc::new(transport), HandlerOptions::from(&config));
    if config.mitm.enabled {
        match load_ca(&config) {
            Ok(ca) => handler = handler.with_ca(Arc::new(ca)),
            Err(err) => warn!(error = %err, "CA not loaded, intercepted tunnels will be dropped"),
        }
    }

    let server = ProxyServer::bind(&config.listen_addr(), handler)
        .await
        .map_err(|err| err.to_string())?;
    server.run().await.map_err(|err| err.to_string())
}

fn load_config(cli: &Cli) -> Result<ProxyConfig, String> {
    let mut config = match &cli.config {
        Some(path) => ProxyConfig::load(path).map_err(|err| err.to_string())?,
        None => ProxyConfig::default(),
    };
    if let Some(mitm) = cli.mitm {
        config.mitm.enabled = mitm;
    }
    if let Some(path) = &cli.cert_path {
        config.mitm.cert_path = Some(path.clone());
    }
    if let Some(path) = &cli.key_path {
        config.mitm.key_path = Some(path.clone());
    }
    if let Some(listen) = &cli.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| format!("listen address {listen:?} needs a port"))?;
        config.listen.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        config.listen.port = port
            .parse()
            .map_err(|_| format!("invalid port in listen address {listen:?}"))?;
    }
    Ok(config)
}

fn load_ca(config: &ProxyConfig) -> Result<CaRoot, String> {
    let (Some(cert_path), Some(key_path)) = (&config.mitm.cert_path, &config.mitm.key_path) else {
        return Err("--cert-path and --key-path are required for interception".to_string());
    };
    let ca = CaRoot::load(cert_path, key_path).map_err(|err| err.to_string())?;
    info!(cert = %cert_path.display(), key_kind = ?ca.key_kind(), "CA loaded");
    Ok(ca)
}

fn gen_ca(out: &Path, common_name: &str, rsa: bool) -> Result<(), String> {
    let algorithm = if rsa {
        KeyAlgorithm::Rsa2048
    } else {
        KeyAlgorithm::EcdsaP256
    };
    let ca = generate_ca(common_name, algorithm).map_err(|err| err.to_string())?;
    let material = ca.to_pem().map_err(|err| err.to_string())?;
    let paths = write_ca_to_dir(out, &material).map_err(|err| err.to_string())?;
    info!(
        cert = %paths.cert_path.display(),
        key = %paths.key_path.display(),
        "CA written"
    );
    Ok(())
}
