use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use taproot_chain_swap::client::{SwapServiceClient, WsEventStream};
use taproot_chain_swap::config::ClientConfig;
use taproot_chain_swap::keys::{KeyCustody, LocalKey};
use taproot_chain_swap::swap::claim::Confidentiality;
use taproot_chain_swap::swap::controller::{SwapController, SwapRequest, register_swap};
use taproot_chain_swap::swap::dispatcher::SwapDispatcher;
use taproot_chain_swap::swap::{Direction, Network};

#[derive(Debug, clap::Parser)]
struct Args {
    /// JSON file with a `ClientConfig`; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    service_url: Option<String>,

    #[arg(long)]
    ws_url: Option<String>,

    /// mainnet, testnet or regtest
    #[arg(long)]
    network: Option<String>,

    /// btc-to-lbtc or lbtc-to-btc
    #[arg(long)]
    direction: Option<String>,

    #[arg(long)]
    amount: u64,

    #[arg(long)]
    destination: Option<String>,

    /// sat/vbyte for the claim transaction
    #[arg(long)]
    fee_rate: Option<f64>,

    /// Derive the swap key from this mnemonic instead of a fresh random key.
    #[arg(long)]
    mnemonic: Option<String>,

    #[arg(long, default_value_t = 0)]
    key_index: u32,

    #[arg(long, default_value_t = false)]
    allow_unconfidential: bool,
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            ClientConfig::from_json(&json).context("parse config")?
        }
        None => ClientConfig::default(),
    };

    if let Some(url) = &args.service_url {
        config.service_url = url.clone();
    }
    if let Some(url) = &args.ws_url {
        config.ws_url = url.clone();
    }
    if let Some(network) = &args.network {
        config.network = network.parse::<Network>().context("parse --network")?;
    }
    if let Some(direction) = &args.direction {
        config.direction = direction.parse::<Direction>().context("parse --direction")?;
    }
    if args.destination.is_some() {
        config.destination = args.destination.clone();
    }
    if args.fee_rate.is_some() {
        config.fee_rate = args.fee_rate;
    }
    if args.allow_unconfidential {
        config.confidentiality = Confidentiality::Optional;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    taproot_chain_swap::logging::init().ok();
    let args = Args::parse();
    let config = load_config(&args)?;

    let destination = config
        .destination
        .clone()
        .context("a destination address is required (--destination or config)")?;
    let fee_rate = config.fee_rate_override().context("parse --fee-rate")?;

    let custody: Arc<dyn KeyCustody> = match &args.mnemonic {
        Some(mnemonic) => Arc::new(
            LocalKey::from_mnemonic(
                mnemonic,
                config.network == Network::Mainnet,
                args.key_index,
            )
            .context("derive swap key")?,
        ),
        None => Arc::new(LocalKey::generate()),
    };

    let service = Arc::new(
        SwapServiceClient::new(config.service_url.clone(), config.request_timeout())
            .context("create service client")?,
    );

    let record = register_swap(
        service.as_ref(),
        custody.as_ref(),
        &SwapRequest {
            direction: config.direction,
            network: config.network,
            amount: args.amount,
            destination,
            fee_rate,
        },
    )
    .await
    .context("register swap")?;

    let out = serde_json::json!({
        "swap_id": record.swap_id,
        "lockup_address": record.lockup_address,
        "bip21": record.bip21,
        "amount": record.lock_amount,
        "expected_claim_amount": record.expected_claim_amount,
        "service_fee": record.service_fee,
        "quoted_miner_fees": record.miner_fees,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);

    let (stream, events) = WsEventStream::connect(config.ws_url.clone());
    let dispatcher = SwapDispatcher::spawn(events);

    let controller = SwapController::new(
        record,
        service,
        Arc::new(stream),
        custody,
        config.controller_settings(),
    );
    let outcome = dispatcher.drive(controller).await.context("run swap")?;

    let out = serde_json::json!({
        "swap_id": outcome.swap_id,
        "status": outcome.status,
        "lockup_txid": outcome.lockup_txid,
        "claim_txid": outcome.claim_txid,
        "claim_fee": outcome.claim_fee,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
