use std::sync::Arc;

use clap::Parser as _;
use tokio::task::JoinSet;
use tracing::Level;
use wind_core::{
	AbstractInbound, AppContext, info,
	dispatch::{Dispatcher, FixedRoutingPolicy},
};
use wind_socks::inbound::SocksInbound;
use wind_vmess::outbound::VmessOutbound;

use crate::cli::{Cli, Commands, ConfigFormat};

mod cli;
mod conf;
mod log;
mod util;

const DEFAULT_OUTBOUND_TAG: &str = "vmess-out";

// curl --socks5 127.0.0.1:6666 bing.com
#[tokio::main]
async fn main() -> eyre::Result<()> {
	log::init_log(Level::TRACE)?;
	info!(target: "[MAIN]", "Wind starting");
	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{:#}", err);
			return Ok(());
		}
	};

	if cli.version {
		const VER: &str = match option_env!("WIND_OVERRIVE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("wind {VER}");
		return Ok(());
	}

	if let Some(Commands::Init { format }) = &cli.command {
		let persistent = conf::persistent::PersistentConfig::default();
		let (path, format) = match format {
			ConfigFormat::Yaml => ("config.yaml", "yaml"),
			ConfigFormat::Toml => ("config.toml", "toml"),
		};
		persistent.export_to_file(&std::path::PathBuf::from(path), format)?;
		println!("wrote default configuration to {path}");
		return Ok(());
	}

	let persistent = conf::persistent::PersistentConfig::load(cli.config.clone(), cli.config_dir.clone())?;
	let vmess_server_addr = util::target_addr_to_socket_addr(&persistent.vmess_opt.server_addr);
	info!(target: "[MAIN]", "vmess server resolves to {vmess_server_addr}");
	let config = conf::runtime::Config::from_persist(persistent);

	let ctx = Arc::new(AppContext::new());

	let dispatcher = Arc::new(Dispatcher::new(Arc::new(FixedRoutingPolicy::new(DEFAULT_OUTBOUND_TAG))));
	dispatcher.register_outbound(DEFAULT_OUTBOUND_TAG, Arc::new(VmessOutbound::new(config.vmess_opt)));

	let inbound = Arc::new(SocksInbound::new(ctx.clone(), config.socks_opt, "socks-in", dispatcher));

	let mut set: JoinSet<eyre::Result<()>> = JoinSet::new();
	let inbound_clone = inbound.clone();
	let ctx_clone = ctx.clone();
	set.spawn(async move { inbound_clone.listen(&ctx_clone).await });

	while let Some(v) = set.join_next().await {
		if let Ok(Err(e)) = v {
			return Err(e);
		}
	}

	ctx.tasks.wait().await;
	Ok(())
}
