use uuid::Uuid;
use wind_socks::inbound::SocksInboundOpt;
use wind_vmess::outbound::VmessOutboundConfig;

pub struct Config {
	pub socks_opt: SocksInboundOpt,
	pub vmess_opt: VmessOutboundConfig,
}
impl Config {
	pub fn from_persist(config: super::persistent::PersistentConfig) -> Self {
		Self {
			socks_opt: SocksInboundOpt {
				listen_addr: config.socks_opt.listen_addr,
				public_addr: config.socks_opt.public_addr,
				auth:        config.socks_opt.auth.into(),
				skip_auth:   config.socks_opt.skip_auth,
				allow_udp:   config.socks_opt.allow_udp,
			},
			vmess_opt: VmessOutboundConfig {
				server:    (&config.vmess_opt.server_addr).into(),
				user_id:   Uuid::parse_str(&config.vmess_opt.user_id).expect("invalid vmess user uuid"),
				alter_ids: config.vmess_opt.alter_ids,
				level:     config.vmess_opt.level,
				security:  config.vmess_opt.security.into(),
			},
		}
	}
}
