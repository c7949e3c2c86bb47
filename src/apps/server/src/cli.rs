use clap::Parser;
use std::path::PathBuf;
use tavern_proxy_core::{ProxyConfig, ProxyResult};
use tavern_proxy_core_types::BackendKind;

#[derive(Debug, Parser)]
#[command(name = "tavern-proxy")]
#[command(version, about = "OpenAI-compatible chat proxy for local text-generation backends", long_about = None)]
pub struct Args {
    /// Config file (default: ./config.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Skip discovery: kobold, koboldcpp, ooba, llama.cpp, llama-cpp-python or horde
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// trace, debug, info, warn, error or off
    #[arg(long)]
    pub log_level: Option<String>,

    /// Debug logging with targets
    #[arg(long)]
    pub debug: bool,
}

impl Args {
    /// File values first, command-line values on top.
    pub fn load_config(&self) -> ProxyResult<ProxyConfig> {
        let mut config = ProxyConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(backend) = self.backend {
            config.backend_type = Some(backend);
            config.horde.enable = backend == BackendKind::Horde;
        }
    }
}
