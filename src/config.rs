//! Command-line and environment configuration.

use crate::registry::RegistryConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "playground")]
#[command(about = "Session gateway for interactive playground pages")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PLAYGROUND_PORT", default_value = "8080")]
    pub port: u16,

    /// Page catalog (JSON)
    #[arg(long, env = "PLAYGROUND_CATALOG", default_value = "pages.json")]
    pub catalog: PathBuf,

    /// Docker binary
    #[arg(long, env = "PLAYGROUND_DOCKER", default_value = "docker")]
    pub docker: String,

    /// Prefix of volume and container names
    #[arg(long, env = "PLAYGROUND_RESOURCE_PREFIX", default_value = "playground")]
    pub resource_prefix: String,

    /// Prefix of per-page image names
    #[arg(long, env = "PLAYGROUND_IMAGE_PREFIX", default_value = "playground-page")]
    pub image_prefix: String,

    /// Image running the file monitor
    #[arg(long, env = "PLAYGROUND_MONITOR_IMAGE", default_value = "playground-monitor")]
    pub monitor_image: String,

    /// Bytes of output kept per button run
    #[arg(long, env = "PLAYGROUND_BUTTON_OUTPUT_LIMIT", default_value = "1048576")]
    pub button_output_limit: usize,

    /// Outbound queue depth per client
    #[arg(long, env = "PLAYGROUND_STREAM_BUFFER", default_value = "256", value_parser = clap::value_parser!(u32).range(1..))]
    pub stream_buffer: u32,

    /// Log filter, e.g. `info` or `playground=debug,tower_http=info`
    #[arg(long, env = "PLAYGROUND_LOG", default_value = "info")]
    pub log: String,
}

impl Config {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            resource_prefix: self.resource_prefix.clone(),
            image_prefix: self.image_prefix.clone(),
            monitor_image: self.monitor_image.clone(),
            button_output_limit: self.button_output_limit,
            stream_buffer: self.stream_buffer as usize,
        }
    }
}
