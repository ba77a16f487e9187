//! voice-mesh: runs a full-mesh voice session between simulated participants

mod mesh;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use mesh::{Mesh, MeshOptions};
use network::TransportConfig;
use room::VoiceConfig;
use settings_manager::{ConfigManager, Settings};
use std::path::PathBuf;
use std::time::Duration;

/// voice-mesh - peer-to-peer voice between room participants
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Number of participants in the mesh
    #[clap(short, long, default_value_t = 3)]
    participants: usize,

    /// How long to keep audio flowing
    #[clap(short, long, default_value_t = 10)]
    seconds: u64,

    /// Capture the first participant from the configured input device
    #[clap(short, long)]
    microphone: bool,

    /// Settings file (defaults to the user config directory)
    #[clap(short, long)]
    config: Option<PathBuf>,
}

fn mesh_options(args: &Args, settings: &Settings) -> MeshOptions {
    MeshOptions {
        participants: args.participants,
        duration: Duration::from_secs(args.seconds),
        microphone: args.microphone.then(|| settings.audio_input_device.clone()),
        username: settings.username.clone(),
        voice: VoiceConfig {
            transport: TransportConfig {
                ice_servers: settings.ice_servers.clone(),
                enable_mdns: settings.enable_mdns,
            },
            queue_capacity: settings.event_queue_capacity.max(1),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging based on debug flag
    if args.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
        debug!("Debug logging enabled");
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config = match &args.config {
        Some(path) => ConfigManager::with_file(path),
        None => ConfigManager::new(),
    }
    .context("Failed to load config")?;
    debug!("Using settings from {:?}", config.config_file());

    info!("Starting voice mesh with {} participant(s)", args.participants);
    let mesh = Mesh::start(mesh_options(&args, config.settings())).await?;
    mesh.join_all().await?;
    mesh.run().await?;

    for report in mesh.shutdown().await? {
        info!(
            "{}: {} peer(s), {} connected",
            report.name,
            report.snapshot.peers.len(),
            report.snapshot.connected_peers()
        );
        for (peer, level) in &report.received {
            info!(
                "  from {}: {} frame(s), peak level {:.3}",
                peer, level.frames, level.peak_rms
            );
        }
    }

    info!("Exiting voice mesh");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["voice-mesh"]);
        assert_eq!(args.participants, 3);
        assert_eq!(args.seconds, 10);
        assert!(!args.debug && !args.microphone);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_options_follow_settings() {
        let args = Args::parse_from(["voice-mesh", "-p", "5", "--seconds", "2", "--microphone"]);
        let mut settings = Settings::default();
        settings.username = "Ada".to_string();
        settings.audio_input_device = "USB Mic".to_string();
        settings.enable_mdns = true;

        let options = mesh_options(&args, &settings);
        assert_eq!(options.participants, 5);
        assert_eq!(options.duration, Duration::from_secs(2));
        assert_eq!(options.microphone.as_deref(), Some("USB Mic"));
        assert_eq!(options.username, "Ada");
        assert!(options.voice.transport.enable_mdns);
        assert_eq!(options.voice.queue_capacity, 100);
    }

    #[test]
    fn test_config_flag_loads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        std::fs::write(&path, "username = \"Grace\"\nice_servers = [\"stun:stun.example.org:3478\"]\n").unwrap();

        let args = Args::parse_from(["voice-mesh", "--config", path.to_str().unwrap()]);
        let config = ConfigManager::with_file(args.config.as_ref().unwrap()).unwrap();
        let options = mesh_options(&args, config.settings());

        assert!(options.microphone.is_none());
        assert_eq!(options.voice.transport.ice_servers, vec!["stun:stun.example.org:3478"]);
    }
}
