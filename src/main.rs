use anyhow::{Context, Result};
use clap::Parser;
use rev_tunnel::cli::{Cli, Commands};
use rev_tunnel::config::ClientConfig;
use rev_tunnel::descriptor::{ForwardDescriptor, ForwardTarget};
use rev_tunnel::prefs::{self, Preferences};
use rev_tunnel::session::{self, ForwardOptions, SessionEvent};
use rev_tunnel::{api, tls};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("rev-tunnel v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Forward {
            forwards,
            key,
            config,
            timeout,
            transport,
        } => {
            run_forward(forwards, key, config, timeout, transport).await?;
        }
        Commands::Auth {
            email,
            password,
            config,
        } => {
            run_auth(email, password, config).await?;
        }
        Commands::Check { config } => {
            ClientConfig::load(&config)?;
            println!("Configuration OK: {}", config);
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            tls::generate_self_signed_cert(
                &common_name,
                &alt_names,
                Path::new(&cert_out),
                Path::new(&key_out),
            )?;
            println!("Generated self-signed certificate: {}", cert_out);
            println!("Generated private key: {}", key_out);
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::load(path),
        None => Ok(ClientConfig::default()),
    }
}

/// 解析 `subdomain=target` 形式的转发声明
fn parse_forward_specs(specs: &[String]) -> Result<Vec<ForwardDescriptor>> {
    let mut descriptors = Vec::with_capacity(specs.len());
    for spec in specs {
        let (subdomain, target) = spec
            .split_once('=')
            .with_context(|| format!("Invalid forward '{}': expected subdomain=target", spec))?;
        let target = ForwardTarget::parse(target)?;
        descriptors.push(ForwardDescriptor::new(subdomain, target));
    }
    Ok(descriptors)
}

async fn run_forward(
    specs: Vec<String>,
    key: Option<String>,
    config_path: Option<String>,
    timeout: Option<u64>,
    transport: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    if let Some(transport) = transport {
        config.transport = transport.parse()?;
    }

    let preferences = Preferences::load(&prefs::default_path())?;

    // 未给出转发声明时回退到偏好文件中保存的转发
    let specs = if specs.is_empty() {
        preferences
            .forwards
            .iter()
            .map(|f| format!("{}={}", f.subdomain, f.target))
            .collect()
    } else {
        specs
    };
    if specs.is_empty() {
        anyhow::bail!("No forwards given; pass subdomain=target or save defaults first");
    }

    let key = key
        .or(preferences.key)
        .context("No API key; pass --key or run 'rev-tunnel auth' first")?;

    let options = ForwardOptions {
        forwards: parse_forward_specs(&specs)?,
        key,
        idle_timeout: timeout.map(Duration::from_millis),
        ..Default::default()
    };

    let mut session = session::forward(&config, options).await?;
    for forward in session.forwards() {
        info!("Forwarding {}", forward.url);
    }

    // Ctrl-C 走统一的优雅关闭流程
    let handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; closing session");
            if let Err(e) = handle.close().await {
                error!("Close failed: {}", e);
                handle.destroy();
            }
        }
    });

    while let Some(event) = session.next_event().await {
        match event {
            SessionEvent::Ready(None) => info!("Tunnel ready"),
            SessionEvent::Ready(Some(e)) => warn!("Tunnel ready with error: {}", e),
            SessionEvent::Revoking => warn!("Connection revoked by server"),
            SessionEvent::Error(e) => warn!("Tunnel error: {}", e),
            SessionEvent::Idle => {
                info!("Session idle; closing");
                let _ = session.timeout().await;
            }
            SessionEvent::LocalError { error, forward } => {
                warn!("Local error for '{}': {}", forward.subdomain, error);
            }
            SessionEvent::Close(info) => {
                if info.will_retry {
                    warn!("Connection closed ({}); retrying", info.reason);
                } else {
                    info!("Session closed ({}: {})", info.reason, info.message);
                    break;
                }
            }
            _ => {}
        }
    }

    Ok(())
}

async fn run_auth(email: String, password: String, config_path: Option<String>) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let client = api::Client::new(&config.api)?;

    let params = serde_json::json!({
        "email": email,
        "password": password,
    });
    let reply = client.auth(&params).await?;

    let path = prefs::default_path();
    let mut preferences = Preferences::load(&path)?;
    preferences.key = Some(reply.token);
    preferences.save(&path)?;

    println!("Authenticated; token saved to {:?}", path);
    Ok(())
}
