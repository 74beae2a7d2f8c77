//! lanbridge daemon: serve the gateway and answer pairing prompts on the
//! terminal (`y`/`n`).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use lanbridge::api::{self, GatewayOptions};
use lanbridge::config;
use lanbridge::core_state::CoreState;
use lanbridge::credentials::{self, FileKeyStore};
use lanbridge::operations::OperationRegistry;
use lanbridge::pairing::PairingEvent;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("{} {}", config::APP_NAME, config::APP_VERSION);
            return Ok(());
        }
    }

    lanbridge::init_tracing();
    tracing::info!("lanbridge starting v{}", config::APP_VERSION);

    let cfg = config::load()?;
    std::fs::create_dir_all(&cfg.data_dir)?;
    if cfg.password.is_empty() {
        tracing::warn!("No owner password configured (LANBRIDGE_PASSWORD); pairing is refused");
    }

    let keystore = FileKeyStore::new(cfg.keystore_dir());
    let tls = credentials::ensure_tls_keystore(
        &keystore,
        &cfg.keystore_alias,
        cfg.effective_keystore_passphrase(),
    )?;

    let core = Arc::new(CoreState::open(cfg)?);

    let prompt = tokio::spawn(answer_pairing_prompts(core.clone()));
    let mut server = api::start_gateway(
        core.clone(),
        OperationRegistry::with_builtin(),
        &tls,
        GatewayOptions::default(),
    )
    .await?;

    println!("Certificate fingerprint: {}", tls.fingerprint);
    match api::server::lan_address() {
        Ok(ip) => {
            let url = format!("https://{ip}:{}", server.session.https_addr.port());
            let qr_path = core.config.data_dir.join("pairing.svg");
            match credentials::pairing_qr_svg(&url, &tls) {
                Ok(svg) => {
                    std::fs::write(&qr_path, svg)?;
                    println!("Pair at {url} (QR code: {})", qr_path.display());
                }
                Err(e) => tracing::warn!(error = %e, "Pairing QR code unavailable"),
            }
        }
        Err(e) => tracing::warn!(error = %e, "No LAN address; clients cannot discover this device"),
    }

    shutdown_signal().await?;
    server.stop().await;
    prompt.abort();
    Ok(())
}

/// Print each pairing prompt and read the owner's answer from stdin.
async fn answer_pairing_prompts(core: Arc<CoreState>) {
    let mut events = core.subscribe_pairing();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let prompt = match events.recv().await {
            Ok(PairingEvent::Requested(prompt)) => prompt,
            Ok(PairingEvent::Resolved { client_id, approved }) => {
                println!("Pairing for {client_id}: {}", if approved { "paired" } else { "not paired" });
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Pairing prompts were dropped");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        println!(
            "Pair {} ({} {}, {} {}) from {}? [y/N]",
            prompt.client_id,
            prompt.os_name,
            prompt.os_version,
            prompt.browser_name,
            prompt.browser_version,
            prompt.client_ip,
        );
        let answer = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read pairing answer");
                break;
            }
        };

        let result = if answer.trim().eq_ignore_ascii_case("y") {
            core.approve_pairing(&prompt.client_id)
        } else {
            core.deny_pairing(&prompt.client_id)
        };
        if let Err(e) = result {
            // The prompt expired while waiting for the answer.
            tracing::info!(client_id = %prompt.client_id, error = %e, "Pairing answer ignored");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
