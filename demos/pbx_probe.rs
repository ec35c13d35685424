use asterisk_observer::{
    AsteriskStatusService, CommandRunner, ConsoleCommandGateway, ObserverConfig, PjsipValidation,
};
use env_logger::{Builder, Env};
use log::{info, warn};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

// Prints a one-shot report about the local PBX, then follows its log until Ctrl-C.
//
// Run with:
//   AMI_USERNAME=admin AMI_PASSWORD=secret \
//   RUST_LOG=info,asterisk_observer=debug \
//   cargo run --example pbx_probe -- 100 provider

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Builder::from_env(Env::new().default_filter_or("info")).init();

    let config = ObserverConfig::from_env();
    let mut args = std::env::args().skip(1);
    let extension = args.next().unwrap_or_else(|| "100".to_string());
    let trunk = args.next();

    let gateway = ConsoleCommandGateway::new(config.clone());
    let service = gateway.service_status().await;
    info!("asterisk service: {} (active={})", service.state, service.active);

    match gateway.core_version().await {
        Ok(version) if version.success => info!("{}", version.output.trim()),
        Ok(version) => warn!("core show version failed: {:?}", version.error),
        Err(e) => warn!("core show version refused: {e}"),
    }

    let status = AsteriskStatusService::new(config.ami.clone())
        .with_cli_fallback(CommandRunner::new(config.cli.clone()));
    let endpoint = status.get_endpoint_details(&extension).await;
    println!("{}", serde_json::to_string_pretty(&endpoint)?);

    let registered = status.get_all_registered_endpoints().await;
    info!("{} endpoints currently registered", registered.len());

    let validation = PjsipValidation::from_config(&config);
    let registration = validation.validate_extension_registration(&extension).await;
    println!("{}", serde_json::to_string_pretty(&registration)?);

    if let Some(trunk) = trunk {
        let trunk_status = status.get_trunk_status(&trunk).await;
        info!(
            "trunk {}: reachable={} latency={:?}",
            trunk_status.endpoint.name, trunk_status.reachable, trunk_status.latency_ms
        );
        let check = validation.validate_trunk_connection(&trunk).await;
        for error in &check.errors {
            warn!("trunk {trunk}: {error}");
        }
    }

    for event in gateway.get_recent_errors(10).await {
        println!("recent {event}");
    }

    let cancel = CancellationToken::new();
    let mut events = match gateway.stream_live_output(5, cancel.clone()).await {
        Ok(events) => events,
        Err(e) => {
            warn!("live log unavailable: {e}");
            return Ok(());
        }
    };
    info!("Following the Asterisk log, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                break;
            }
            event = events.next() => match event {
                Some(event) => println!("{event}"),
                None => break,
            },
        }
    }
    Ok(())
}
