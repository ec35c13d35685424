//! Endpoint, trunk and channel queries over AMI.
//!
//! Every public operation opens its own [`AmiTransport`], performs exactly one
//! request/response cycle, logs off and returns a record. Failures end up in the
//! record's `status` / `error` fields; nothing here returns `Err`.

use serde::Serialize;
#[cfg(feature = "docs")]
use utoipa::ToSchema;

use crate::extract::{
    extract_channel_codecs, extract_endpoint_ami, extract_endpoint_cli, extract_endpoints_ami,
    extract_rtp_stats, merge_endpoint, ChannelCodecInfo, EndpointStatus, RtpStats,
};
use crate::transport::{AmiTransport, Terminator};
use crate::{AmiAction, CommandRunner, ManagerOptions, ObserverError};

/// An endpoint whose reachability matters.
#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrunkStatus {
    #[serde(flatten)]
    pub endpoint: EndpointStatus,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
}

impl From<EndpointStatus> for TrunkStatus {
    fn from(endpoint: EndpointStatus) -> Self {
        Self {
            reachable: endpoint.registered,
            latency_ms: endpoint.last_qualify_ms,
            endpoint,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsteriskStatusService {
    options: ManagerOptions,
    cli: Option<CommandRunner>,
}

impl AsteriskStatusService {
    pub fn new(options: ManagerOptions) -> Self {
        Self { options, cli: None }
    }

    /// Consult `pjsip show endpoint <x>` when AMI cannot answer for an endpoint.
    pub fn with_cli_fallback(mut self, runner: CommandRunner) -> Self {
        self.cli = Some(runner);
        self
    }

    fn transport(&self) -> AmiTransport {
        AmiTransport::new(self.options.clone())
    }

    pub async fn get_endpoint_details(&self, name: &str) -> EndpointStatus {
        if let Err(reason) = check_identifier(name) {
            return EndpointStatus::failed(name, reason);
        }

        let ami = self.query_endpoint_ami(name).await;
        if ami.status.is_answered() {
            return ami;
        }
        match &self.cli {
            Some(runner) => {
                log::debug!("AMI could not answer for endpoint '{name}', trying the CLI");
                let cli = query_endpoint_cli(runner, name).await;
                merge_endpoint(ami, Some(cli))
            }
            None => ami,
        }
    }

    /// Every endpoint in one `PJSIPShowEndpoints` listing.
    ///
    /// When the listing cannot be fetched the result is empty and the failure is logged.
    pub async fn get_all_endpoints(&self) -> Vec<EndpointStatus> {
        let mut transport = self.transport();
        let result = transport
            .request(
                AmiAction::show_endpoints(),
                Terminator::EventListComplete,
                self.options.listing_timeout(),
            )
            .await;
        transport.logoff().await;

        match result {
            Ok(response) if response.is_error() => {
                log::warn!(
                    "PJSIPShowEndpoints failed: {}",
                    response.message().unwrap_or_default()
                );
                Vec::new()
            }
            Ok(response) => {
                if response.is_incomplete() {
                    log::debug!("Endpoint listing was cut off by the listing deadline");
                }
                extract_endpoints_ami(&response.raw)
            }
            Err(e) => {
                log::warn!("Could not list endpoints: {e}");
                Vec::new()
            }
        }
    }

    pub async fn get_all_registered_endpoints(&self) -> Vec<EndpointStatus> {
        self.get_all_endpoints()
            .await
            .into_iter()
            .filter(|endpoint| endpoint.registered)
            .collect()
    }

    pub async fn get_trunk_status(&self, trunk: &str) -> TrunkStatus {
        TrunkStatus::from(self.get_endpoint_details(trunk).await)
    }

    /// Codec details from `core show channel <channel>`.
    pub async fn get_channel_codec_info(&self, channel: &str) -> ChannelCodecInfo {
        match self.channel_command("core show channel", channel).await {
            Ok(output) => extract_channel_codecs(channel, &output),
            Err(e) => ChannelCodecInfo {
                error: Some(e.to_string()),
                ..extract_channel_codecs(channel, "")
            },
        }
    }

    /// RTP counters from `rtp show stats <channel>`.
    pub async fn get_rtp_stats(&self, channel: &str) -> RtpStats {
        match self.channel_command("rtp show stats", channel).await {
            Ok(output) => extract_rtp_stats(channel, &output),
            Err(e) => RtpStats {
                error: Some(e.to_string()),
                ..extract_rtp_stats(channel, "")
            },
        }
    }

    async fn query_endpoint_ami(&self, name: &str) -> EndpointStatus {
        let mut transport = self.transport();
        let result = transport
            .request(
                AmiAction::show_endpoint(name),
                Terminator::EventListComplete,
                self.options.response_timeout(),
            )
            .await;
        transport.logoff().await;

        match result {
            Ok(response) if response.is_error() => EndpointStatus::failed(
                name,
                response
                    .message()
                    .unwrap_or_else(|| format!("PJSIPShowEndpoint {name} failed")),
            ),
            Ok(response) => {
                let mut status = extract_endpoint_ami(name, &response.raw);
                if response.is_incomplete() && !status.status.is_answered() {
                    status.error = Some("incomplete response from AMI".to_string());
                }
                status
            }
            Err(e) => endpoint_from_error(name, &e),
        }
    }

    async fn channel_command(&self, command: &str, channel: &str) -> Result<String, ObserverError> {
        check_identifier(channel).map_err(ObserverError::CommandRejected)?;
        let mut transport = self.transport();
        let result = transport.command(&format!("{command} {channel}")).await;
        transport.logoff().await;
        let (output, complete) = result?;
        if !complete {
            log::debug!("'{command} {channel}' output cut off by the response deadline");
        }
        Ok(output)
    }
}

async fn query_endpoint_cli(runner: &CommandRunner, name: &str) -> EndpointStatus {
    match runner.asterisk_rx(&format!("pjsip show endpoint {name}")).await {
        Ok(output) if output.success => extract_endpoint_cli(name, &output.stdout),
        Ok(output) => EndpointStatus::unknown(name, output.failure_summary()),
        Err(e) => endpoint_from_error(name, &e),
    }
}

fn endpoint_from_error(name: &str, error: &ObserverError) -> EndpointStatus {
    match error {
        ObserverError::Connection(_) | ObserverError::Io(_) | ObserverError::Timeout(_) => {
            EndpointStatus::unknown(name, error.to_string())
        }
        _ => EndpointStatus::failed(name, error.to_string()),
    }
}

/// Names end up inside AMI headers and CLI command lines.
pub(crate) fn check_identifier(value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err("name is empty".to_string());
    }
    if value.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(format!("invalid name '{}'", value.escape_debug()));
    }
    Ok(())
}
