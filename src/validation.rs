//! Higher-level PJSIP checks built on `asterisk -rx`.
//!
//! Each check gathers every problem it can find into `errors` instead of stopping
//! at the first one. Losing the PBX is reported once: after a CLI call fails, the
//! remaining calls of the same check are skipped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
#[cfg(feature = "docs")]
use utoipa::ToSchema;

use crate::extract::cli_contact_rows;
use crate::status::check_identifier;
use crate::{CommandRunner, ObserverConfig};

static EXPIRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)expir\w*\s*[:=]\s*(\d+)").expect("expiry regex"));
static USER_AGENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*user[_\- ]?agent\s*:\s*(\S.*?)\s*$").expect("user agent regex")
});
static DIALPLAN_APPLICATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"=>\s*\d+\.\s*([A-Za-z]\w*)\(").expect("application regex"));
static DIAL_TRUNK_AT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:PJSIP|SIP|IAX2)/[^@,)\s]*@([\w.\-]+)").expect("trunk regex")
});
static DIAL_TRUNK_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:PJSIP|SIP|IAX2|DAHDI)/([\w.\-]+)/").expect("trunk path regex")
});

const NOT_FOUND_MARKER: &str = "Unable to find object";

#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrunkValidation {
    pub name: String,
    pub exists: bool,
    pub reachable: bool,
    pub qualify_status: Option<String>,
    pub contact_count: usize,
    pub latency_ms: Option<f64>,
    pub errors: Vec<String>,
}

#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionValidation {
    pub extension: String,
    pub exists: bool,
    pub registered: bool,
    pub contact_uri: Option<String>,
    pub expires_s: Option<u64>,
    pub user_agent: Option<String>,
    pub errors: Vec<String>,
}

#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRoutingResult {
    pub from: String,
    pub to: String,
    pub context: String,
    pub route_found: bool,
    pub application: Option<String>,
    pub trunk: Option<String>,
    pub errors: Vec<String>,
}

/// Runs the CLI calls of one check and stops calling after the first failure.
struct CliSession<'a> {
    runner: &'a CommandRunner,
    lost: bool,
}

impl<'a> CliSession<'a> {
    fn new(runner: &'a CommandRunner) -> Self {
        Self {
            runner,
            lost: false,
        }
    }

    async fn query(&mut self, command: &str, errors: &mut Vec<String>) -> Option<String> {
        if self.lost {
            return None;
        }
        match self.runner.asterisk_rx(command).await {
            Ok(output) if output.success => Some(output.stdout),
            Ok(output) => {
                self.lost = true;
                errors.push(format!("'{command}' {}", output.failure_summary()));
                None
            }
            Err(e) => {
                self.lost = true;
                errors.push(format!("'{command}' failed: {e}"));
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PjsipValidation {
    runner: CommandRunner,
    routing_context: String,
}

impl PjsipValidation {
    pub fn new(runner: CommandRunner, routing_context: impl Into<String>) -> Self {
        Self {
            runner,
            routing_context: routing_context.into(),
        }
    }

    pub fn from_config(config: &ObserverConfig) -> Self {
        Self::new(
            CommandRunner::new(config.cli.clone()),
            config.routing_context.clone(),
        )
    }

    /// Reachable when the endpoint exists and either a contact qualifies or the AOR
    /// holds at least one contact.
    pub async fn validate_trunk_connection(&self, name: &str) -> TrunkValidation {
        let mut result = TrunkValidation {
            name: name.to_string(),
            exists: false,
            reachable: false,
            qualify_status: None,
            contact_count: 0,
            latency_ms: None,
            errors: Vec::new(),
        };
        if let Err(reason) = check_identifier(name) {
            result.errors.push(reason);
            return result;
        }

        let mut session = CliSession::new(&self.runner);
        let Some(endpoint) = session
            .query(&format!("pjsip show endpoint {name}"), &mut result.errors)
            .await
        else {
            return result;
        };

        result.exists = endpoint.contains("Endpoint:") && !endpoint.contains(NOT_FOUND_MARKER);
        if !result.exists {
            result.errors.push(format!("Trunk endpoint '{name}' not found"));
            return result;
        }

        let contacts = cli_contact_rows(&endpoint);
        let qualified = contacts.iter().find(|c| is_qualified(&c.status));
        result.qualify_status = qualified
            .or_else(|| contacts.first())
            .map(|c| c.status.clone());
        result.latency_ms = qualified.and_then(|c| c.rtt_ms);

        if let Some(aor) = session
            .query(&format!("pjsip show aor {name}"), &mut result.errors)
            .await
        {
            if aor.contains(NOT_FOUND_MARKER) {
                result.errors.push(format!("AOR for trunk '{name}' not found"));
            } else {
                result.contact_count = cli_contact_rows(&aor).len();
            }
        }

        result.reachable = qualified.is_some() || result.contact_count > 0;
        if !result.reachable {
            result.errors.push(format!(
                "Trunk '{name}' is not reachable: no qualified or registered contacts"
            ));
        }
        log::debug!(
            "Trunk '{name}': reachable={} qualify={:?} contacts={}",
            result.reachable,
            result.qualify_status,
            result.contact_count
        );
        result
    }

    /// Registered when the AOR lists a contact; the User-Agent comes from the endpoint.
    pub async fn validate_extension_registration(&self, extension: &str) -> ExtensionValidation {
        let mut result = ExtensionValidation {
            extension: extension.to_string(),
            exists: false,
            registered: false,
            contact_uri: None,
            expires_s: None,
            user_agent: None,
            errors: Vec::new(),
        };
        if let Err(reason) = check_identifier(extension) {
            result.errors.push(reason);
            return result;
        }

        let mut session = CliSession::new(&self.runner);

        if let Some(aor) = session
            .query(&format!("pjsip show aor {extension}"), &mut result.errors)
            .await
        {
            if aor.contains(NOT_FOUND_MARKER) {
                result
                    .errors
                    .push(format!("AOR for extension '{extension}' not found"));
            } else {
                result.exists = true;
                match cli_contact_rows(&aor).into_iter().next() {
                    Some(contact) => {
                        result.registered = true;
                        // The AOR's `*_expiration` settings are limits, not this contact's expiry.
                        result.expires_s = EXPIRY
                            .captures(&contact.uri)
                            .and_then(|c| c[1].parse().ok());
                        result.contact_uri = Some(contact.uri);
                    }
                    None => result
                        .errors
                        .push(format!("Extension '{extension}' has no registered contacts")),
                }
                result.user_agent = user_agent(&aor);
            }
        }

        if let Some(endpoint) = session
            .query(&format!("pjsip show endpoint {extension}"), &mut result.errors)
            .await
        {
            if endpoint.contains(NOT_FOUND_MARKER) {
                result
                    .errors
                    .push(format!("Endpoint '{extension}' not found"));
            } else {
                result.exists = true;
                if let Some(agent) = user_agent(&endpoint) {
                    result.user_agent = Some(agent);
                }
            }
        }

        result
    }

    /// Whether `to` resolves in the routing context. This checks dialplan
    /// resolution only; no call is placed.
    pub async fn test_call_routing(&self, from: &str, to: &str) -> CallRoutingResult {
        let mut result = CallRoutingResult {
            from: from.to_string(),
            to: to.to_string(),
            context: self.routing_context.clone(),
            route_found: false,
            application: None,
            trunk: None,
            errors: Vec::new(),
        };
        for value in [from, to] {
            if let Err(reason) = check_identifier(value) {
                result.errors.push(reason);
            }
        }
        if !result.errors.is_empty() {
            return result;
        }

        let mut session = CliSession::new(&self.runner);
        let command = format!("dialplan show {to}@{}", self.routing_context);
        let Some(dialplan) = session.query(&command, &mut result.errors).await else {
            return result;
        };

        result.route_found = dialplan.contains(&format!("Extension '{to}'"));
        result.application = DIALPLAN_APPLICATION
            .captures(&dialplan)
            .map(|c| c[1].to_string());
        result.trunk = DIAL_TRUNK_AT
            .captures(&dialplan)
            .or_else(|| DIAL_TRUNK_PATH.captures(&dialplan))
            .map(|c| c[1].to_string());

        if !result.route_found {
            result.errors.push(format!(
                "No route for '{to}' in context '{}'",
                self.routing_context
            ));
        }
        result
    }
}

fn is_qualified(status: &str) -> bool {
    ["reachable", "avail", "qual", "qualified"]
        .iter()
        .any(|s| status.eq_ignore_ascii_case(s))
}

fn user_agent(text: &str) -> Option<String> {
    USER_AGENT.captures(text).map(|c| c[1].to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{fake_asterisk, invocations, write_script};
    use crate::CliOptions;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const TRUNK_QUALIFIED: &str = "\
 Endpoint:  provider                                             Not in use    0 of inf
        Aor:  provider                                           0
      Contact:  provider/sip:sip.provider.net:5060          7a1c9e3b2f Avail        21.500";

    const TRUNK_REGISTERED_ONLY: &str = "\
 Endpoint:  regtrunk                                             Not in use    0 of inf
        Aor:  regtrunk                                           1";

    const AOR_ONE_CONTACT: &str = "\
      Aor:  <Aor..............................................>  <MaxContact>
    Contact:  <Aor/ContactUri............................> <Hash....> <Status> <RTT(ms)..>
==========================================================================================

      Aor:  100                                                  1
    Contact:  100/sip:100@192.168.1.50:5060;ob           5c5d8e1f6f Avail        12.345

 ParameterName        : ParameterValue
 default_expiration   : 3600";

    const AOR_NO_CONTACT: &str = "\
      Aor:  101                                                  1

 ParameterName        : ParameterValue
 default_expiration   : 3600";

    const ENDPOINT_WITH_AGENT: &str = "\
 Endpoint:  100/100                                              Not in use    0 of inf
 user_agent           : Yealink SIP-T46S 66.86.0.15";

    fn validation_with(asterisk: PathBuf) -> PjsipValidation {
        PjsipValidation::new(
            CommandRunner::new(CliOptions {
                asterisk_binary: asterisk,
                ..CliOptions::default()
            }),
            "from-internal",
        )
    }

    #[tokio::test]
    async fn test_trunk_reachable_by_qualify() {
        let dir = tempdir().expect("tempdir");
        let asterisk = fake_asterisk(
            dir.path(),
            &[
                ("pjsip show endpoint provider", TRUNK_QUALIFIED),
                ("pjsip show aor provider", "      Aor:  provider    0"),
            ],
        );
        let result = validation_with(asterisk)
            .validate_trunk_connection("provider")
            .await;
        assert!(result.exists);
        assert!(result.reachable);
        assert_eq!(result.qualify_status.as_deref(), Some("Avail"));
        assert_eq!(result.latency_ms, Some(21.5));
        assert_eq!(result.contact_count, 0);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_trunk_reachable_by_registration() {
        let dir = tempdir().expect("tempdir");
        let asterisk = fake_asterisk(
            dir.path(),
            &[
                ("pjsip show endpoint regtrunk", TRUNK_REGISTERED_ONLY),
                (
                    "pjsip show aor regtrunk",
                    "    Contact:  regtrunk/sip:pbx@203.0.113.9:5060   1f2e3d4c5b NonQual   nan",
                ),
            ],
        );
        let result = validation_with(asterisk)
            .validate_trunk_connection("regtrunk")
            .await;
        assert!(result.reachable);
        assert_eq!(result.qualify_status, None);
        assert_eq!(result.contact_count, 1);
    }

    #[tokio::test]
    async fn test_trunk_unreachable_and_missing() {
        let dir = tempdir().expect("tempdir");
        let asterisk = fake_asterisk(
            dir.path(),
            &[
                (
                    "pjsip show endpoint deadtrunk",
                    " Endpoint:  deadtrunk       Unavailable   0 of inf\n      Contact:  deadtrunk/sip:10.9.9.9:5060   0badc0ffee Unavail   nan",
                ),
                ("pjsip show aor deadtrunk", "      Aor:  deadtrunk    0"),
                ("pjsip show endpoint ghost", "Unable to find object ghost."),
            ],
        );
        let validation = validation_with(asterisk);

        let dead = validation.validate_trunk_connection("deadtrunk").await;
        assert!(dead.exists);
        assert!(!dead.reachable);
        assert_eq!(dead.qualify_status.as_deref(), Some("Unavail"));
        assert_eq!(dead.errors.len(), 1);

        let ghost = validation.validate_trunk_connection("ghost").await;
        assert!(!ghost.exists);
        assert!(!ghost.reachable);
        assert_eq!(ghost.errors, vec!["Trunk endpoint 'ghost' not found".to_string()]);
        assert!(!invocations(dir.path()).contains(&"pjsip show aor ghost".to_string()));
    }

    #[tokio::test]
    async fn test_extension_registered() {
        let dir = tempdir().expect("tempdir");
        let asterisk = fake_asterisk(
            dir.path(),
            &[
                ("pjsip show aor 100", AOR_ONE_CONTACT),
                ("pjsip show endpoint 100", ENDPOINT_WITH_AGENT),
            ],
        );
        let result = validation_with(asterisk)
            .validate_extension_registration("100")
            .await;
        assert!(result.exists);
        assert!(result.registered);
        assert_eq!(
            result.contact_uri.as_deref(),
            Some("sip:100@192.168.1.50:5060;ob")
        );
        assert_eq!(result.expires_s, None);
        assert_eq!(result.user_agent.as_deref(), Some("Yealink SIP-T46S 66.86.0.15"));
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_extension_errors_accumulate() {
        let dir = tempdir().expect("tempdir");
        let asterisk = fake_asterisk(
            dir.path(),
            &[
                ("pjsip show aor 101", AOR_NO_CONTACT),
                ("pjsip show endpoint 101", "Unable to find object 101."),
            ],
        );
        let result = validation_with(asterisk)
            .validate_extension_registration("101")
            .await;
        assert!(!result.registered);
        assert_eq!(
            result.errors,
            vec![
                "Extension '101' has no registered contacts".to_string(),
                "Endpoint '101' not found".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_connectivity_loss_is_one_error() {
        let dir = tempdir().expect("tempdir");
        let asterisk = write_script(
            dir.path(),
            "asterisk",
            "echo 'Unable to connect to remote asterisk (does /var/run/asterisk/asterisk.ctl exist?)' >&2\nexit 1",
        );
        let result = validation_with(asterisk)
            .validate_extension_registration("100")
            .await;
        assert!(!result.registered);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("Unable to connect to remote asterisk"));
    }

    #[tokio::test]
    async fn test_call_routing() {
        let dir = tempdir().expect("tempdir");
        let asterisk = fake_asterisk(
            dir.path(),
            &[
                (
                    "dialplan show 0049301234@from-internal",
                    "[ Context 'from-internal' created by 'pbx_config' ]\n  Extension '0049301234' =>  1. Dial(PJSIP/${EXTEN}@provider,60)  [extensions.conf:12]",
                ),
                (
                    "dialplan show 555@from-internal",
                    "There is no existence of '555@from-internal' extension",
                ),
            ],
        );
        let validation = validation_with(asterisk);

        let routed = validation.test_call_routing("100", "0049301234").await;
        assert!(routed.route_found);
        assert_eq!(routed.application.as_deref(), Some("Dial"));
        assert_eq!(routed.trunk.as_deref(), Some("provider"));
        assert!(routed.errors.is_empty());

        let missing = validation.test_call_routing("100", "555").await;
        assert!(!missing.route_found);
        assert_eq!(missing.application, None);
        assert_eq!(missing.trunk, None);
        assert_eq!(missing.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_call_routing_rejects_bad_input() {
        let dir = tempdir().expect("tempdir");
        let asterisk = fake_asterisk(dir.path(), &[]);
        let result = validation_with(asterisk)
            .test_call_routing("100", "200 extra")
            .await;
        assert!(!result.route_found);
        assert_eq!(result.errors.len(), 1);
        assert!(invocations(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_extension_expiry_comes_from_contact() {
        let dir = tempdir().expect("tempdir");
        let asterisk = fake_asterisk(
            dir.path(),
            &[
                (
                    "pjsip show aor 102",
                    "      Aor:  102                                                  1\n    Contact:  102/sip:102@192.168.1.52:5060;expires=300   9a8b7c6d5e Avail   8.100\n\n default_expiration   : 3600\n maximum_expiration   : 7200",
                ),
                ("pjsip show endpoint 102", " Endpoint:  102/102   Not in use    0 of inf"),
            ],
        );
        let result = validation_with(asterisk)
            .validate_extension_registration("102")
            .await;
        assert!(result.registered);
        assert_eq!(result.expires_s, Some(300));
        assert!(result.errors.is_empty());
    }
}
