//! Deploy task payload construction.

use std::collections::BTreeMap;

use berth_events::{DeployTaskPayload, DeploySource, ResourceLimits};
use berth_quota::units::{cpus_string, memory_string, parse_cpus, parse_memory};
use berth_quota::{Configured, EffectiveLimits, QuotaError};
use tracing::warn;

use crate::model::{Application, Deployment};

/// Builds the payload for one deployment attempt.
///
/// Unbounded effective limits are left out so the node applies its own
/// defaults. CPU and memory fall back to the application's own docker
/// strings when the tree leaves them unbounded; those are re-parsed and an
/// unparseable value is dropped. `task_id` is left unset; it is backfilled
/// from the task row when the task is handed out.
pub fn build_payload(
    application: &Application,
    deployment: &Deployment,
    ports: &[u16],
    limits: &EffectiveLimits,
) -> DeployTaskPayload {
    let source = match &application.source {
        DeploySource::Git {
            repository, branch, ..
        } => DeploySource::Git {
            repository: repository.clone(),
            branch: deployment.branch.clone().unwrap_or_else(|| branch.clone()),
            commit_sha: deployment.commit_sha.clone(),
        },
        image @ DeploySource::DockerImage { .. } => image.clone(),
    };

    let resources = ResourceLimits {
        cpus: limits
            .cpu_millicores
            .amount()
            .map(cpus_string)
            .or_else(|| fallback(application.cpus.as_deref(), parse_cpus, cpus_string)),
        memory: limits
            .ram_mb
            .amount()
            .map(memory_string)
            .or_else(|| fallback(application.memory.as_deref(), parse_memory, memory_string)),
        storage_mb: limits.storage_mb.amount(),
        bandwidth_mbps: limits.bandwidth_mbps.amount(),
        pids: limits.pids.amount(),
    };

    let vars = PlaceholderValues {
        ports,
        app_id: application.id.to_string(),
        deployment_id: deployment.id.to_string(),
        commit_sha: deployment.commit_sha.clone().unwrap_or_default(),
    };
    let env: BTreeMap<String, String> = application
        .env_vars
        .iter()
        .map(|(key, value)| (key.clone(), resolve_placeholders(value, &vars)))
        .collect();

    DeployTaskPayload {
        task_id: None,
        deployment_id: deployment.id,
        application_id: application.id,
        source,
        build: application.build.clone(),
        env,
        ports: ports.to_vec(),
        resources,
        rollback_to_deployment_id: deployment.rollback_to_deployment_id,
    }
}

fn fallback(
    raw: Option<&str>,
    parse: fn(&str) -> Result<Configured, QuotaError>,
    format: fn(u64) -> String,
) -> Option<String> {
    let raw = raw?;
    match parse(raw) {
        Ok(value) => value.fixed().map(format),
        Err(e) => {
            warn!(value = raw, error = %e, "Ignoring invalid resource override");
            None
        }
    }
}

/// Values substituted into environment variables at deploy time.
#[derive(Debug, Clone)]
pub struct PlaceholderValues<'a> {
    pub ports: &'a [u16],
    pub app_id: String,
    pub deployment_id: String,
    pub commit_sha: String,
}

impl PlaceholderValues<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "PORT" => self.ports.first().map(u16::to_string),
            "APP_ID" => Some(self.app_id.clone()),
            "DEPLOYMENT_ID" => Some(self.deployment_id.clone()),
            "COMMIT_SHA" => Some(self.commit_sha.clone()),
            _ => {
                let index: usize = name.strip_prefix("PORT_")?.parse().ok()?;
                self.ports.get(index).map(u16::to_string)
            }
        }
    }
}

/// Replaces `${NAME}` placeholders. Unknown or unresolvable ones are kept
/// verbatim.
pub fn resolve_placeholders(input: &str, values: &PlaceholderValues<'_>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        match tail.find('}') {
            Some(end) => {
                let name = &tail[..end];
                match values.lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_events::DeploymentStatus;
    use berth_id::{DeploymentId, EnvId, NodeId};
    use berth_quota::{Effective, ResourceKind};
    use chrono::Utc;
    use proptest::prelude::*;
    use rstest::rstest;

    fn values(ports: &[u16]) -> PlaceholderValues<'_> {
        PlaceholderValues {
            ports,
            app_id: "app_1".to_string(),
            deployment_id: "dep_1".to_string(),
            commit_sha: "abc123".to_string(),
        }
    }

    #[rstest]
    #[case("${PORT}", "8000")]
    #[case("http://0.0.0.0:${PORT_1}/", "http://0.0.0.0:8001/")]
    #[case("${APP_ID}-${DEPLOYMENT_ID}", "app_1-dep_1")]
    #[case("rev=${COMMIT_SHA}", "rev=abc123")]
    #[case("${PORT_5}", "${PORT_5}")]
    #[case("${HOME}/bin", "${HOME}/bin")]
    #[case("unterminated ${PORT", "unterminated ${PORT")]
    #[case("no placeholders", "no placeholders")]
    fn test_resolve_placeholders(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(resolve_placeholders(input, &values(&[8000, 8001])), expected);
    }

    #[test]
    fn test_payload_limits_and_fallbacks() {
        let mut app = Application::new(
            EnvId::new(),
            "web",
            DeploySource::Git {
                repository: "https://git.example.com/acme/web.git".to_string(),
                branch: "main".to_string(),
                commit_sha: None,
            },
        );
        app.cpus = Some("0.5".to_string());
        app.memory = Some("2g".to_string());
        app.env_vars.insert("LISTEN".to_string(), ":${PORT}".to_string());

        let now = Utc::now();
        let deployment = Deployment {
            id: DeploymentId::new(),
            application_id: app.id,
            node_id: NodeId::new(),
            status: DeploymentStatus::Queued,
            commit_sha: Some("abc123".to_string()),
            branch: Some("main".to_string()),
            logs: Vec::new(),
            rollback_to_deployment_id: None,
            container_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let limits = EffectiveLimits::uniform(Effective::Unbounded)
            .with(ResourceKind::RamMb, Effective::Limited(512))
            .with(ResourceKind::Pids, Effective::Limited(256));
        let payload = build_payload(&app, &deployment, &[8000], &limits);

        assert_eq!(payload.resources.memory.as_deref(), Some("512m"));
        assert_eq!(payload.resources.cpus.as_deref(), Some("0.5"));
        assert_eq!(payload.resources.pids, Some(256));
        assert_eq!(payload.resources.storage_mb, None);
        assert_eq!(payload.env["LISTEN"], ":8000");
        assert_eq!(payload.source.commit_sha(), Some("abc123"));
        assert!(payload.task_id.is_none());
    }

    #[rstest]
    #[case(Some("1024m"), Some("1g"))]
    #[case(Some("1.5g"), Some("1536m"))]
    #[case(Some("-1"), None)]
    #[case(Some("lots"), None)]
    #[case(None, None)]
    fn test_memory_fallback_is_reparsed(#[case] raw: Option<&str>, #[case] expected: Option<&str>) {
        let mut app = Application::new(
            EnvId::new(),
            "web",
            DeploySource::DockerImage {
                image: "nginx".to_string(),
                tag: "1.27".to_string(),
            },
        );
        app.memory = raw.map(str::to_string);
        let now = Utc::now();
        let deployment = Deployment {
            id: DeploymentId::new(),
            application_id: app.id,
            node_id: NodeId::new(),
            status: DeploymentStatus::Queued,
            commit_sha: None,
            branch: None,
            logs: Vec::new(),
            rollback_to_deployment_id: None,
            container_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let payload = build_payload(&app, &deployment, &[8000], &EffectiveLimits::default());
        assert_eq!(payload.resources.memory.as_deref(), expected);
        assert_eq!(payload.resources.cpus, None);
    }

    proptest! {
        #[test]
        fn prop_text_without_placeholders_is_unchanged(input in "[^$]*") {
            prop_assert_eq!(resolve_placeholders(&input, &values(&[8000])), input);
        }

        #[test]
        fn prop_every_port_index_resolves(ports in proptest::collection::vec(1u16.., 1..8)) {
            for (i, port) in ports.iter().enumerate() {
                let resolved = resolve_placeholders(&format!("${{PORT_{i}}}"), &values(&ports));
                prop_assert_eq!(resolved, port.to_string());
            }
        }
    }
}
