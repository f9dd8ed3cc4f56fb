use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bollard::container::Config;
use bollard::models::{HostConfig, PortBinding};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assets::{replace_variables, AssetFetcher, InstallScript};
use crate::docker::{default_network_mode, follow_progress, RuntimeError, VOLUME_MOUNT_POINT};
use crate::shared::models::AppState;
use crate::state::InstanceState;

/// Host port handed to workloads that declare no bindings.
const DEFAULT_PRIMARY_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptSet {
    #[serde(default, alias = "Install")]
    pub install: Vec<InstallScript>,
}

/// Deployment request as the panel sends it. Field casing follows the
/// panel's wire format, which mixes runtime-API style keys with lowercase
/// ones.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    #[serde(alias = "Image")]
    pub image: String,
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: Option<HashMap<String, HashMap<(), ()>>>,
    #[serde(rename = "PortBindings", default)]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    #[serde(alias = "Scripts", default)]
    pub scripts: Option<ScriptSet>,
    #[serde(rename = "Memory")]
    pub memory_mib: i64,
    #[serde(rename = "Cpu")]
    pub cpu_count: i64,
    #[serde(rename = "Disk", default)]
    pub disk_limit_mib: u64,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
}

/// Body of the early 202 acknowledgement. The container id is always
/// known by the time this is sent.
#[derive(Debug, Serialize)]
pub struct CreateAccepted {
    pub message: String,
    pub env: Vec<String>,
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    #[serde(rename = "Memory", default)]
    pub memory_mib: Option<i64>,
    #[serde(rename = "Cpu", default)]
    pub cpu_count: Option<i64>,
    #[serde(rename = "Disk", default)]
    pub disk_limit_mib: Option<u64>,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
}

/// Every host port must parse into the valid range before any side effect.
fn validate_port_bindings(bindings: &BTreeMap<String, Vec<PortBinding>>) -> Result<(), DeployError> {
    for binding in bindings.values().flatten() {
        let raw = binding.host_port.as_deref().unwrap_or("");
        let port: u32 = raw
            .parse()
            .map_err(|_| DeployError::BadRequest(format!("Invalid host port: {raw:?}")))?;
        if port == 0 || port > 65535 {
            return Err(DeployError::BadRequest(format!("Invalid host port: {port}")));
        }
    }
    Ok(())
}

/// Variables arrive either as a JSON object or as a JSON string encoding
/// one; anything absent becomes the empty mapping.
fn parse_variables(raw: &Option<serde_json::Value>) -> Result<HashMap<String, String>, DeployError> {
    let value = match raw {
        None | Some(serde_json::Value::Null) => return Ok(HashMap::new()),
        Some(serde_json::Value::String(encoded)) => serde_json::from_str(encoded)
            .map_err(|e| DeployError::BadRequest(format!("variables is not valid JSON: {e}")))?,
        Some(other) => other.clone(),
    };

    match value {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, rendered)
            })
            .collect()),
        _ => Err(DeployError::BadRequest("variables must be an object".to_string())),
    }
}

fn primary_port(bindings: &BTreeMap<String, Vec<PortBinding>>) -> u16 {
    bindings
        .values()
        .flatten()
        .next()
        .and_then(|b| b.host_port.as_deref())
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PRIMARY_PORT)
}

fn build_env(
    caller_env: &Option<Vec<String>>,
    variables: &HashMap<String, String>,
    primary_port: u16,
) -> Vec<String> {
    let mut env = caller_env.clone().unwrap_or_default();
    for (key, value) in variables {
        env.push(format!("{key}={value}"));
    }
    env.push(format!("PRIMARY_PORT={primary_port}"));
    env
}

fn container_config(req: &CreateRequest, env: Vec<String>, volume_bind: String) -> Config<String> {
    let port_map = req
        .port_bindings
        .iter()
        .map(|(port, bindings)| (port.clone(), Some(bindings.clone())))
        .collect::<HashMap<_, _>>();

    Config {
        image: Some(req.image.clone()),
        cmd: req.cmd.clone(),
        env: Some(env),
        exposed_ports: req.exposed_ports.clone(),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(true),
        open_stdin: Some(true),
        host_config: Some(HostConfig {
            port_bindings: Some(port_map),
            binds: Some(vec![volume_bind]),
            memory: Some(req.memory_mib * 1024 * 1024),
            // Quota over a fixed 100ms period; matches update_resources
            cpu_quota: Some(req.cpu_count * 100_000),
            cpu_period: Some(100_000),
            network_mode: Some(default_network_mode().to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create workflow. Validation through container creation run
/// synchronously; the acknowledgement is returned as soon as the container
/// id is known and provisioning continues in the background.
pub async fn create_instance(
    app: Arc<AppState>,
    req: CreateRequest,
) -> Result<CreateAccepted, DeployError> {
    let instance_id = req
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DeployError::BadRequest("Id is required".to_string()))?;

    validate_port_bindings(&req.port_bindings)?;
    let variables = parse_variables(&req.variables)?;
    let port = primary_port(&req.port_bindings);
    let env = build_env(&req.env, &variables, port);

    app.volumes.create_volume(&instance_id).await?;

    app.states
        .update(&instance_id, InstanceState::Installing, None, req.disk_limit_mib)
        .await?;

    launch(app, req, instance_id, env, port, variables, true).await
}

/// Replaces the workload of an existing instance, keeping its volume.
/// `run_install` additionally re-runs the install-script pass.
pub async fn redeploy_instance(
    app: Arc<AppState>,
    instance_id: String,
    old_container_id: String,
    req: CreateRequest,
    run_install: bool,
) -> Result<CreateAccepted, DeployError> {
    validate_port_bindings(&req.port_bindings)?;
    let variables = parse_variables(&req.variables)?;
    let port = primary_port(&req.port_bindings);
    let env = build_env(&req.env, &variables, port);

    // The volume survives the replacement
    app.volumes.create_volume(&instance_id).await?;
    app.states
        .update(&instance_id, InstanceState::Installing, None, req.disk_limit_mib)
        .await?;

    if let Ok(true) = app.docker.is_running(&old_container_id).await {
        if let Err(e) = app.docker.stop(&old_container_id, Some(10)).await {
            warn!("Failed to stop {} before replacement: {}", old_container_id, e);
        }
    }
    match app.docker.remove(&old_container_id, true).await {
        Ok(()) | Err(RuntimeError::NotFound(_)) => {}
        Err(e) => warn!("Failed to remove {} before replacement: {}", old_container_id, e),
    }
    app.log_buffers.drop_container(&old_container_id).await;

    launch(app, req, instance_id, env, port, variables, run_install).await
}

/// Shared tail of create and redeploy: pull, create, early-ack, background
/// provision + start + final state commit.
async fn launch(
    app: Arc<AppState>,
    req: CreateRequest,
    instance_id: String,
    env: Vec<String>,
    port: u16,
    variables: HashMap<String, String>,
    run_install: bool,
) -> Result<CreateAccepted, DeployError> {
    info!("Pulling image {} for instance {}", req.image, instance_id);
    let pull = app.docker.pull_image(&req.image);
    if let Err(e) = follow_progress(
        &req.image,
        pull,
        None::<fn(&bollard::models::CreateImageInfo)>,
    )
    .await
    {
        commit_failed(&app, &instance_id, None, req.disk_limit_mib).await;
        return Err(e.into());
    }

    let volume_bind = format!(
        "{}:{}",
        app.volumes.volume_path(&instance_id).display(),
        VOLUME_MOUNT_POINT
    );
    let config = container_config(&req, env.clone(), volume_bind);

    let container_id = match app.docker.create_container(&instance_id, config).await {
        Ok(id) => id,
        Err(e) => {
            commit_failed(&app, &instance_id, None, req.disk_limit_mib).await;
            return Err(e.into());
        }
    };

    // The container id must be on record by the time the panel sees the
    // acknowledgement, so it can poll state while provisioning runs
    if let Err(e) = app
        .states
        .update(
            &instance_id,
            InstanceState::Installing,
            Some(container_id.clone()),
            req.disk_limit_mib,
        )
        .await
    {
        error!("Failed to record container id for {}: {}", instance_id, e);
    }

    let accepted = CreateAccepted {
        message: "Container creation in progress".to_string(),
        env,
        volume_id: instance_id.clone(),
        container_id: container_id.clone(),
    };

    tokio::spawn(provision_and_start(
        app,
        req,
        instance_id,
        container_id,
        port,
        variables,
        run_install,
    ));

    Ok(accepted)
}

/// Background stages after the early acknowledgement. Failures here are
/// only visible through the state record and the log.
async fn provision_and_start(
    app: Arc<AppState>,
    req: CreateRequest,
    instance_id: String,
    container_id: String,
    port: u16,
    mut variables: HashMap<String, String>,
    run_install: bool,
) {
    let scripts = req
        .scripts
        .as_ref()
        .map(|s| s.install.as_slice())
        .unwrap_or(&[]);

    if run_install && !scripts.is_empty() {
        let volume = app.volumes.volume_path(&instance_id);
        let fetcher = AssetFetcher::new();
        fetcher
            .download_install_scripts(scripts, &volume, &variables)
            .await;

        let short_id = container_id.chars().take(12).collect::<String>();
        variables.clear();
        variables.insert("primary_port".to_string(), port.to_string());
        variables.insert("container_name".to_string(), short_id);
        variables.insert(
            "timestamp".to_string(),
            chrono::Utc::now().timestamp().to_string(),
        );
        variables.insert(
            "random_string".to_string(),
            Uuid::new_v4().simple().to_string(),
        );

        if let Err(e) = replace_variables(&volume, &variables).await {
            warn!("Variable substitution in {} failed: {}", volume.display(), e);
        }
    }

    if let Err(e) = app.docker.start(&container_id).await {
        error!("Failed to start container for {}: {}", instance_id, e);
        commit_failed(&app, &instance_id, Some(container_id), req.disk_limit_mib).await;
        return;
    }

    if let Err(e) = app
        .states
        .update(
            &instance_id,
            InstanceState::Ready,
            Some(container_id.clone()),
            req.disk_limit_mib,
        )
        .await
    {
        error!("Failed to commit READY for {}: {}", instance_id, e);
        return;
    }

    info!("Instance {} is ready ({})", instance_id, container_id);
}

async fn commit_failed(
    app: &AppState,
    instance_id: &str,
    container_id: Option<String>,
    disk_limit: u64,
) {
    if let Err(e) = app
        .states
        .update(instance_id, InstanceState::Failed, container_id, disk_limit)
        .await
    {
        error!("Failed to record FAILED state for {}: {}", instance_id, e);
    }
}

/// Tears the instance down: container, state record, volume.
pub async fn delete_instance(app: Arc<AppState>, instance_id: &str) -> Result<(), DeployError> {
    let record = app
        .states
        .get(instance_id)
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("No such instance: {instance_id}")))?;

    if let Some(container_id) = &record.container_id {
        if let Ok(true) = app.docker.is_running(container_id).await {
            if let Err(e) = app.docker.stop(container_id, Some(10)).await {
                warn!("Failed to stop {}: {}", container_id, e);
            }
        }
        match app.docker.remove(container_id, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!("Failed to remove {}: {}", container_id, e),
        }
        app.log_buffers.drop_container(container_id).await;
    }

    app.states.remove(instance_id).await?;
    app.volumes.remove_volume(instance_id).await?;
    info!("Instance {} deleted", instance_id);
    Ok(())
}

/// Mutates resource limits in place. Environment edits require a
/// replacement deploy and are rejected here.
pub async fn edit_instance(
    app: Arc<AppState>,
    instance_id: &str,
    req: EditRequest,
) -> Result<crate::state::InstanceRecord, DeployError> {
    if req.env.is_some() {
        return Err(DeployError::BadRequest(
            "Environment cannot be edited in place; redeploy the instance".to_string(),
        ));
    }

    let mut record = app
        .states
        .get(instance_id)
        .await?
        .ok_or_else(|| DeployError::NotFound(format!("No such instance: {instance_id}")))?;

    if req.memory_mib.is_some() || req.cpu_count.is_some() {
        let container_id = record
            .container_id
            .clone()
            .ok_or_else(|| DeployError::BadRequest("Instance has no container".to_string()))?;
        app.docker
            .update_resources(
                &container_id,
                req.memory_mib.map(|m| m * 1024 * 1024),
                req.cpu_count,
            )
            .await?;
    }

    if let Some(disk) = req.disk_limit_mib {
        app.states
            .update(instance_id, record.state, record.container_id.clone(), disk)
            .await?;
        record.disk_limit = disk;
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(host_port: &str) -> BTreeMap<String, Vec<PortBinding>> {
        let mut map = BTreeMap::new();
        map.insert(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }],
        );
        map
    }

    #[test]
    fn accepts_port_range_boundaries() {
        assert!(validate_port_bindings(&bindings("1")).is_ok());
        assert!(validate_port_bindings(&bindings("65535")).is_ok());
    }

    #[test]
    fn rejects_out_of_range_ports() {
        assert!(validate_port_bindings(&bindings("0")).is_err());
        assert!(validate_port_bindings(&bindings("65536")).is_err());
        assert!(validate_port_bindings(&bindings("70000")).is_err());
        assert!(validate_port_bindings(&bindings("abc")).is_err());
    }

    #[test]
    fn primary_port_falls_back_to_default() {
        assert_eq!(primary_port(&BTreeMap::new()), DEFAULT_PRIMARY_PORT);
        assert_eq!(primary_port(&bindings("18080")), 18080);
    }

    #[test]
    fn variables_accept_object_and_encoded_string() {
        let object = serde_json::json!({"NAME": "svc", "COUNT": 3});
        let parsed = parse_variables(&Some(object)).unwrap();
        assert_eq!(parsed["NAME"], "svc");
        assert_eq!(parsed["COUNT"], "3");

        let encoded = serde_json::Value::String(r#"{"NAME":"svc"}"#.to_string());
        let parsed = parse_variables(&Some(encoded)).unwrap();
        assert_eq!(parsed["NAME"], "svc");

        assert!(parse_variables(&None).unwrap().is_empty());
        assert!(parse_variables(&Some(serde_json::Value::String("{broken".to_string()))).is_err());
    }

    #[test]
    fn env_concatenates_caller_variables_and_primary_port() {
        let mut variables = HashMap::new();
        variables.insert("NAME".to_string(), "svc".to_string());

        let env = build_env(&Some(vec!["MODE=fast".to_string()]), &variables, 18080);
        assert_eq!(env[0], "MODE=fast");
        assert!(env.contains(&"NAME=svc".to_string()));
        assert_eq!(env.last().unwrap(), "PRIMARY_PORT=18080");
    }

    #[test]
    fn request_parses_panel_wire_format() {
        let raw = serde_json::json!({
            "image": "alpine:latest",
            "Id": "inst-A",
            "Memory": 128,
            "Cpu": 1,
            "Disk": 1,
            "PortBindings": {"80/tcp": [{"HostPort": "18080"}]},
            "variables": {"NAME": "svc"},
            "Scripts": {"install": [{"uri": "https://example.com/{{NAME}}.sh", "path": "install.sh"}]}
        });

        let req: CreateRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.id.as_deref(), Some("inst-A"));
        assert_eq!(req.memory_mib, 128);
        assert_eq!(req.disk_limit_mib, 1);
        let scripts = req.scripts.unwrap();
        assert_eq!(scripts.install.len(), 1);
        assert_eq!(
            req.port_bindings["80/tcp"][0].host_port.as_deref(),
            Some("18080")
        );
    }

    #[test]
    fn container_config_wires_mount_limits_and_tty() {
        let req: CreateRequest = serde_json::from_value(serde_json::json!({
            "image": "alpine:latest",
            "Id": "inst-A",
            "Memory": 128,
            "Cpu": 2,
            "PortBindings": {"80/tcp": [{"HostPort": "18080"}]}
        }))
        .unwrap();

        let config = container_config(&req, vec!["A=1".to_string()], "/vol/inst-A:/app/data".to_string());
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.open_stdin, Some(true));
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(200_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.binds.unwrap()[0], "/vol/inst-A:/app/data");
        assert_eq!(host.network_mode.as_deref(), Some(default_network_mode()));
    }
}
