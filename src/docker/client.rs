use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
    UpdateContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, ContainerSummary, CreateImageInfo,
    ExecInspectResponse, SystemInfo,
};
use bollard::system::Version as SystemVersion;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::Stream;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Unavailable(String),

    #[error("runtime returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed runtime response: {0}")]
    Protocol(String),

    #[error("image pull failed for {image}: {reason}")]
    PullFailed { image: String, reason: String },

    #[error("container create failed: {0}")]
    CreateFailed(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

fn map_err(err: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error as E;
    match err {
        E::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        E::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            body: message,
        },
        E::JsonDataError { .. } | E::JsonSerdeError { .. } => {
            RuntimeError::Protocol(err.to_string())
        }
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

/// Exec instance created inside a running container.
pub struct ExecHandle {
    pub id: String,
}

/// Typed client over the local container runtime socket.
///
/// Construction negotiates the API version against `GET /version`; if the
/// probe fails the compiled-in default version is kept so the client stays
/// usable against older runtimes.
pub struct RuntimeClient {
    docker: Docker,
}

impl RuntimeClient {
    pub async fn new(socket_override: Option<String>) -> RuntimeResult<Self> {
        let docker = match socket_override {
            Some(socket) => {
                info!("Connecting to container runtime at {}", socket);
                Docker::connect_with_socket(&socket, 120, API_DEFAULT_VERSION).map_err(map_err)?
            }
            None => Docker::connect_with_socket_defaults().map_err(map_err)?,
        };

        let docker = match docker.clone().negotiate_version().await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!(
                    "API version negotiation failed ({}), keeping default {}",
                    e, API_DEFAULT_VERSION
                );
                docker
            }
        };

        Ok(Self { docker })
    }

    /// Liveness probe against the runtime socket.
    pub async fn ping(&self) -> RuntimeResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    pub async fn info(&self) -> RuntimeResult<SystemInfo> {
        self.docker.info().await.map_err(map_err)
    }

    pub async fn version(&self) -> RuntimeResult<SystemVersion> {
        self.docker.version().await.map_err(map_err)
    }

    pub async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        self.docker
            .list_containers(Some(options))
            .await
            .map_err(map_err)
    }

    /// Creates a container and returns its runtime-assigned id.
    pub async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> RuntimeResult<String> {
        let options = CreateContainerOptions {
            name,
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        if response.id.is_empty() {
            return Err(RuntimeError::CreateFailed(
                "runtime response carried no container id".to_string(),
            ));
        }

        info!("Created container {} with id {}", name, response.id);
        Ok(response.id)
    }

    /// Streaming pull of `reference`. Returns the progress stream itself so
    /// the caller can drain records incrementally; see `follow_progress`.
    pub fn pull_image(
        &self,
        reference: &str,
    ) -> impl Stream<Item = Result<CreateImageInfo, bollard::errors::Error>> + Unpin {
        debug!("Pulling image {}", reference);
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        self.docker.create_image(Some(options), None, None)
    }

    pub async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerInspectResponse> {
        self.docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)
    }

    pub async fn is_running(&self, container_id: &str) -> RuntimeResult<bool> {
        let info = self.inspect(container_id).await?;
        Ok(info
            .state
            .and_then(|s| s.status)
            .map(|s| s == ContainerStateStatusEnum::RUNNING)
            .unwrap_or(false))
    }

    pub async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)?;
        info!("Started container {}", container_id);
        Ok(())
    }

    pub async fn stop(&self, container_id: &str, timeout: Option<i64>) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: timeout.unwrap_or(10),
        };
        self.docker
            .stop_container(container_id, Some(options))
            .await
            .map_err(map_err)?;
        info!("Stopped container {}", container_id);
        Ok(())
    }

    pub async fn restart(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .restart_container(container_id, None::<RestartContainerOptions>)
            .await
            .map_err(map_err)?;
        info!("Restarted container {}", container_id);
        Ok(())
    }

    pub async fn kill(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
            .map_err(map_err)
    }

    pub async fn pause(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker.pause_container(container_id).await.map_err(map_err)
    }

    pub async fn unpause(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .unpause_container(container_id)
            .await
            .map_err(map_err)
    }

    pub async fn remove(&self, container_id: &str, force: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(map_err)?;
        info!("Removed container {}", container_id);
        Ok(())
    }

    /// In-place resource-limit update. Memory is given in bytes; the cpu
    /// count is applied as quota over a fixed 100ms period.
    pub async fn update_resources(
        &self,
        container_id: &str,
        memory_bytes: Option<i64>,
        cpu_count: Option<i64>,
    ) -> RuntimeResult<()> {
        let options = UpdateContainerOptions::<String> {
            memory: memory_bytes,
            memory_swap: memory_bytes,
            cpu_quota: cpu_count.map(|c| c * 100_000),
            cpu_period: cpu_count.map(|_| 100_000),
            ..Default::default()
        };
        self.docker
            .update_container(container_id, options)
            .await
            .map_err(map_err)?;
        info!("Updated resource limits for {}", container_id);
        Ok(())
    }

    /// Single stats snapshot in one-shot mode.
    pub async fn stats_once(&self, container_id: &str) -> RuntimeResult<Stats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(container_id, Some(options));
        match stream.next().await {
            Some(stats) => stats.map_err(map_err),
            None => Err(RuntimeError::Protocol(
                "stats stream ended without a snapshot".to_string(),
            )),
        }
    }

    /// Continuous stats snapshots.
    pub fn stats_stream(
        &self,
        container_id: &str,
    ) -> impl Stream<Item = RuntimeResult<Stats>> + Unpin {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        self.docker
            .stats(container_id, Some(options))
            .map(|r| r.map_err(map_err))
    }

    /// Demuxed log stream. The runtime's native stream framing is resolved
    /// into stdout/stderr records before they reach the caller.
    pub fn logs(
        &self,
        container_id: &str,
        follow: bool,
        tail: &str,
    ) -> impl Stream<Item = RuntimeResult<LogOutput>> + Unpin {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        self.docker
            .logs(container_id, Some(options))
            .map(|r| r.map_err(map_err))
    }

    pub async fn exec_create(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> RuntimeResult<ExecHandle> {
        let exec = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(map_err)?;
        Ok(ExecHandle { id: exec.id })
    }

    pub async fn exec_start(&self, exec: &ExecHandle) -> RuntimeResult<StartExecResults> {
        self.docker.start_exec(&exec.id, None).await.map_err(map_err)
    }

    pub async fn exec_inspect(&self, exec: &ExecHandle) -> RuntimeResult<ExecInspectResponse> {
        self.docker.inspect_exec(&exec.id).await.map_err(map_err)
    }
}
