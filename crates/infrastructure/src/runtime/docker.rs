use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, RenameContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use futures_util::TryStreamExt;
use tracing::debug;

use domain::runtime::{ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeError};
use domain::state::ServiceStatus;

/// Docker-backed implementation of the container runtime seam.
pub struct DockerRuntime {
    docker: Docker,
}

fn classify(e: bollard::errors::Error, context: &str) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => RuntimeError::NotFound(format!("{context}: {message}")),
            409 => RuntimeError::Conflict(format!("{context}: {message}")),
            500.. => RuntimeError::Unavailable(format!("{context}: {message}")),
            _ => RuntimeError::Other(format!("{context}: {status_code} {message}")),
        },
        other => RuntimeError::Unavailable(format!("{context}: {other}")),
    }
}

fn parse_port_mapping(mapping: &str) -> Option<(String, String)> {
    let (host, container) = mapping.split_once(':')?;
    let container = if container.contains('/') {
        container.to_string()
    } else {
        format!("{container}/tcp")
    };
    Some((container, host.to_string()))
}

fn restart_policy(name: Option<&str>) -> RestartPolicy {
    let name = match name.unwrap_or("unless-stopped") {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::UNLESS_STOPPED,
    };
    RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("docker connect: {e}")))?;
        Ok(Self { docker })
    }

    async fn summarize(&self, id: &str) -> Result<ContainerSummary, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, "inspect container"))?;

        let config = inspect.config.unwrap_or_default();
        let host_config = inspect.host_config.unwrap_or_default();

        let environment: BTreeMap<String, String> = config
            .env
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        let ports: Vec<String> = host_config
            .port_bindings
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(container_port, bindings)| {
                let container_port = container_port
                    .split('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(move |b| {
                        b.host_port
                            .map(|host| format!("{host}:{container_port}"))
                    })
            })
            .collect();

        let networks: Vec<String> = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();

        let volumes: Vec<String> = host_config.binds.unwrap_or_default();

        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| ServiceStatus::from_runtime_state(&s.to_string()))
            .unwrap_or(ServiceStatus::Unknown);

        Ok(ContainerSummary {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image.unwrap_or_default(),
            image_digest: inspect.image,
            status,
            environment,
            ports,
            networks,
            volumes,
            labels: config
                .labels
                .unwrap_or_default()
                .into_iter()
                .collect(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(format!("ping: {e}")))
    }

    async fn list_containers(
        &self,
        label_selector: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_selector.to_string()]);

        let list = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify(e, "list containers"))?;

        let mut summaries = Vec::with_capacity(list.len());
        for entry in list {
            let Some(id) = entry.id else { continue };
            match self.summarize(&id).await {
                Ok(summary) => summaries.push(summary),
                // A container may exit and vanish between list and inspect.
                Err(RuntimeError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for mapping in &spec.ports {
            if let Some((container_port, host_port)) = parse_port_mapping(mapping) {
                port_bindings
                    .entry(container_port)
                    .or_insert_with(|| Some(Vec::new()))
                    .get_or_insert_with(Vec::new)
                    .push(PortBinding {
                        host_ip: None,
                        host_port: Some(host_port),
                    });
            }
        }

        let host_config = HostConfig {
            binds: (!spec.volumes.is_empty()).then(|| spec.volumes.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            restart_policy: Some(restart_policy(spec.restart_policy.as_deref())),
            privileged: Some(spec.privileged),
            network_mode: spec.networks.first().cloned(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: (!env.is_empty()).then_some(env),
            cmd: spec.command.clone(),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| classify(e, "create container"))?;

        // Attach any secondary networks; the first is the network mode.
        for network in spec.networks.iter().skip(1) {
            self.docker
                .connect_network(
                    network,
                    ConnectNetworkOptions {
                        container: created.id.clone(),
                        endpoint_config: Default::default(),
                    },
                )
                .await
                .map_err(|e| classify(e, "connect network"))?;
        }

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            // 304: already started
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, "start container")),
        }
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout_secs as i64,
                }),
            )
            .await
        {
            Ok(_) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, "stop container")),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, "kill container"))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(e, "remove container"))
    }

    async fn rename_container(&self, id: &str, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .rename_container(id, RenameContainerOptions { name })
            .await
            .map_err(|e| classify(e, "rename container"))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut progress = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        // Drain the progress stream; any item error fails the pull.
        loop {
            match progress.try_next().await {
                Ok(Some(info)) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "pull progress");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(RuntimeError::ImagePullFailed(format!("{image}: {e}")));
                }
            }
        }
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(classify(e, "inspect image")),
        }
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(image, None::<RemoveImageOptions>, None)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "remove image"))
    }

    async fn create_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "create network"))
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| classify(e, "remove network"))
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "create volume"))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|e| classify(e, "remove volume"))
    }

    async fn container_logs(&self, id: &str, tail: usize) -> Result<Vec<String>, RuntimeError> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut lines = Vec::new();
        while let Some(output) = stream
            .try_next()
            .await
            .map_err(|e| classify(e, "container logs"))?
        {
            lines.push(String::from_utf8_lossy(&output.into_bytes()).trim_end().to_string());
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_mapping() {
        assert_eq!(
            parse_port_mapping("8080:80"),
            Some(("80/tcp".to_string(), "8080".to_string()))
        );
        assert_eq!(
            parse_port_mapping("5000:5000/udp"),
            Some(("5000/udp".to_string(), "5000".to_string()))
        );
        assert_eq!(parse_port_mapping("noport"), None);
    }

    #[test]
    fn test_restart_policy_mapping() {
        assert_eq!(
            restart_policy(Some("always")).name,
            Some(RestartPolicyNameEnum::ALWAYS)
        );
        assert_eq!(
            restart_policy(None).name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert_eq!(restart_policy(Some("no")).name, Some(RestartPolicyNameEnum::NO));
    }
}
