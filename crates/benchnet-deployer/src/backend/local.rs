//! Run every instance as a child process on the local host.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{BackendError, DeploymentBackend, InstanceSpec, InstanceState, Protocol};
use crate::ports::{NodePorts, PortAllocationStrategy};

/// File each instance's stdout and stderr are appended to.
pub const OUTPUT_LOG: &str = "output.log";

/// Handle to an instance of a [`LocalBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHandle {
    index: usize,
    name: String,
}

impl LocalHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct LocalInstance {
    spec: InstanceSpec,
    home: PathBuf,
    ports: NodePorts,
    state: InstanceState,
    child: Option<Child>,
}

impl LocalInstance {
    /// Notice processes that exited on their own.
    fn refresh(&mut self) {
        if self.state != InstanceState::Started {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(instance = %self.spec.name, %status, "process exited");
                    self.state = InstanceState::Stopped;
                    self.child = None;
                }
                Ok(None) => {}
                Err(e) => warn!(instance = %self.spec.name, "failed to poll process: {e}"),
            }
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                // Process may have already exited
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    return Err(e);
                }
            }
            child.wait()?;
        }
        Ok(())
    }
}

/// A deployment backend that spawns instances as processes on this host.
///
/// Each instance gets a home directory `<root>/<name>` and a block of ports from the
/// [`PortAllocationStrategy`]. The instance's `image` is the executable to run.
pub struct LocalBackend {
    root: PathBuf,
    bind_address: IpAddr,
    ports: PortAllocationStrategy,
    instances: Mutex<Vec<LocalInstance>>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: PortAllocationStrategy::default(),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn with_port_strategy(mut self, ports: PortAllocationStrategy) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Home directory of an instance.
    pub fn home(&self, handle: &LocalHandle) -> PathBuf {
        self.root.join(&handle.name)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LocalInstance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_instance<T>(
        &self,
        handle: &LocalHandle,
        f: impl FnOnce(&mut LocalInstance) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut instances = self.lock();
        let instance = instances
            .get_mut(handle.index)
            .ok_or_else(|| BackendError::UnknownInstance(handle.name.clone()))?;
        instance.refresh();
        f(instance)
    }
}

impl DeploymentBackend for LocalBackend {
    type Handle = LocalHandle;

    async fn create(&self, spec: InstanceSpec) -> Result<LocalHandle, BackendError> {
        let mut instances = self.lock();
        if instances.iter().any(|i| i.spec.name == spec.name) {
            return Err(BackendError::DuplicateInstance(spec.name));
        }

        let index = instances.len();
        let ports = self
            .ports
            .allocate(index)
            .ok_or_else(|| BackendError::PortsExhausted {
                name: spec.name.clone(),
                index,
            })?;
        let home = self.root.join(&spec.name);
        fs::create_dir_all(&home).map_err(|source| BackendError::Io {
            name: spec.name.clone(),
            operation: "create",
            path: Some(home.clone()),
            source,
        })?;

        debug!(instance = %spec.name, ?ports, home = %home.display(), "created instance");
        let handle = LocalHandle {
            index,
            name: spec.name.clone(),
        };
        instances.push(LocalInstance {
            spec,
            home,
            ports,
            state: InstanceState::Created,
            child: None,
        });
        Ok(handle)
    }

    async fn write_file(
        &self,
        handle: &LocalHandle,
        path: &str,
        contents: Bytes,
    ) -> Result<(), BackendError> {
        let relative = relative_path(handle, path)?;
        self.with_instance(handle, |instance| {
            expect_not_destroyed(handle, instance, "write to")?;
            let target = instance.home.join(relative);
            let io_err = |source| BackendError::Io {
                name: handle.name.clone(),
                operation: "write a file into",
                path: Some(target.clone()),
                source,
            };
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            fs::write(&target, &contents).map_err(io_err)
        })
    }

    async fn read_file(&self, handle: &LocalHandle, path: &str) -> Result<Bytes, BackendError> {
        let relative = relative_path(handle, path)?;
        self.with_instance(handle, |instance| {
            expect_not_destroyed(handle, instance, "read from")?;
            let target = instance.home.join(relative);
            fs::read(&target)
                .map(Bytes::from)
                .map_err(|source| BackendError::Io {
                    name: handle.name.clone(),
                    operation: "read a file from",
                    path: Some(target.clone()),
                    source,
                })
        })
    }

    async fn start(&self, handle: &LocalHandle) -> Result<(), BackendError> {
        self.with_instance(handle, |instance| {
            if !matches!(
                instance.state,
                InstanceState::Created | InstanceState::Stopped
            ) {
                return Err(BackendError::InvalidState {
                    name: handle.name.clone(),
                    state: instance.state,
                    operation: "start",
                });
            }

            let io_err = |operation, source| BackendError::Io {
                name: handle.name.clone(),
                operation,
                path: Some(instance.home.join(OUTPUT_LOG)),
                source,
            };
            let log = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(instance.home.join(OUTPUT_LOG))
                .map_err(|e| io_err("open the output log of", e))?;
            let log_err = log
                .try_clone()
                .map_err(|e| io_err("open the output log of", e))?;

            info!(
                instance = %instance.spec.name,
                version = %instance.spec.version,
                "starting {} {}",
                instance.spec.image,
                instance.spec.args.join(" ")
            );
            let child = Command::new(&instance.spec.image)
                .args(&instance.spec.args)
                .envs(&instance.spec.env)
                .current_dir(&instance.home)
                .stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(log_err))
                .spawn()
                .map_err(|source| BackendError::Io {
                    name: handle.name.clone(),
                    operation: "spawn",
                    path: Some(PathBuf::from(&instance.spec.image)),
                    source,
                })?;

            instance.child = Some(child);
            instance.state = InstanceState::Started;
            Ok(())
        })
    }

    async fn stop(&self, handle: &LocalHandle) -> Result<(), BackendError> {
        self.with_instance(handle, |instance| {
            if instance.state != InstanceState::Started {
                return Err(BackendError::InvalidState {
                    name: handle.name.clone(),
                    state: instance.state,
                    operation: "stop",
                });
            }
            instance.kill().map_err(|source| BackendError::Io {
                name: handle.name.clone(),
                operation: "stop",
                path: None,
                source,
            })?;
            instance.state = InstanceState::Stopped;
            info!(instance = %handle.name, "stopped");
            Ok(())
        })
    }

    async fn destroy(&self, handle: &LocalHandle) -> Result<(), BackendError> {
        self.with_instance(handle, |instance| {
            if instance.state == InstanceState::Destroyed {
                return Ok(());
            }
            instance.kill().map_err(|source| BackendError::Io {
                name: handle.name.clone(),
                operation: "kill",
                path: None,
                source,
            })?;
            match fs::remove_dir_all(&instance.home) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(BackendError::Io {
                        name: handle.name.clone(),
                        operation: "remove the home directory of",
                        path: Some(instance.home.clone()),
                        source,
                    });
                }
            }
            instance.state = InstanceState::Destroyed;
            info!(instance = %handle.name, "destroyed");
            Ok(())
        })
    }

    async fn is_in_state(&self, handle: &LocalHandle, state: InstanceState) -> bool {
        self.with_instance(handle, |instance| Ok(instance.state == state))
            .unwrap_or(false)
    }

    fn internal_address(
        &self,
        handle: &LocalHandle,
        protocol: Protocol,
    ) -> Result<String, BackendError> {
        self.with_instance(handle, |instance| {
            if instance.state == InstanceState::Destroyed {
                return Err(BackendError::Unreachable {
                    name: handle.name.clone(),
                    protocol,
                    reason: "instance was destroyed".to_string(),
                });
            }
            Ok(format!("{}:{}", self.bind_address, instance.ports.get(protocol)))
        })
    }

    async fn resolve_address(
        &self,
        handle: &LocalHandle,
        protocol: Protocol,
    ) -> Result<String, BackendError> {
        // Instances share the orchestrator's network namespace.
        self.internal_address(handle, protocol)
    }
}

/// `path` as a relative path that cannot leave the instance's home.
fn relative_path<'a>(handle: &LocalHandle, path: &'a str) -> Result<&'a Path, BackendError> {
    let relative = Path::new(path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if path.is_empty() || escapes {
        return Err(BackendError::InvalidPath {
            name: handle.name.clone(),
            path: path.to_string(),
        });
    }
    Ok(relative)
}

fn expect_not_destroyed(
    handle: &LocalHandle,
    instance: &LocalInstance,
    operation: &'static str,
) -> Result<(), BackendError> {
    if instance.state == InstanceState::Destroyed {
        return Err(BackendError::InvalidState {
            name: handle.name.clone(),
            state: instance.state,
            operation,
        });
    }
    Ok(())
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        for instance in self.lock().iter_mut() {
            if let Err(e) = instance.kill() {
                warn!(instance = %instance.spec.name, "failed to kill process: {e}");
            }
        }
    }
}
