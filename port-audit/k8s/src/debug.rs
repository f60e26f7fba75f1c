//! Runs host commands through privileged debug pods.
//!
//! Each node gets a short-lived pod pinned to it that shares the host's PID
//! and network namespaces and mounts the host root at `/host`. Commands are
//! run with `chroot /host` so they observe the node rather than the pod.

use crate as k8s;
use anyhow::{anyhow, bail, Context, Result};
use k8s_openapi::{
    api::core::v1::{
        Container, HostPathVolumeSource, PodSpec, SecurityContext, Toleration, Volume,
        VolumeMount,
    },
    apimachinery::pkg::apis::meta::v1::Status,
};
use kube::{
    api::{AttachParams, DeleteParams, PostParams},
    runtime::wait::{await_condition, conditions},
};
use maplit::{btreemap, convert_args};
use port_audit_discovery::{Executor, Node};
use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time,
};
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "port-audit";
const CONTAINER: &str = "debug";
const HOST_ROOT: &str = "/host";
const HOST_VOLUME: &str = "host";

/// Pod names are DNS subdomains; leave room for the prefix and suffix.
const MAX_NODE_NAME: usize = 200;

/// Bounds retries of commands that fail to reach the pod.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    /// Delay between attempts.
    pub interval: time::Duration,
    /// Total time allowed for a command, retries included.
    pub timeout: time::Duration,
}

/// An [`Executor`] backed by privileged pods in a dedicated namespace.
pub struct DebugPods {
    client: k8s::Client,
    namespace: String,
    image: String,
    ready_timeout: time::Duration,
    retry: RetryBudget,
    created_namespace: AtomicBool,
}

/// A debug pod scheduled on a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugPod {
    pub name: String,
    pub node: String,
}

/// A command ran and reported failure.
///
/// These are not retried: the node answered, it just didn't like the command.
#[derive(Debug, thiserror::Error)]
#[error("{command} failed: {message}: {stderr}")]
pub struct CommandFailed {
    pub command: String,
    pub message: String,
    pub stderr: String,
}

// === impl RetryBudget ===

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            interval: time::Duration::from_secs(1),
            timeout: time::Duration::from_secs(30),
        }
    }
}

// === impl DebugPods ===

impl DebugPods {
    pub fn new(client: k8s::Client, namespace: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            image: image.into(),
            ready_timeout: time::Duration::from_secs(120),
            retry: RetryBudget::default(),
            created_namespace: AtomicBool::new(false),
        }
    }

    pub fn with_ready_timeout(self, ready_timeout: time::Duration) -> Self {
        Self {
            ready_timeout,
            ..self
        }
    }

    pub fn with_retry(self, retry: RetryBudget) -> Self {
        Self { retry, ..self }
    }

    fn namespaces(&self) -> k8s::Api<k8s::Namespace> {
        k8s::Api::all(self.client.clone())
    }

    fn pods(&self) -> k8s::Api<k8s::Pod> {
        k8s::Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn wait_running(&self, name: &str) -> Result<()> {
        let running = await_condition(self.pods(), name, conditions::is_pod_running());
        match time::timeout(self.ready_timeout, running).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(error).with_context(|| format!("waiting for pod {name}")),
            Err(_) => bail!(
                "pod {name} was not running after {:?}",
                self.ready_timeout
            ),
        }
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self
            .pods()
            .delete(name, &DeleteParams::default().grace_period(0))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(rsp)) if rsp.code == 404 => Ok(()),
            Err(error) => Err(error).with_context(|| format!("deleting pod {name}")),
        }
    }

    /// Runs a command once, returning its stdout on success.
    async fn exec_once(&self, pod: &str, command: &[String]) -> Result<Vec<u8>> {
        let params = AttachParams::default()
            .container(CONTAINER)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self.pods().exec(pod, command.to_vec(), &params).await?;

        let stdout = attached
            .stdout()
            .ok_or_else(|| anyhow!("exec stream has no stdout"))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| anyhow!("exec stream has no stderr"))?;
        let status = attached
            .take_status()
            .ok_or_else(|| anyhow!("exec stream has no status"))?;

        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;
        let status = status.await;
        attached
            .join()
            .await
            .map_err(|error| anyhow!("exec stream failed: {error}"))?;

        check_status(command, status, &stderr)?;
        Ok(stdout)
    }
}

#[async_trait::async_trait]
impl Executor for DebugPods {
    type Context = DebugPod;

    async fn setup(&self) -> Result<()> {
        let ns = k8s::Namespace {
            metadata: k8s::ObjectMeta {
                name: Some(self.namespace.clone()),
                labels: Some(convert_args!(btreemap!(
                    "app.kubernetes.io/managed-by" => FIELD_MANAGER,
                    "pod-security.kubernetes.io/enforce" => "privileged",
                    "pod-security.kubernetes.io/audit" => "privileged",
                    "pod-security.kubernetes.io/warn" => "privileged",
                    "security.openshift.io/scc.podSecurityLabelSync" => "false",
                ))),
                ..Default::default()
            },
            ..Default::default()
        };
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        match self.namespaces().create(&params, &ns).await {
            Ok(_) => {
                info!(namespace = %self.namespace, "Created debug namespace");
                self.created_namespace.store(true, Ordering::Release);
                Ok(())
            }
            Err(kube::Error::Api(rsp)) if rsp.code == 409 => {
                debug!(namespace = %self.namespace, "Debug namespace already exists");
                Ok(())
            }
            Err(error) => {
                Err(error).with_context(|| format!("creating namespace {}", self.namespace))
            }
        }
    }

    async fn create_context(&self, node: &Node) -> Result<DebugPod> {
        let name = pod_name(&node.name, &random_suffix(5));
        let pod = gen_pod(&self.namespace, &name, &node.name, &self.image);
        self.pods()
            .create(
                &PostParams {
                    dry_run: false,
                    field_manager: Some(FIELD_MANAGER.to_string()),
                },
                &pod,
            )
            .await
            .with_context(|| format!("creating pod {name}"))?;
        debug!(pod = %name, "Created debug pod");

        // The caller never sees a context that failed to start, so it has to
        // be removed here.
        if let Err(error) = self.wait_running(&name).await {
            if let Err(cleanup) = self.delete_pod(&name).await {
                warn!(pod = %name, error = %format!("{cleanup:#}"), "Failed to delete debug pod");
            }
            return Err(error);
        }

        Ok(DebugPod {
            name,
            node: node.name.clone(),
        })
    }

    async fn run(&self, pod: &DebugPod, argv: &[&str]) -> Result<Vec<u8>> {
        let command = chroot(argv);
        let cmdline = argv.join(" ");
        retry(self.retry, &cmdline, || self.exec_once(&pod.name, &command)).await
    }

    async fn destroy_context(&self, pod: DebugPod) -> Result<()> {
        debug!(pod = %pod.name, "Deleting debug pod");
        self.delete_pod(&pod.name).await
    }

    async fn teardown(&self) -> Result<()> {
        if !self.created_namespace.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        info!(namespace = %self.namespace, "Deleting debug namespace");
        match self
            .namespaces()
            .delete(&self.namespace, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(rsp)) if rsp.code == 404 => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("deleting namespace {}", self.namespace))
            }
        }
    }
}

/// Runs `attempt` until it succeeds, the command itself fails, or the budget
/// is spent.
async fn retry<F, Fut>(budget: RetryBudget, cmdline: &str, mut attempt: F) -> Result<Vec<u8>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
{
    let deadline = time::Instant::now() + budget.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        let error = match time::timeout(remaining, attempt()).await {
            Ok(Ok(stdout)) => return Ok(stdout),
            Ok(Err(error)) if error.is::<CommandFailed>() => return Err(error),
            Ok(Err(error)) => error,
            Err(_) => bail!("{cmdline} timed out after {:?}", budget.timeout),
        };

        if time::Instant::now() + budget.interval >= deadline {
            return Err(error.context(format!(
                "{cmdline} did not complete within {:?}",
                budget.timeout
            )));
        }
        debug!(command = %cmdline, error = %format!("{error:#}"), "Retrying");
        time::sleep(budget.interval).await;
    }
}

fn gen_pod(namespace: &str, name: &str, node: &str, image: &str) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            labels: Some(convert_args!(btreemap!(
                "app.kubernetes.io/name" => "port-audit",
                "app.kubernetes.io/component" => "debug",
                "app.kubernetes.io/managed-by" => FIELD_MANAGER,
            ))),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            host_pid: Some(true),
            host_network: Some(true),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: CONTAINER.to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    run_as_user: Some(0),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: HOST_VOLUME.to_string(),
                    mount_path: HOST_ROOT.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: HOST_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/".to_string(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_name(node: &str, suffix: &str) -> String {
    let node = node
        .char_indices()
        .nth(MAX_NODE_NAME)
        .map_or(node, |(i, _)| &node[..i])
        .trim_end_matches(['-', '.']);
    format!("{node}-debug-{suffix}")
}

fn random_suffix(len: usize) -> String {
    use rand::Rng;

    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let rng = &mut rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn chroot(argv: &[&str]) -> Vec<String> {
    ["chroot", HOST_ROOT]
        .iter()
        .chain(argv)
        .map(|s| s.to_string())
        .collect()
}

async fn read_all(mut reader: impl AsyncRead + Unpin) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .context("reading exec output")?;
    Ok(buf)
}

fn check_status(command: &[String], status: Option<Status>, stderr: &[u8]) -> Result<()> {
    let Some(status) = status else {
        bail!("exec stream closed without a status");
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(());
    }
    Err(CommandFailed {
        command: command.join(" "),
        message: status
            .message
            .or(status.reason)
            .unwrap_or_else(|| "unknown failure".to_string()),
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    }
    .into())
}
