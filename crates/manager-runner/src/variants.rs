//! Call-site specializations of [`ManagedRun`]: a run that stages the full
//! cluster configuration into the manager container, and a lightweight
//! access-command run.

use crate::error::{CredentialsError, RunError, StagingError};
use crate::runner::{ManagedRun, RunResult};
use crate::spec::{ContainerSpec, EnvList};
use crate::staging::{ArchiveInput, CopyFromContainer, CopyToContainer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory inside the container that receives staged inputs.
pub const CONTAINER_INPUT_DIR: &str = "/in";
/// Script in the manager image that prints `export` lines for a cluster config.
pub const CLUSTER_CONFIG_ENV_SCRIPT: &str = "/root/cluster_config_env.py";

const TELEMETRY_PASSTHROUGH: [&str; 3] = [
    "CORTEX_TELEMETRY_DISABLE",
    "CORTEX_TELEMETRY_SENTRY_DSN",
    "CORTEX_TELEMETRY_SEGMENT_WRITE_KEY",
];

const DEV_PASSTHROUGH: [&str; 2] = [
    "CORTEX_DEV_DEFAULT_IMAGE_REGISTRY",
    "CORTEX_DEV_ADD_CONTROL_PLANE_DASHBOARD",
];

/// Cluster configuration handed to the manager image. Only the fields this
/// crate needs are typed; every other key is carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub region: String,
    pub image_manager: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Minimal identity of an existing cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
    pub cluster_name: String,
    pub region: String,
    pub image_manager: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self, CredentialsError> {
        let access_key_id = non_empty_env("AWS_ACCESS_KEY_ID")
            .ok_or(CredentialsError::Missing("AWS_ACCESS_KEY_ID"))?;
        let secret_access_key = non_empty_env("AWS_SECRET_ACCESS_KEY")
            .ok_or(CredentialsError::Missing("AWS_SECRET_ACCESS_KEY"))?;

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: non_empty_env("AWS_SESSION_TOKEN"),
        })
    }

    fn push_keys(&self, env: &mut EnvList) {
        env.push("AWS_ACCESS_KEY_ID", &self.access_key_id);
        env.push("AWS_SECRET_ACCESS_KEY", &self.secret_access_key);
    }

    fn push_session_token(&self, env: &mut EnvList) {
        if let Some(token) = &self.session_token {
            env.push("AWS_SESSION_TOKEN", token);
        }
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|val| !val.is_empty())
}

/// Forward `keys` from this process; unset variables pass through empty.
fn passthrough(vars: &mut EnvList, keys: &[&str]) {
    for key in keys {
        vars.push(*key, env::var(key).unwrap_or_default());
    }
}

/// Cache location for a serialized cluster config, keyed by name and region.
pub fn cached_cluster_config_path(cache_dir: &Path, cluster_name: &str, region: &str) -> PathBuf {
    cache_dir.join(format!("cluster_{}_{}.yaml", cluster_name, region))
}

/// Structured-config run: serialize the config, stage it into the container
/// and bootstrap the environment from it before running `entrypoint`.
pub struct ClusterConfigInvocation<'a> {
    pub entrypoint: &'a str,
    pub config: &'a ClusterConfig,
    pub credentials: &'a AwsCredentials,
    pub cache_dir: &'a Path,
    pub extra_env: EnvList,
}

impl ClusterConfigInvocation<'_> {
    /// Write the cached config file and build the container spec plus the
    /// copy-in directive that stages the file.
    pub async fn prepare(&self) -> Result<(ContainerSpec, CopyToContainer), StagingError> {
        let cached_path = cached_cluster_config_path(
            self.cache_dir,
            &self.config.cluster_name,
            &self.config.region,
        );
        write_cluster_config(self.config, &cached_path).await?;

        let file_name = cached_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let container_config_path = format!("{}/{}", CONTAINER_INPUT_DIR, file_name);

        let copy_in = CopyToContainer::new(
            ArchiveInput::new().file(&cached_path, container_config_path.clone()),
            "/",
        );

        let mut env = EnvList::new();
        self.credentials.push_keys(&mut env);
        passthrough(&mut env, &TELEMETRY_PASSTHROUGH);
        passthrough(&mut env, &DEV_PASSTHROUGH);
        env.push("CORTEX_CLUSTER_CONFIG_FILE", container_config_path.clone());
        for (key, value) in self.extra_env.resolved() {
            env.push(key, value);
        }
        self.credentials.push_session_token(&mut env);

        let spec = ContainerSpec::builder(
            self.config.image_manager.clone(),
            format!(
                "eval $(python {} {}) && {}",
                CLUSTER_CONFIG_ENV_SCRIPT, container_config_path, self.entrypoint
            ),
        )
        .entrypoint(["/bin/bash", "-c"])
        .tty(true)
        .attach(true, true)
        .envs(env)
        .build();

        Ok((spec, copy_in))
    }

    /// Prepare and run. The staged config is copied in after `copy_in`.
    pub async fn run(
        &self,
        runner: &ManagedRun,
        copy_in: &[CopyToContainer],
        copy_out: &[CopyFromContainer],
    ) -> Result<RunResult, RunError> {
        let (spec, config_copy) = self.prepare().await?;
        let mut copy_in = copy_in.to_vec();
        copy_in.push(config_copy);

        runner
            .clone()
            .newline_after_pull(false)
            .run(&spec, &copy_in, copy_out)
            .await
    }
}

async fn write_cluster_config(config: &ClusterConfig, path: &Path) -> Result<(), StagingError> {
    let bytes = serde_yaml::to_string(config)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StagingError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| StagingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), "cached cluster configuration");
    Ok(())
}

/// Access-command run: a fixed command with a narrower environment and no
/// staged configuration.
pub struct AccessCommandInvocation<'a> {
    pub entrypoint: &'a str,
    pub access: &'a AccessConfig,
    pub credentials: &'a AwsCredentials,
}

impl AccessCommandInvocation<'_> {
    pub fn spec(&self) -> ContainerSpec {
        let mut env = EnvList::new();
        self.credentials.push_keys(&mut env);
        env.push("CORTEX_CLUSTER_NAME", &self.access.cluster_name);
        env.push("CORTEX_REGION", &self.access.region);
        passthrough(&mut env, &TELEMETRY_PASSTHROUGH);
        self.credentials.push_session_token(&mut env);

        ContainerSpec::builder(self.access.image_manager.clone(), self.entrypoint)
            .entrypoint(["/bin/bash", "-c"])
            .tty(true)
            .attach(true, true)
            .envs(env)
            .build()
    }

    pub async fn run(
        &self,
        runner: &ManagedRun,
        copy_in: &[CopyToContainer],
        copy_out: &[CopyFromContainer],
    ) -> Result<RunResult, RunError> {
        runner
            .clone()
            .newline_after_pull(true)
            .run(&self.spec(), copy_in, copy_out)
            .await
    }
}
