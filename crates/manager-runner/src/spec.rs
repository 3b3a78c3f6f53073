//! Container specification for a single managed run.

use std::collections::HashMap;

/// Ordered `KEY=VALUE` environment entries.
///
/// Entries keep their insertion order; when the same key appears more than
/// once, [`EnvList::resolved`] keeps the last value at the position of the
/// last write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvList {
    entries: Vec<(String, String)>,
}

impl EnvList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Parse a `KEY=VALUE` entry. A missing `=` yields an empty value.
    pub fn push_pair(&mut self, pair: &str) {
        match pair.split_once('=') {
            Some((key, value)) => self.push(key, value),
            None => self.push(pair, ""),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with duplicate keys collapsed, last write wins.
    pub fn resolved(&self) -> Vec<(String, String)> {
        let last_index: HashMap<&str, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, (key, _))| (key.as_str(), idx))
            .collect();

        self.entries
            .iter()
            .enumerate()
            .filter(|(idx, (key, _))| last_index.get(key.as_str()) == Some(idx))
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

/// Immutable description of the container to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub entrypoint: Vec<String>,
    pub command: String,
    pub env: EnvList,
    pub tty: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

impl ContainerSpec {
    pub fn builder(image: impl Into<String>, command: impl Into<String>) -> ContainerSpecBuilder {
        ContainerSpecBuilder {
            spec: ContainerSpec {
                image: image.into(),
                entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
                command: command.into(),
                env: EnvList::new(),
                tty: false,
                attach_stdout: true,
                attach_stderr: true,
            },
        }
    }

    /// Copy of this spec with the version entry appended and the command
    /// prefixed by a short attach delay and a version compatibility check.
    pub fn augmented(&self, version: &str, version_check_script: &str) -> ContainerSpec {
        let mut spec = self.clone();
        spec.env.push(crate::VERSION_ENV, version);
        spec.command = format!(
            "sleep 0.1 && {} && {}",
            version_check_script, self.command
        );
        spec
    }
}

pub struct ContainerSpecBuilder {
    spec: ContainerSpec,
}

impl ContainerSpecBuilder {
    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.entrypoint = entrypoint.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.push(key, value);
        self
    }

    pub fn envs(mut self, env: EnvList) -> Self {
        for (key, value) in env.entries {
            self.spec.env.push(key, value);
        }
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.spec.tty = tty;
        self
    }

    pub fn attach(mut self, stdout: bool, stderr: bool) -> Self {
        self.spec.attach_stdout = stdout;
        self.spec.attach_stderr = stderr;
        self
    }

    pub fn build(self) -> ContainerSpec {
        self.spec
    }
}
