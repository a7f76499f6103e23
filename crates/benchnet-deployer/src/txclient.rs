//! Load clients that submit synthetic transactions against a node.

use std::fmt;
use std::fs;
use std::ops::RangeInclusive;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::account::{AccountError, Keyring};
use crate::backend::{DeploymentBackend, InstanceSpec, InstanceState};
use crate::config::Resources;
use crate::error::Error;

/// Tokens credited in the genesis to each load client's account.
pub const DEFAULT_TX_CLIENT_TOKENS: u64 = 10_000_000_000_000_000;

/// Directory, relative to the client's home, the keyring is shipped into.
pub const KEYRING_DIR: &str = "keyring";

/// Workload of a load client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxClientOptions {
    pub seed: u64,
    /// Number of concurrent blob submission sequences.
    pub sequences: u32,
    /// Blob sizes in bytes.
    pub blob_sizes: RangeInclusive<u64>,
    pub blobs_per_tx: RangeInclusive<u64>,
    /// How often the client polls the node for its account state.
    pub poll_time: Duration,
    pub resources: Resources,
}

impl Default for TxClientOptions {
    fn default() -> Self {
        Self {
            seed: 42,
            sequences: 1,
            blob_sizes: 200_000..=400_000,
            blobs_per_tx: 1..=1,
            poll_time: Duration::from_secs(3),
            resources: Resources::default(),
        }
    }
}

/// A load client instance and the funded account it signs with.
pub struct TxClient<H> {
    name: String,
    version: String,
    grpc_endpoint: String,
    keyring: Keyring,
    handle: H,
    destroyed: bool,
}

impl<H: fmt::Debug> fmt::Debug for TxClient<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxClient")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("grpc_endpoint", &self.grpc_endpoint)
            .field("account", &self.keyring.name())
            .field("handle", &self.handle)
            .finish()
    }
}

impl<H> TxClient<H>
where
    H: Clone + fmt::Debug + Send + Sync,
{
    /// Create the client's instance and ship its keyring into it.
    pub async fn create<B>(
        backend: &B,
        image: &str,
        version: &str,
        grpc_endpoint: &str,
        keyring: Keyring,
        options: &TxClientOptions,
    ) -> Result<Self, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        let name = keyring.name().to_string();
        let args = [
            "--key-path".to_string(),
            format!("{KEYRING_DIR}/{name}.pkcs8.hex"),
            "--grpc-endpoint".to_string(),
            grpc_endpoint.to_string(),
            "--poll-time".to_string(),
            humantime::format_duration(options.poll_time).to_string(),
            "--seed".to_string(),
            options.seed.to_string(),
            "--blob".to_string(),
            options.sequences.to_string(),
            "--blob-sizes".to_string(),
            format_range(&options.blob_sizes),
            "--blob-amounts".to_string(),
            format_range(&options.blobs_per_tx),
        ];
        let spec = InstanceSpec::new(&name, image, version, options.resources.clone()).with_args(args);
        let handle = backend.create(spec).await?;

        for (path, contents) in keyring_files(&keyring)? {
            backend.write_file(&handle, &path, contents).await?;
        }
        debug!(client = %name, %grpc_endpoint, "created load client");

        Ok(Self {
            name,
            version: version.to_string(),
            grpc_endpoint: grpc_endpoint.to_string(),
            keyring,
            handle,
            destroyed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn grpc_endpoint(&self) -> &str {
        &self.grpc_endpoint
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub async fn start<B>(&self, backend: &B) -> Result<(), Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        backend.start(&self.handle).await?;
        info!(client = %self.name, endpoint = %self.grpc_endpoint, "started load client");
        Ok(())
    }

    pub async fn stop<B>(&self, backend: &B) -> Result<(), Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        backend.stop(&self.handle).await?;
        info!(client = %self.name, "stopped load client");
        Ok(())
    }

    /// Release the client's instance. Destroying twice is a no-op.
    pub async fn destroy<B>(&mut self, backend: &B) -> Result<(), Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        if self.destroyed {
            return Ok(());
        }
        backend.destroy(&self.handle).await?;
        self.destroyed = true;
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub async fn is_running<B>(&self, backend: &B) -> bool
    where
        B: DeploymentBackend<Handle = H>,
    {
        backend.is_in_state(&self.handle, InstanceState::Started).await
    }
}

fn format_range(range: &RangeInclusive<u64>) -> String {
    format!("{}-{}", range.start(), range.end())
}

/// Files making up the keyring, relative to the client's home.
fn keyring_files(keyring: &Keyring) -> Result<Vec<(String, Bytes)>, Error> {
    let Some(dir) = keyring.dir() else {
        let name = keyring.name();
        let key = keyring.key();
        return Ok(vec![
            (
                format!("{KEYRING_DIR}/{name}.pkcs8.hex"),
                Bytes::from(key.to_pkcs8_hex()?),
            ),
            (
                format!("{KEYRING_DIR}/{name}.pub.hex"),
                Bytes::from(hex::encode(key.public_key_bytes())),
            ),
        ]);
    };

    let io_err = |path: &std::path::Path| {
        let path = path.to_path_buf();
        move |source| Error::Account(AccountError::Io { path, source })
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let contents = fs::read(&path).map_err(io_err(&path))?;
        files.push((
            format!("{KEYRING_DIR}/{}", entry.file_name().to_string_lossy()),
            Bytes::from(contents),
        ));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
