//! This module provides the version handshake of a storage node with its storage container manager (SCM).
//!
//! The handshake is one step of the endpoint state machine, run repeatedly by an outer scheduler while holding the
//! endpoint connection lock. It never retries on its own: on I/O failure the state is left untouched for the next run.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::Config;

/// Version response key of the SCM id.
pub const SCM_ID: &str = "scmUuid";
/// Version response key of the cluster id.
pub const CLUSTER_ID: &str = "clusterID";

const VERSION_FILE: &str = "VERSION";

#[derive(Debug, Error)]
pub enum Error {
    #[error("reply from SCM: {0} cannot be null")]
    MissingField(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Endpoint states, in the order they are gone through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    GetVersion,
    Register,
    Heartbeat,
    Shutdown,
}

impl EndpointState {
    /// Return the state following this one, `Shutdown` being the last one.
    pub fn next_state(self) -> Self {
        match self {
            EndpointState::GetVersion => EndpointState::Register,
            EndpointState::Register => EndpointState::Heartbeat,
            EndpointState::Heartbeat | EndpointState::Shutdown => EndpointState::Shutdown,
        }
    }
}

/// SCM version reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionResponse {
    version: u32,
    values: HashMap<String, String>,
}

impl VersionResponse {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            values: Default::default(),
        }
    }

    #[inline]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// SCM version query interface.
pub trait VersionProtocol: Send + Sync {
    fn get_version(&self) -> impl Future<Output = io::Result<VersionResponse>> + Send;
}

/// Local storage volume interface.
pub trait StorageVolume: Send + Sync {
    /// Bind the volume to a cluster, if not bound yet.
    fn format(&self, cluster_id: &str) -> impl Future<Output = io::Result<()>> + Send;
}

/// Container command dispatcher interface.
pub trait Dispatcher: Send + Sync {
    fn set_scm_id(&self, scm_id: &str);
}

/// Connection state of an endpoint, only accessible while holding the endpoint lock.
#[derive(Debug)]
pub struct Connection {
    address: String,
    state: EndpointState,
    version: Option<VersionResponse>,
    missed_count: u64,
    log_warn_interval: u64,
}

impl Connection {
    #[inline]
    pub fn state(&self) -> EndpointState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: EndpointState) {
        self.state = state;
    }

    #[inline]
    pub fn version(&self) -> Option<&VersionResponse> {
        self.version.as_ref()
    }

    #[inline]
    pub fn set_version(&mut self, version: VersionResponse) {
        self.version = Some(version);
    }

    /// Number of consecutive calls that failed to reach the SCM.
    #[inline]
    pub fn missed_count(&self) -> u64 {
        self.missed_count
    }

    #[inline]
    pub fn zero_missed_count(&mut self) {
        self.missed_count = 0;
    }

    /// Count a missed call, logging it once every `log_warn_interval` misses.
    pub fn log_if_needed(&mut self, err: &io::Error) {
        if self.missed_count % self.log_warn_interval == 0 {
            tracing::warn!(
                "Unable to communicate to SCM server at {} for the past {} calls: {err}",
                self.address,
                self.missed_count + 1
            );
        }

        self.missed_count += 1;
    }
}

/// An SCM endpoint together with its connection state.
#[derive(Debug)]
pub struct EndpointStateMachine<E> {
    endpoint: E,
    connection: Mutex<Connection>,
}

impl<E: VersionProtocol> EndpointStateMachine<E> {
    pub fn new(address: impl Into<String>, endpoint: E, config: &Config) -> Self {
        Self {
            endpoint,
            connection: Mutex::new(Connection {
                address: address.into(),
                state: EndpointState::GetVersion,
                version: None,
                missed_count: 0,
                log_warn_interval: config.log_warn_interval.max(1),
            }),
        }
    }

    #[inline]
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Lock the connection state, for as long as the guard is held.
    #[inline]
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().await
    }

    pub async fn state(&self) -> EndpointState {
        self.lock().await.state()
    }
}

/// The endpoint task fetching the SCM version and formatting local volumes accordingly.
#[derive(Debug)]
pub struct VersionEndpointTask<'a, E, V, D> {
    endpoint: &'a EndpointStateMachine<E>,
    volumes: &'a [V],
    dispatcher: &'a D,
}

impl<'a, E, V, D> VersionEndpointTask<'a, E, V, D>
where
    E: VersionProtocol,
    V: StorageVolume,
    D: Dispatcher,
{
    pub fn new(endpoint: &'a EndpointStateMachine<E>, volumes: &'a [V], dispatcher: &'a D) -> Self {
        Self {
            endpoint,
            volumes,
            dispatcher,
        }
    }

    /// Run the version handshake and return the resulting endpoint state.
    ///
    /// I/O failures are only logged and counted as missed calls, leaving the state unchanged.
    /// A reply missing the SCM id or the cluster id fails with [`Error::MissingField`].
    pub async fn call(&self) -> Result<EndpointState, Error> {
        let mut connection = self.endpoint.lock().await;

        match self.handshake(&mut connection).await {
            Ok(()) => {}
            Err(Error::Io(err)) => connection.log_if_needed(&err),
            Err(err) => return Err(err),
        }

        Ok(connection.state())
    }

    async fn handshake(&self, connection: &mut Connection) -> Result<(), Error> {
        let response = self.endpoint.endpoint().get_version().await?;
        connection.set_version(response.clone());

        let scm_id = response.value(SCM_ID).ok_or(Error::MissingField(SCM_ID))?;
        let cluster_id = response.value(CLUSTER_ID).ok_or(Error::MissingField(CLUSTER_ID))?;

        for volume in self.volumes {
            volume.format(cluster_id).await?;
            self.dispatcher.set_scm_id(scm_id);
        }

        let state = connection.state().next_state();
        tracing::debug!("Got SCM version {}, moving endpoint to {state:?}", response.version());

        connection.set_state(state);
        connection.zero_missed_count();

        Ok(())
    }
}

/// A storage volume rooted in a local directory.
///
/// Formatting writes a `VERSION` file binding the volume to a cluster.
#[derive(Debug, Clone)]
pub struct LocalVolume {
    root: PathBuf,
}

impl LocalVolume {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.root.as_path()
    }

    /// Return the cluster id the volume is bound to, if formatted.
    pub async fn cluster_id(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(self.root.join(VERSION_FILE)).await {
            Ok(content) => Ok(content
                .lines()
                .find_map(|line| line.strip_prefix(CLUSTER_ID)?.strip_prefix('='))
                .map(str::to_owned)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl StorageVolume for LocalVolume {
    fn format(&self, cluster_id: &str) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            match self.cluster_id().await? {
                Some(id) if id == cluster_id => Ok(()),
                Some(id) => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("volume `{}` belongs to cluster {id}, not {cluster_id}", self.root.display()),
                )),
                None => {
                    tracing::debug!("Formatting volume `{}` for cluster {cluster_id}", self.root.display());

                    fs::create_dir_all(&self.root).await?;
                    fs::write(self.root.join(VERSION_FILE), format!("{CLUSTER_ID}={cluster_id}\n")).await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    const ADDRESS: &str = "scm.example.org:9861";

    /// Replies with scripted responses, then with connection errors.
    #[derive(Debug, Default)]
    struct FakeScm {
        responses: StdMutex<VecDeque<io::Result<VersionResponse>>>,
    }

    impl FakeScm {
        fn new<I: IntoIterator<Item = io::Result<VersionResponse>>>(responses: I) -> Self {
            Self {
                responses: StdMutex::new(responses.into_iter().collect()),
            }
        }
    }

    impl VersionProtocol for FakeScm {
        fn get_version(&self) -> impl Future<Output = io::Result<VersionResponse>> + Send {
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(io::ErrorKind::ConnectionRefused.into()));

            async move { response }
        }
    }

    #[derive(Debug, Default)]
    struct FakeDispatcher {
        scm_id: StdMutex<Option<String>>,
    }

    impl Dispatcher for FakeDispatcher {
        fn set_scm_id(&self, scm_id: &str) {
            *self.scm_id.lock().unwrap() = Some(scm_id.to_owned());
        }
    }

    fn response() -> VersionResponse {
        VersionResponse::new(1).with_value(SCM_ID, "scm-1").with_value(CLUSTER_ID, "CID-1")
    }

    fn volumes(dir: &Path) -> Vec<LocalVolume> {
        vec![LocalVolume::new(dir.join("disk1")), LocalVolume::new(dir.join("disk2"))]
    }

    #[test]
    fn test_next_state() {
        let mut state = EndpointState::GetVersion;
        let mut states = vec![state];

        for _ in 0..4 {
            state = state.next_state();
            states.push(state);
        }

        assert_eq!(
            states,
            [
                EndpointState::GetVersion,
                EndpointState::Register,
                EndpointState::Heartbeat,
                EndpointState::Shutdown,
                EndpointState::Shutdown,
            ]
        );
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_version_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = volumes(dir.path());
        let dispatcher = FakeDispatcher::default();

        let scm = FakeScm::new([Err(io::ErrorKind::TimedOut.into()), Ok(response())]);
        let endpoint = EndpointStateMachine::new(ADDRESS, scm, &Config::default());
        let task = VersionEndpointTask::new(&endpoint, &volumes, &dispatcher);

        // unreachable SCM, retried by the next run
        assert_eq!(task.call().await.unwrap(), EndpointState::GetVersion);
        assert_eq!(endpoint.lock().await.missed_count(), 1);
        assert!(logs_contain("Unable to communicate to SCM server at scm.example.org:9861"));

        assert_eq!(task.call().await.unwrap(), EndpointState::Register);

        let connection = endpoint.lock().await;
        assert_eq!(connection.missed_count(), 0);
        assert_eq!(connection.version(), Some(&response()));
        drop(connection);

        for volume in &volumes {
            assert_eq!(volume.cluster_id().await.unwrap().as_deref(), Some("CID-1"));
        }
        assert_eq!(dispatcher.scm_id.lock().unwrap().as_deref(), Some("scm-1"));
    }

    #[tokio::test]
    async fn test_missing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = volumes(dir.path());
        let dispatcher = FakeDispatcher::default();

        let scm = FakeScm::new([
            Ok(VersionResponse::new(1).with_value(SCM_ID, "scm-1")),
            Ok(VersionResponse::new(1).with_value(CLUSTER_ID, "CID-1")),
        ]);
        let endpoint = EndpointStateMachine::new(ADDRESS, scm, &Config::default());
        let task = VersionEndpointTask::new(&endpoint, &volumes, &dispatcher);

        assert!(matches!(task.call().await, Err(Error::MissingField(CLUSTER_ID))));
        assert!(matches!(task.call().await, Err(Error::MissingField(SCM_ID))));

        assert_eq!(endpoint.state().await, EndpointState::GetVersion);
        assert_eq!(volumes[0].cluster_id().await.unwrap(), None);
        assert!(dispatcher.scm_id.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_volume_of_another_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = volumes(dir.path());
        let dispatcher = FakeDispatcher::default();

        volumes[1].format("CID-0").await.unwrap();
        // formatting again for the same cluster is harmless
        volumes[1].format("CID-0").await.unwrap();

        let scm = FakeScm::new([Ok(response())]);
        let endpoint = EndpointStateMachine::new(ADDRESS, scm, &Config::default());
        let task = VersionEndpointTask::new(&endpoint, &volumes, &dispatcher);

        assert_eq!(task.call().await.unwrap(), EndpointState::GetVersion);
        assert_eq!(endpoint.lock().await.missed_count(), 1);
        assert_eq!(volumes[1].cluster_id().await.unwrap().as_deref(), Some("CID-0"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_log_if_needed_rate_limit() {
        let config = Config::default().with_log_warn_interval(2);
        let endpoint = EndpointStateMachine::new(ADDRESS, FakeScm::default(), &config);
        let dispatcher = FakeDispatcher::default();
        let task = VersionEndpointTask::<_, LocalVolume, _>::new(&endpoint, &[], &dispatcher);

        for _ in 0..3 {
            assert_eq!(task.call().await.unwrap(), EndpointState::GetVersion);
        }

        assert_eq!(endpoint.lock().await.missed_count(), 3);
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("Unable to communicate")).count() {
                2 => Ok(()),
                n => Err(format!("expected 2 warnings, got {n}")),
            }
        });
    }
}
