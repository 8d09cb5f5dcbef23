//! Single-threaded worker that owns per-`AkkaCluster` gossip membership polling.
//!
//! Mirrors the upstream Go `StatusActor`: a dedicated task drains a bounded mailbox of
//! commands, rather than a shared map guarded by a mutex, so that timers, backoff and
//! read-modify-write state transitions stay ordered and local to one place. `getStatus`'s
//! synchronous "ask" is a `tokio::sync::oneshot` reply channel embedded in the command, the
//! same request/reply shape the Go version gets for free from a closure capturing a channel.

use crate::crd::akkacluster::{AkkaCluster, AkkaClusterStatus};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::channel::mpsc as change_mpsc;
use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::ResourceExt;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the outbound change-event channel the controller subscribes to via
/// `reconcile_all_on`, matching the upstream channel's role as a generic reconcile trigger.
const CHANGE_BUFFER_SIZE: usize = 16;

/// Container port name the actor looks for to derive the management endpoint port.
pub const MANAGEMENT_PORT_NAME: &str = "management";
/// Fallback management port when no container declares a `management` port.
pub const DEFAULT_MANAGEMENT_PORT: i32 = 8558;
/// Backoff cap: once `waitFactor` exceeds this, the polling record is erased.
const MAX_WAIT_FACTOR: u32 = 60;
/// HTTP client timeout for the membership GET.
const READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Bounded mailbox size, matching the upstream `chan func()` buffer of 100.
const MAILBOX_SIZE: usize = 100;

/// Namespaced key identifying one `AkkaCluster`'s polling state.
pub type ClusterKey = (String, String);

fn cluster_key(cluster: &AkkaCluster) -> ClusterKey {
    (cluster.namespace().unwrap_or_default(), cluster.name_any())
}

/// Returns a list of pods for a cluster. Production implementation lists via the
/// Kubernetes API using the CR's selector; tests substitute a fixed list.
pub trait PodLister: Send + Sync + 'static {
    fn list_pods(
        &self,
        cluster: &AkkaCluster,
    ) -> Pin<Box<dyn Future<Output = Vec<Pod>> + Send + '_>>;
}

/// Given a URL, returns the response body. Production implementation is an HTTP GET with a
/// 3-second timeout; tests substitute canned responses or simulated failures.
pub trait UrlReader: Send + Sync + 'static {
    fn read_url(&self, url: &str) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<u8>>> + Send + '_>>;
}

/// Lists pods in the CR's namespace matching `spec.selector.matchLabels` via the Kubernetes API.
pub struct ApiPodLister {
    client: Client,
}

impl ApiPodLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl PodLister for ApiPodLister {
    fn list_pods(
        &self,
        cluster: &AkkaCluster,
    ) -> Pin<Box<dyn Future<Output = Vec<Pod>> + Send + '_>> {
        let namespace = cluster.namespace().unwrap_or_default();
        let label_selector = cluster
            .spec
            .deployment
            .selector
            .match_labels
            .as_ref()
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",")
            });
        Box::pin(async move {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            let mut lp = ListParams::default();
            if let Some(selector) = label_selector {
                lp = lp.labels(&selector);
            }
            match api.list(&lp).await {
                Ok(list) => list.items,
                Err(e) => {
                    warn!(msg = "failed to list pods for status polling", %e);
                    Vec::new()
                }
            }
        })
    }
}

/// Fetches a URL body with `reqwest`, bounded by a 3-second timeout.
pub struct HttpUrlReader {
    client: reqwest::Client,
}

impl Default for HttpUrlReader {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(READ_TIMEOUT)
                .build()
                .expect("reqwest client with timeout"),
        }
    }
}

impl UrlReader for HttpUrlReader {
    fn read_url(&self, url: &str) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<u8>>> + Send + '_>> {
        let url = url.to_owned();
        Box::pin(async move {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            if !resp.status().is_success() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("unexpected status {}", resp.status()),
                ));
            }
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            Ok(bytes.to_vec())
        })
    }
}

/// Actor-internal polling state for one `AkkaCluster`. Holds a deep copy of the CR, mutated
/// in place as host/port/status are refreshed, the pending retry timer (if any), and the
/// backoff `waitFactor`.
struct PollingRecord {
    cluster: AkkaCluster,
    wait_factor: u32,
    timer: Option<JoinHandle<()>>,
}

enum Command {
    StartPolling {
        cluster: Box<AkkaCluster>,
        reply: oneshot::Sender<bool>,
    },
    GetStatus {
        key: ClusterKey,
        reply: oneshot::Sender<Option<AkkaClusterStatus>>,
    },
    StopPolling {
        key: ClusterKey,
    },
    Update {
        key: ClusterKey,
    },
}

/// Handle callers use to talk to a running [`StatusActor`]. Cloning is cheap: it's a
/// `mpsc::Sender` wrapper, the same "ask via channel" shape used throughout this codebase
/// for the other request/reply collaborators.
#[derive(Clone)]
pub struct StatusActorHandle {
    inbox: mpsc::Sender<Command>,
}

impl StatusActorHandle {
    /// Requests that the actor keep `cluster`'s status fresh.
    ///
    /// Quiesces bursts: if no prior polling record exists for this key, the first poll fires
    /// immediately; otherwise the pending timer is cancelled and rescheduled `minimal_wait` in
    /// the future, so that N calls inside one `minimal_wait` window collapse into a single
    /// poll executed `minimal_wait` after the last of them.
    pub async fn start_polling(&self, cluster: AkkaCluster) {
        let key = cluster_key(&cluster);
        let (reply, rx) = oneshot::channel();
        if self
            .inbox
            .send(Command::StartPolling {
                cluster: Box::new(cluster),
                reply,
            })
            .await
            .is_err()
        {
            return;
        }
        if let Ok(true) = rx.await {
            // Immediate path runs outside the actor's single-threaded section so that a slow
            // poll does not stall the mailbox for unrelated keys.
            let _ = self.inbox.send(Command::Update { key }).await;
        }
    }

    /// Returns the actor's latest known status for `key`, or `None` if unknown.
    pub async fn get_status(&self, key: ClusterKey) -> Option<AkkaClusterStatus> {
        let (reply, rx) = oneshot::channel();
        if self.inbox.send(Command::GetStatus { key, reply }).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Discards all polling state for `key`. Best-effort: a timer that has already fired and
    /// is queued ahead of this message may still run one stale poll, which observes the
    /// erased record and becomes a no-op.
    pub async fn stop_polling(&self, key: ClusterKey) {
        let _ = self.inbox.send(Command::StopPolling { key }).await;
    }
}

/// Owns the `polls` map and drives membership polling for every known `AkkaCluster`.
pub struct StatusActor<L: PodLister, R: UrlReader> {
    lister: L,
    reader: R,
    minimal_wait: Duration,
    polls: HashMap<ClusterKey, PollingRecord>,
    changes: change_mpsc::Sender<()>,
}

impl StatusActor<ApiPodLister, HttpUrlReader> {
    /// Spawns the production actor (Kubernetes pod lister, real HTTP reader) and returns a
    /// handle plus the outbound change-event stream the controller feeds into
    /// `Controller::reconcile_all_on` as a generic reconcile trigger.
    pub fn spawn(client: Client) -> (StatusActorHandle, change_mpsc::Receiver<()>) {
        Self::spawn_with(ApiPodLister::new(client), HttpUrlReader::default(), Duration::from_secs(1))
    }
}

impl<L: PodLister, R: UrlReader> StatusActor<L, R> {
    /// Spawns the actor task with injected collaborators and poll cadence, for tests.
    pub fn spawn_with(
        lister: L,
        reader: R,
        minimal_wait: Duration,
    ) -> (StatusActorHandle, change_mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
        let (changes, change_rx) = change_mpsc::channel(CHANGE_BUFFER_SIZE);
        let actor = StatusActor {
            lister,
            reader,
            minimal_wait,
            polls: HashMap::new(),
            changes,
        };
        tokio::spawn(actor.run(rx, tx.clone()));
        (StatusActorHandle { inbox: tx }, change_rx)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, self_tx: mpsc::Sender<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::StartPolling { cluster, reply } => {
                    let key = cluster_key(&cluster);
                    let immediate = self.handle_start_polling(key.clone(), *cluster, &self_tx);
                    let _ = reply.send(immediate);
                }
                Command::GetStatus { key, reply } => {
                    let status = self.polls.get(&key).and_then(|r| r.cluster.status.clone());
                    let _ = reply.send(status);
                }
                Command::StopPolling { key } => {
                    if let Some(mut record) = self.polls.remove(&key) {
                        if let Some(timer) = record.timer.take() {
                            timer.abort();
                        }
                    }
                }
                Command::Update { key } => {
                    self.update(key, &self_tx).await;
                }
            }
        }
    }

    fn handle_start_polling(
        &mut self,
        key: ClusterKey,
        cluster: AkkaCluster,
        self_tx: &mpsc::Sender<Command>,
    ) -> bool {
        let immediate = match self.polls.get_mut(&key) {
            Some(existing) => {
                if let Some(timer) = existing.timer.take() {
                    timer.abort();
                }
                false
            }
            None => true,
        };

        let timer = if immediate {
            None
        } else {
            Some(spawn_retry(self_tx.clone(), key.clone(), self.minimal_wait))
        };

        self.polls.insert(
            key,
            PollingRecord {
                cluster,
                wait_factor: 0,
                timer,
            },
        );
        immediate
    }

    /// The poll step. Ensures host/port, fetches membership, and either reports a change,
    /// schedules a backed-off retry, or abandons the record once `waitFactor` exceeds the cap.
    ///
    /// Takes the record out of `polls` for the duration of the two I/O calls so that the
    /// borrow on `self.lister`/`self.reader` never overlaps a borrow of `self.polls` itself.
    async fn update(&mut self, key: ClusterKey, self_tx: &mpsc::Sender<Command>) {
        let Some(mut record) = self.polls.remove(&key) else {
            // lost the race: stop_polling or a prior give-up already erased this record.
            return;
        };

        let host_found = Self::ensure_host_and_port(&self.lister, &mut record).await;
        if !host_found {
            let status = record.cluster.status.get_or_insert_with(AkkaClusterStatus::default);
            status.management_host = None;
            status.last_update = Some(now());
            self.polls.insert(key.clone(), record);
            self.schedule_retry(key, self_tx);
            return;
        }

        let fetched = Self::fetch_membership(&self.reader, &record).await;
        match fetched {
            Some(membership) => {
                let changed = record
                    .cluster
                    .status
                    .as_ref()
                    .map(|s| s.cluster != membership)
                    .unwrap_or(true);
                if changed {
                    let status = record.cluster.status.get_or_insert_with(AkkaClusterStatus::default);
                    status.cluster = membership;
                    status.last_update = Some(now());
                    record.timer = None;
                    info!(
                        msg = "status changed",
                        namespace = %key.0,
                        name = %key.1,
                    );
                    self.polls.insert(key, record);
                    // A generic reconcile trigger: the controller resyncs every cached
                    // AkkaCluster rather than being told which key changed.
                    if self.changes.try_send(()).is_err() {
                        debug!(msg = "change event dropped, mailbox full");
                    }
                    return;
                }
                self.polls.insert(key.clone(), record);
                self.schedule_retry(key, self_tx);
            }
            None => {
                self.polls.insert(key.clone(), record);
                self.schedule_retry(key, self_tx);
            }
        }
    }

    fn schedule_retry(&mut self, key: ClusterKey, self_tx: &mpsc::Sender<Command>) {
        let Some(record) = self.polls.get_mut(&key) else {
            return;
        };
        record.wait_factor = if record.wait_factor == 0 { 1 } else { record.wait_factor * 2 };
        if record.wait_factor > MAX_WAIT_FACTOR {
            debug!(msg = "backoff exhausted, abandoning poll", namespace = %key.0, name = %key.1);
            self.polls.remove(&key);
            return;
        }
        let wait = self.minimal_wait * record.wait_factor;
        record.timer = Some(spawn_retry(self_tx.clone(), key, wait));
    }

    /// Reuses the prior leader or `managementHost`, otherwise lists pods and picks a random
    /// `Running` one with an IP and no deletion timestamp. Returns whether a host is known.
    async fn ensure_host_and_port(lister: &L, record: &mut PollingRecord) -> bool {
        let status = record.cluster.status.get_or_insert_with(AkkaClusterStatus::default);

        if let Some(host) = status.management_host.clone() {
            if !host.is_empty() {
                if let Some(leader_host) = leader_hostname(&status.cluster.leader) {
                    status.management_host = Some(leader_host);
                }
                return true;
            }
        }

        let pods = lister.list_pods(&record.cluster).await;
        let Some(pod) = pick_running_pod(pods) else {
            return false;
        };
        let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
        let Some(ip) = pod_ip.filter(|ip| !ip.is_empty()) else {
            return false;
        };
        let status = record.cluster.status.get_or_insert_with(AkkaClusterStatus::default);
        status.management_host = Some(ip);
        if status.management_port.is_none() {
            status.management_port = Some(find_management_port(&pod));
        }
        true
    }

    async fn fetch_membership(
        reader: &R,
        record: &PollingRecord,
    ) -> Option<crate::crd::akkacluster::ClusterMembership> {
        let status = record.cluster.status.as_ref()?;
        let host = status.management_host.as_ref()?;
        let port = status.management_port.unwrap_or(DEFAULT_MANAGEMENT_PORT);
        let url = format!("http://{host}:{port}/cluster/members/");
        let body = reader.read_url(&url).await.ok()?;
        serde_json::from_slice(&body).ok()
    }
}

fn leader_hostname(leader: &str) -> Option<String> {
    // The leader field is an `akka.tcp://system@host:port` URL. Hostname and pod IP are
    // treated as interchangeable, without DNS resolution, per the upstream behavior.
    let without_scheme = leader.split("://").nth(1)?;
    let after_at = without_scheme.split('@').nth(1).unwrap_or(without_scheme);
    let host = after_at.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_owned())
    }
}

fn pick_running_pod(mut pods: Vec<Pod>) -> Option<Pod> {
    let mut rng = rand::thread_rng();
    pods.shuffle(&mut rng);
    pods.into_iter().find(|pod| {
        pod.metadata.deletion_timestamp.is_none()
            && pod
                .status
                .as_ref()
                .is_some_and(|s| s.phase.as_deref() == Some("Running") && s.pod_ip.as_deref().is_some_and(|ip| !ip.is_empty()))
    })
}

fn find_management_port(pod: &Pod) -> i32 {
    pod.spec
        .as_ref()
        .into_iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(MANAGEMENT_PORT_NAME))
        .map(|p| p.container_port)
        .unwrap_or(DEFAULT_MANAGEMENT_PORT)
}

fn now() -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Time {
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())
}

fn spawn_retry(self_tx: mpsc::Sender<Command>, key: ClusterKey, wait: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let _ = self_tx.send(Command::Update { key }).await;
    })
}
