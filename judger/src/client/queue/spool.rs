//! A directory-backed queue that survives restarts.
//!
//! Producers drop job files (the JSON wire form of [`Job`]) into
//! `critical/` or `default/`; files are served in name order within a class.
//! A delivered file is moved to `inflight/` until it is settled, and
//! anything still there on startup is returned to its class, so an
//! unfinished job is never lost. Unreadable files are moved to `rejected/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

use super::{settled_attempts, JobQueue, PriorityPicker, QueueError};
use crate::client::model::{Delivery, Job, Priority, Requeue};

/// How often an idle dequeue rescans the class directories.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const IN_FLIGHT_DIR: &str = "inflight";
const REJECTED_DIR: &str = "rejected";

/// A job file as rewritten by the queue after a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    job: Job,
    attempts: u32,
    #[serde(default)]
    not_before: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpoolFile {
    Envelope(Envelope),
    Plain(Job),
}

impl Envelope {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

#[derive(Debug)]
struct InFlight {
    class: Priority,
    name: String,
    envelope: Envelope,
}

#[derive(Debug)]
struct State {
    /// Parsed files waiting in each class directory, keyed by file name.
    ready: HashMap<Priority, BTreeMap<String, Envelope>>,
    /// Files taken out of a class directory and not yet settled.
    claimed: HashSet<(Priority, String)>,
    in_flight: HashMap<u64, InFlight>,
    picker: PriorityPicker,
}

impl State {
    fn ready(&mut self, class: Priority) -> &mut BTreeMap<String, Envelope> {
        self.ready.entry(class).or_default()
    }

    fn has_due(&self, class: Priority, now: DateTime<Utc>) -> bool {
        self.ready
            .get(&class)
            .map_or(false, |m| m.values().any(|e| e.is_due(now)))
    }
}

#[derive(Debug)]
pub struct SpoolQueue {
    root: PathBuf,
    state: Mutex<State>,
    notify: Notify,
    next_tag: AtomicU64,
    next_seq: AtomicU64,
}

impl SpoolQueue {
    /// Open (creating if needed) the spool at `root`, returning every job that
    /// was in flight when the previous process stopped.
    pub async fn open(root: impl Into<PathBuf>, critical_burst: u32) -> Result<Self, QueueError> {
        let root = root.into();
        for dir in [
            class_dir_name(Priority::Critical),
            class_dir_name(Priority::Default),
            IN_FLIGHT_DIR,
            REJECTED_DIR,
        ] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }

        let mut returned = 0usize;
        let mut entries = tokio::fs::read_dir(root.join(IN_FLIGHT_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let (class, name) = match split_in_flight_name(&file_name) {
                Some(x) => x,
                None => {
                    tracing::warn!(file = %file_name, "unexpected file in inflight directory");
                    continue;
                }
            };
            tokio::fs::rename(entry.path(), root.join(class_dir_name(class)).join(name)).await?;
            returned += 1;
        }
        if returned > 0 {
            tracing::warn!(returned, "returned unfinished jobs to the spool");
        }

        let queue = SpoolQueue {
            root,
            state: Mutex::new(State {
                ready: HashMap::new(),
                claimed: HashSet::new(),
                in_flight: HashMap::new(),
                picker: PriorityPicker::new(critical_burst),
            }),
            notify: Notify::new(),
            next_tag: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        };
        queue.refresh().await?;
        Ok(queue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state(&self) -> MutexGuard<State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn class_dir(&self, class: Priority) -> PathBuf {
        self.root.join(class_dir_name(class))
    }

    fn in_flight_path(&self, class: Priority, name: &str) -> PathBuf {
        self.root
            .join(IN_FLIGHT_DIR)
            .join(format!("{}~{}", class_dir_name(class), name))
    }

    /// Pick up files dropped into the class directories since the last scan.
    async fn refresh(&self) -> Result<(), QueueError> {
        for class in Priority::ALL {
            let dir = self.class_dir(class);
            let mut names = vec![];
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".json") {
                    names.push(name);
                }
            }
            let unknown: Vec<String> = {
                let mut state = self.state();
                names
                    .into_iter()
                    .filter(|n| {
                        !state.claimed.contains(&(class, n.clone()))
                            && !state.ready(class).contains_key(n)
                    })
                    .collect()
            };
            for name in unknown {
                let path = dir.join(&name);
                let raw = match tokio::fs::read(&path).await {
                    Ok(raw) => raw,
                    // Removed by the producer before we got to it.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                let envelope = match serde_json::from_slice::<SpoolFile>(&raw) {
                    Ok(SpoolFile::Envelope(e)) => e,
                    Ok(SpoolFile::Plain(job)) => Envelope {
                        job,
                        attempts: 0,
                        not_before: None,
                    },
                    Err(e) => {
                        let err = QueueError::Malformed(name.clone(), e);
                        tracing::warn!(error = %err, "rejecting job file");
                        tokio::fs::rename(&path, self.root.join(REJECTED_DIR).join(&name)).await?;
                        continue;
                    }
                };
                let mut envelope = envelope;
                // The directory decides the class.
                envelope.job.priority = class;
                let mut state = self.state();
                if !state.claimed.contains(&(class, name.clone())) {
                    state.ready(class).insert(name, envelope);
                }
            }
        }
        Ok(())
    }

    fn claim(&self) -> Option<(Priority, String, Envelope)> {
        let now = Utc::now();
        let mut state = self.state();
        let (c, d) = (
            state.has_due(Priority::Critical, now),
            state.has_due(Priority::Default, now),
        );
        let class = state.picker.pick(c, d)?;
        let name = state
            .ready(class)
            .iter()
            .find(|(_, e)| e.is_due(now))
            .map(|(n, _)| n.clone())?;
        let envelope = state.ready(class).remove(&name)?;
        state.claimed.insert((class, name.clone()));
        Some((class, name, envelope))
    }

    fn unclaim(&self, class: Priority, name: &str) {
        self.state().claimed.remove(&(class, name.to_string()));
    }

    async fn try_take(&self) -> Result<Option<Delivery>, QueueError> {
        while let Some((class, name, envelope)) = self.claim() {
            let from = self.class_dir(class).join(&name);
            match tokio::fs::rename(&from, self.in_flight_path(class, &name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(file = %name, "job file vanished before delivery");
                    self.unclaim(class, &name);
                    continue;
                }
                Err(e) => {
                    let mut state = self.state();
                    state.claimed.remove(&(class, name.clone()));
                    state.ready(class).insert(name, envelope);
                    return Err(e.into());
                }
            }
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            let delivery = Delivery {
                job: envelope.job.clone(),
                attempt: envelope.attempts + 1,
                tag,
            };
            self.state().in_flight.insert(
                tag,
                InFlight {
                    class,
                    name,
                    envelope,
                },
            );
            return Ok(Some(delivery));
        }
        Ok(None)
    }

    async fn write_atomic(&self, dest: PathBuf, content: &[u8]) -> Result<(), QueueError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let tmp = self
            .root
            .join(IN_FLIGHT_DIR)
            .join(format!(".tmp-{}-{}", std::process::id(), seq));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }

    fn take_in_flight(&self, tag: u64) -> Result<InFlight, QueueError> {
        self.state()
            .in_flight
            .remove(&tag)
            .ok_or(QueueError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let class = job.priority;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{:020}-{:06}-{}.json",
            Utc::now().timestamp_nanos(),
            seq % 1_000_000,
            sanitize(&job.id)
        );
        let envelope = Envelope {
            job,
            attempts: 0,
            not_before: None,
        };
        self.write_atomic(
            self.class_dir(class).join(&name),
            &serde_json::to_vec(&envelope)?,
        )
        .await?;
        self.state().ready(class).insert(name, envelope);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_take().await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL.min(deadline - now)) => {
                    self.refresh().await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let f = self.take_in_flight(delivery.tag)?;
        let res = tokio::fs::remove_file(self.in_flight_path(f.class, &f.name)).await;
        self.unclaim(f.class, &f.name);
        match res {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery: Delivery, requeue: Requeue) -> Result<(), QueueError> {
        let f = self.take_in_flight(delivery.tag)?;
        let mut envelope = f.envelope;
        envelope.attempts = settled_attempts(&delivery, requeue);
        envelope.not_before = match requeue {
            Requeue::Retry { delay } => chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d),
            Requeue::Return => None,
        };

        let in_flight = self.in_flight_path(f.class, &f.name);
        let written = async {
            self.write_atomic(in_flight.clone(), &serde_json::to_vec(&envelope)?)
                .await?;
            tokio::fs::rename(&in_flight, self.class_dir(f.class).join(&f.name)).await?;
            Ok::<_, QueueError>(())
        }
        .await;

        let mut state = self.state();
        state.claimed.remove(&(f.class, f.name.clone()));
        match written {
            Ok(()) => {
                state.ready(f.class).insert(f.name, envelope);
                drop(state);
                self.notify.notify_one();
                Ok(())
            }
            // The file stays in `inflight/` and is returned on next startup.
            Err(e) => Err(e),
        }
    }

    fn depth(&self, priority: Priority) -> usize {
        self.state().ready(priority).len()
    }

    fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}

fn class_dir_name(class: Priority) -> &'static str {
    class.label()
}

fn split_in_flight_name(file_name: &str) -> Option<(Priority, &str)> {
    let (class, name) = file_name.split_once('~')?;
    let class = Priority::ALL.into_iter().find(|p| p.label() == class)?;
    Some((class, name))
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}
