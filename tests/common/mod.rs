use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use iron_row::source::{MetricsSource, SourceLink};
use iron_row::{DeviceRole, MetricsSnapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Test side of a [`ScriptedSource`].
#[allow(dead_code)]
pub struct Feed {
    pub readings: watch::Sender<MetricsSnapshot>,
    running: Arc<AtomicUsize>,
    targets: Arc<Mutex<Vec<Option<String>>>>,
}

#[allow(dead_code)]
impl Feed {
    pub fn send(&self, snapshot: MetricsSnapshot) {
        self.readings.send_replace(snapshot);
    }
    /// Source tasks that haven't returned yet.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
    /// Bound address handed to each spawn, oldest first.
    pub fn targets(&self) -> Vec<Option<String>> {
        self.targets.lock().unwrap().clone()
    }
}

/// Forwards whatever the test pushes into its [`Feed`] until cancelled.
pub struct ScriptedSource {
    role: DeviceRole,
    feed: watch::Receiver<MetricsSnapshot>,
    running: Arc<AtomicUsize>,
    targets: Arc<Mutex<Vec<Option<String>>>>,
}

pub fn scripted(role: DeviceRole) -> (Arc<ScriptedSource>, Feed) {
    let (readings, feed) = watch::channel(MetricsSnapshot::default());
    let running = Arc::new(AtomicUsize::new(0));
    let targets = Arc::new(Mutex::new(Vec::new()));
    let source = ScriptedSource {
        role,
        feed,
        running: running.clone(),
        targets: targets.clone(),
    };
    (
        Arc::new(source),
        Feed {
            readings,
            running,
            targets,
        },
    )
}

impl MetricsSource for ScriptedSource {
    fn role(&self) -> DeviceRole {
        self.role
    }
    fn spawn(&self, link: SourceLink) -> JoinHandle<()> {
        self.targets.lock().unwrap().push(link.target.clone());
        self.running.fetch_add(1, Ordering::SeqCst);
        let running = self.running.clone();
        let mut feed = self.feed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = feed.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = *feed.borrow_and_update();
                        link.readings.send_replace(snapshot);
                    }
                    _ = link.cancel_token.cancelled() => break,
                }
            }
            running.fetch_sub(1, Ordering::SeqCst);
        })
    }
}
