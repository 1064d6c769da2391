use tokio::sync::watch;

/// Signals the scheduler loop that something changed: a new request
/// arrived, a usage was released, or a backend status changed (spec §4.4
/// step 4, "Wait"). A `watch` channel rather than a `Notify` because the
/// scheduler's wait also needs to race against a tick-interval timeout, and
/// `watch::Receiver::changed()` composes cleanly with `tokio::select!`
/// alongside `tokio::time::sleep`.
#[derive(Clone)]
pub struct Waker {
    tx: watch::Sender<u64>,
}

pub struct WakeListener {
    rx: watch::Receiver<u64>,
}

impl Waker {
    pub fn new() -> (Self, WakeListener) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, WakeListener { rx })
    }

    pub fn wake(&self) {
        self.tx.send_modify(|n| *n = n.wrapping_add(1));
    }
}

impl WakeListener {
    /// Wait for a wake signal or `timeout`, whichever comes first.
    pub async fn wait(&mut self, timeout: std::time::Duration) {
        let _ = tokio::time::timeout(timeout, self.rx.changed()).await;
    }
}
