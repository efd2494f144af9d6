use tokio::sync::watch;

/// One-shot barrier carrying a value: opened once, awaited by any number
/// of tasks, before or after the opening. Used for the session id, the
/// initial warp, and the all-sources-known gate.
pub struct Latch<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Opens the latch. The first open wins; later calls are ignored and
    /// return false.
    pub fn open(&self, value: T) -> bool {
        let mut slot = Some(value);
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = slot.take();
                true
            } else {
                false
            }
        })
    }

    pub fn is_open(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let slot = rx
            .wait_for(|value| value.is_some())
            .await
            .expect("latch sender dropped while waiting");
        slot.clone().expect("latch observed open without a value")
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}
