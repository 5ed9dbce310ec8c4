use tokio::sync::watch;

/// Sender side, kept by whoever decides when to stop.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiver side handed to every task that must stop taking new work.
/// Clones observe the same signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn new_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // Fails only when every signal is gone, nobody left to stop.
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Resolves once the signal is triggered, immediately if it already was.
    /// A dropped handle counts as triggered.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|&v| v).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}
