//! Per-peripheral task plumbing for radio backends
//!
//! [`PeripheralWorkers`] runs the commands for one peripheral strictly in
//! submission order while different peripherals and adapter-wide commands
//! proceed independently. [`Forwarders`] keeps at most one notification
//! forwarder alive per peripheral.

use crate::infrastructure::bluetooth::protocol::{PeripheralHandle, RadioCommand};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One ordered command queue per peripheral
pub struct PeripheralWorkers<F> {
    perform: F,
    queues: HashMap<PeripheralHandle, mpsc::UnboundedSender<RadioCommand>>,
}

impl<F, Fut> PeripheralWorkers<F>
where
    F: Fn(RadioCommand) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(perform: F) -> Self {
        Self {
            perform,
            queues: HashMap::new(),
        }
    }

    /// Queue `command` behind earlier commands for the same peripheral.
    /// Commands without a peripheral run on their own task.
    pub fn dispatch(&mut self, peripheral: Option<PeripheralHandle>, command: RadioCommand) {
        let Some(peripheral) = peripheral else {
            tokio::spawn((self.perform)(command));
            return;
        };

        let command = match self.queues.get(&peripheral) {
            Some(queue) => match queue.send(command) {
                Ok(()) => return,
                // Worker is gone; start a fresh one below
                Err(mpsc::error::SendError(command)) => command,
            },
            None => command,
        };

        debug!("Starting command worker for {}", peripheral);
        let queue = spawn_worker(self.perform.clone());
        if queue.send(command).is_ok() {
            self.queues.insert(peripheral, queue);
        }
    }

    /// Number of peripherals with a command queue
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

fn spawn_worker<F, Fut>(perform: F) -> mpsc::UnboundedSender<RadioCommand>
where
    F: Fn(RadioCommand) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (sender, mut receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(command) = receiver.recv().await {
            perform(command).await;
        }
    });
    sender
}

/// Notification forwarder tasks, at most one live task per peripheral
#[derive(Default)]
pub struct Forwarders {
    tasks: HashMap<PeripheralHandle, JoinHandle<()>>,
}

impl Forwarders {
    pub fn is_live(&self, peripheral: PeripheralHandle) -> bool {
        self.tasks
            .get(&peripheral)
            .is_some_and(|task| !task.is_finished())
    }

    /// Track `task` for `peripheral`, aborting any task it replaces
    pub fn insert(&mut self, peripheral: PeripheralHandle, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(peripheral, task) {
            previous.abort();
        }
    }
}

impl Drop for Forwarders {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::codec::RawPayload;
    use crate::infrastructure::bluetooth::protocol::CharacteristicHandle;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn write(value: u8) -> RadioCommand {
        RadioCommand::WriteValue {
            characteristic: CharacteristicHandle(1),
            value: RawPayload::from([value]),
            with_response: true,
        }
    }

    type Performed = Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Records commands; the write of 1 takes longest
    fn recorder(
        log: Arc<Mutex<Vec<RadioCommand>>>,
    ) -> impl Fn(RadioCommand) -> Performed + Clone + Send + 'static {
        move |command: RadioCommand| -> Performed {
            let log = Arc::clone(&log);
            Box::pin(async move {
                if command == write(1) {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
                log.lock().unwrap().push(command);
            })
        }
    }

    #[tokio::test]
    async fn test_commands_for_one_peripheral_keep_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut workers = PeripheralWorkers::new(recorder(Arc::clone(&log)));
        let peripheral = Some(PeripheralHandle(1));

        workers.dispatch(peripheral, write(1));
        workers.dispatch(peripheral, write(0));
        workers.dispatch(peripheral, RadioCommand::ReadValue(CharacteristicHandle(1)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(workers.len(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                write(1),
                write(0),
                RadioCommand::ReadValue(CharacteristicHandle(1))
            ]
        );
    }

    #[tokio::test]
    async fn test_peripherals_do_not_wait_on_each_other() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut workers = PeripheralWorkers::new(recorder(Arc::clone(&log)));

        workers.dispatch(Some(PeripheralHandle(1)), write(1));
        workers.dispatch(Some(PeripheralHandle(2)), write(0));
        workers.dispatch(None, RadioCommand::StopScan);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(workers.len(), 2);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.last(), Some(&write(1)));
    }

    #[tokio::test]
    async fn test_one_forwarder_per_peripheral() {
        let mut forwarders = Forwarders::default();
        let peripheral = PeripheralHandle(1);
        assert!(!forwarders.is_live(peripheral));

        let first = Arc::new(());
        let held = Arc::clone(&first);
        forwarders.insert(
            peripheral,
            tokio::spawn(async move {
                let _held = held;
                std::future::pending::<()>().await;
            }),
        );
        assert!(forwarders.is_live(peripheral));

        // Replacing aborts the previous forwarder
        forwarders.insert(peripheral, tokio::spawn(std::future::pending::<()>()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&first), 1);
        assert!(forwarders.is_live(peripheral));
    }

    #[tokio::test]
    async fn test_finished_forwarder_is_not_live() {
        let mut forwarders = Forwarders::default();
        let peripheral = PeripheralHandle(1);

        forwarders.insert(peripheral, tokio::spawn(async {}));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!forwarders.is_live(peripheral));
    }
}
