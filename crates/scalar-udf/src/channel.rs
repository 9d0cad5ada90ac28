use crate::{Error, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

// Delivery is a single message of the result channel.
#[derive(Debug)]
enum Delivery {
    Result(Bytes),
    Failure(anyhow::Error),
}

/// Build a channel over which a FunctionRunner hands encoded results
/// to an Operator, from any thread.
pub fn result_channel() -> (ResultSender, ResultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultSender { tx }, ResultReceiver { rx, received: 0 })
}

/// ResultSender is held by a FunctionRunner. It may be cloned so that a
/// runner's tasks can each report failures, but results must be pushed
/// from one place, in the order their calls were submitted.
#[derive(Debug, Clone)]
pub struct ResultSender {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ResultSender {
    /// Push the encoded result of the next call.
    /// Returns false if the receiver has been closed or dropped.
    pub fn push(&self, result: Bytes) -> bool {
        self.tx.send(Delivery::Result(result)).is_ok()
    }

    /// Report a fatal failure of the runner.
    /// Returns false if the receiver has been closed or dropped.
    pub fn fail(&self, error: anyhow::Error) -> bool {
        self.tx.send(Delivery::Failure(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// ResultReceiver is the operator's end of a result channel.
#[derive(Debug)]
pub struct ResultReceiver {
    rx: mpsc::UnboundedReceiver<Delivery>,
    received: u64,
}

impl ResultReceiver {
    /// Return the next available result without blocking.
    /// Ok(None) means no result is ready, or every sender is gone.
    pub fn poll(&mut self) -> Result<Option<Bytes>> {
        match self.rx.try_recv() {
            Ok(delivery) => self.deliver(delivery).map(Some),
            Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                Ok(None)
            }
        }
    }

    /// Block the calling thread until the next result is available.
    /// Ok(None) means every sender is gone.
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait(&mut self) -> Result<Option<Bytes>> {
        match self.rx.blocking_recv() {
            Some(delivery) => self.deliver(delivery).map(Some),
            None => Ok(None),
        }
    }

    /// Number of results received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Close the channel so that later pushes are refused, and discard
    /// results which were already pushed. Returns the number discarded.
    pub fn close(&mut self) -> usize {
        self.rx.close();

        let mut discarded = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            if let Delivery::Result(_) = delivery {
                discarded += 1;
            }
        }
        discarded
    }

    fn deliver(&mut self, delivery: Delivery) -> Result<Bytes> {
        match delivery {
            Delivery::Result(result) => {
                self.received += 1;
                Ok(result)
            }
            Delivery::Failure(error) => Err(Error::Runner(error)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_poll_never_blocks() {
        let (tx, mut rx) = result_channel();
        assert!(rx.poll().unwrap().is_none());

        assert!(tx.push(Bytes::from_static(b"one")));
        assert!(tx.push(Bytes::from_static(b"two")));

        assert_eq!(rx.poll().unwrap().unwrap(), "one");
        assert_eq!(rx.poll().unwrap().unwrap(), "two");
        assert!(rx.poll().unwrap().is_none());
        assert_eq!(rx.received(), 2);

        // Disconnection also polls as empty.
        std::mem::drop(tx);
        assert!(rx.poll().unwrap().is_none());
    }

    #[test]
    fn test_wait_for_push_from_another_thread() {
        let (tx, mut rx) = result_channel();

        let handle = std::thread::spawn(move || {
            for i in 0..100u32 {
                std::thread::sleep(std::time::Duration::from_micros(50));
                assert!(tx.push(Bytes::copy_from_slice(&i.to_be_bytes())));
            }
        });

        for i in 0..100u32 {
            let result = rx.wait().unwrap().unwrap();
            assert_eq!(result.as_ref(), &i.to_be_bytes());
        }
        handle.join().unwrap();

        // All senders are gone.
        assert!(rx.wait().unwrap().is_none());
    }

    #[test]
    fn test_failures_and_close() {
        let (tx, mut rx) = result_channel();

        tx.push(Bytes::from_static(b"ok"));
        tx.fail(anyhow::anyhow!("worker crashed"));

        assert_eq!(rx.wait().unwrap().unwrap(), "ok");
        insta::assert_snapshot!(rx.poll().unwrap_err(), @"function runner failed: worker crashed");

        tx.push(Bytes::from_static(b"late"));
        tx.push(Bytes::from_static(b"later"));
        assert_eq!(rx.close(), 2);

        assert!(tx.is_closed());
        assert!(!tx.push(Bytes::from_static(b"refused")));
        assert_eq!(rx.received(), 1);
    }
}
