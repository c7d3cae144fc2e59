use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::{ControlChannel, Message};
use crate::errors::{AudioShmError, Result};

/// An in-process bounded queue with the same contract as [`super::PosixQueue`].
///
/// Clones share one queue, the way two processes opening the same queue name do.
#[derive(Clone)]
pub struct LocalChannel {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        LocalChannel { tx, rx }
    }
}

impl ControlChannel for LocalChannel {
    fn send(&mut self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| AudioShmError::Protocol("queue closed".to_string()))
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        match timeout {
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(msg) => Ok(Some(msg)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(AudioShmError::Protocol("queue closed".to_string()))
                }
            },
            None => self
                .rx
                .recv()
                .map(Some)
                .map_err(|_| AudioShmError::Protocol("queue closed".to_string())),
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
