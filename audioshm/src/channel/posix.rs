use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

use tracing::debug;

use super::{ControlChannel, Message, MESSAGE_SIZE};
use crate::errors::{AudioShmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Receive,
    Send,
}

/// A kernel-persisted POSIX message queue. Opening creates the queue when it does not
/// exist yet, so either side may start first.
pub struct PosixQueue {
    mqd: libc::mqd_t,
    name: String,
    buf: Vec<u8>,
    open: bool,
}

impl PosixQueue {
    pub fn open(name: &str, access: Access, max_messages: usize) -> Result<PosixQueue> {
        let cname = CString::new(name)
            .map_err(|_| AudioShmError::Config(format!("queue name {:?} contains NUL", name)))?;
        let mut attr: libc::mq_attr = unsafe { mem::zeroed() };
        attr.mq_maxmsg = max_messages.max(1) as libc::c_long;
        attr.mq_msgsize = MESSAGE_SIZE as libc::c_long;
        let oflag = libc::O_CREAT
            | match access {
                Access::Receive => libc::O_RDONLY,
                Access::Send => libc::O_WRONLY,
            };
        let mode: libc::mode_t = 0o660;
        let mqd = unsafe {
            libc::mq_open(
                cname.as_ptr(),
                oflag,
                mode as libc::c_uint,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mqd == -1 as libc::mqd_t {
            return Err(queue_error(name, io::Error::last_os_error()));
        }

        // A queue created earlier may carry a larger message size; receive buffers
        // must be at least that large.
        let mut current: libc::mq_attr = unsafe { mem::zeroed() };
        if unsafe { libc::mq_getattr(mqd, &mut current) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::mq_close(mqd) };
            return Err(queue_error(name, err));
        }
        let msg_size = (current.mq_msgsize as usize).max(MESSAGE_SIZE);
        debug!(queue = name, ?access, max_messages = current.mq_maxmsg, msg_size, "opened queue");
        Ok(PosixQueue {
            mqd,
            name: name.to_string(),
            buf: vec![0u8; msg_size],
            open: true,
        })
    }

    /// Removes the queue name. Processes holding it open keep working.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = CString::new(name)
            .map_err(|_| AudioShmError::Config(format!("queue name {:?} contains NUL", name)))?;
        if unsafe { libc::mq_unlink(cname.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(queue_error(name, err));
            }
        }
        Ok(())
    }
}

fn queue_error(name: &str, source: io::Error) -> AudioShmError {
    AudioShmError::Queue {
        name: name.to_string(),
        source,
    }
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now: libc::timespec = unsafe { mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let mut sec = now.tv_sec as i64 + timeout.as_secs() as i64;
    let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    ts.tv_sec = sec as libc::time_t;
    ts.tv_nsec = nsec as _;
    ts
}

impl ControlChannel for PosixQueue {
    fn send(&mut self, msg: Message) -> Result<()> {
        let bytes = msg.encode();
        loop {
            let rc = unsafe {
                libc::mq_send(self.mqd, bytes.as_ptr() as *const libc::c_char, bytes.len(), 0)
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(queue_error(&self.name, err));
            }
        }
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        loop {
            let n = match timeout {
                Some(t) => {
                    let deadline = deadline_after(t);
                    unsafe {
                        libc::mq_timedreceive(
                            self.mqd,
                            self.buf.as_mut_ptr() as *mut libc::c_char,
                            self.buf.len(),
                            ptr::null_mut(),
                            &deadline,
                        )
                    }
                }
                None => unsafe {
                    libc::mq_receive(
                        self.mqd,
                        self.buf.as_mut_ptr() as *mut libc::c_char,
                        self.buf.len(),
                        ptr::null_mut(),
                    )
                },
            };
            if n >= 0 {
                return Message::decode(&self.buf[..n as usize]).map(Some);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(None),
                Some(libc::EINTR) if timeout.is_some() => return Ok(None),
                Some(libc::EINTR) => continue,
                _ => return Err(queue_error(&self.name, err)),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if unsafe { libc::mq_close(self.mqd) } == -1 {
            return Err(queue_error(&self.name, io::Error::last_os_error()));
        }
        debug!(queue = self.name.as_str(), "closed queue");
        Ok(())
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
