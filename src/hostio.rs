//! Server-initiated file operations carried over `F` packets (spec §4.6).
//!
//! A primitive builds an `F<name>,<args>` request, registers a reply waiter,
//! and sends it through the shared [`Transport`]; the connection's dispatch
//! loop feeds incoming `F` replies back in here via [`HostIo::handle_reply`].
//! Requests are serialised FIFO by `order_lock`, which spans "register the
//! waiter" and "write the frame" as one atomic step — this collapses the
//! originally separate "may send" / "got reply" waiter queues into a single
//! critical section, since `tokio` tasks don't need the explicit
//! suspend/resume plumbing a single-threaded coroutine executor would.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use crate::error::{Error, Result};
use crate::scratch::ScratchMemory;
use crate::transport::Transport;

/// Object-safe view of [`HostIo`]'s primitives, independent of the
/// connection's socket type. This is the seam a [`crate::debugger::Debugger`]
/// uses to drive Host I/O from `on_continue` without the dispatch loop
/// blocking on it: the call runs on its own task, and its `F` reply is
/// resolved by the dispatch loop's ordinary receive path
/// ([`HostIo::handle_reply`]), which keeps servicing the socket the whole
/// time.
#[async_trait]
pub trait HostIoHandle: Send + Sync {
    async fn open(&self, path: &str, flags: i32, mode: i32) -> Result<i32>;
    async fn read(&self, fd: i32, count: usize) -> Result<Vec<u8>>;
    async fn pread(&self, fd: i32, count: usize, offset: i64) -> Result<Vec<u8>>;
    async fn write(&self, fd: i32, data: &[u8]) -> Result<usize>;
    async fn pwrite(&self, fd: i32, data: &[u8], offset: i64) -> Result<usize>;
    async fn lseek(&self, fd: i32, offset: i64, whence: i32) -> Result<i64>;
    async fn close(&self, fd: i32) -> Result<()>;
    async fn unlink(&self, path: &str) -> Result<()>;
    async fn system(&self, command: &str) -> Result<i32>;
}

/// A parsed `F<retcode>[,<errno>][,C][;<attachment>]` reply.
#[derive(Debug, Clone)]
pub struct HostIoReply {
    pub retcode: i64,
    pub errno: Option<i32>,
    pub ctrl_c: bool,
    pub attachment: Option<Vec<u8>>,
}

/// Host I/O errno values, per the RSP mapping (spec §6).
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EBADF: i32 = 9;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENFILE: i32 = 23;
    pub const EMFILE: i32 = 24;
    pub const EFBIG: i32 = 27;
    pub const ENOSPC: i32 = 28;
    pub const ESPIPE: i32 = 29;
    pub const EROFS: i32 = 30;
    pub const ENAMETOOLONG: i32 = 91;
    pub const EUNKNOWN: i32 = 9999;
}

/// `lseek` whence values (POSIX numbering, as used by the wire protocol).
pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

pub struct HostIo<S> {
    transport: Arc<Transport<S>>,
    scratch: Arc<Mutex<ScratchMemory>>,
    pending: Mutex<VecDeque<oneshot::Sender<HostIoReply>>>,
    order_lock: Mutex<()>,
}

impl<S> HostIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(transport: Arc<Transport<S>>, scratch: Arc<Mutex<ScratchMemory>>) -> Self {
        Self {
            transport,
            scratch,
            pending: Mutex::new(VecDeque::new()),
            order_lock: Mutex::new(()),
        }
    }

    #[tracing::instrument(name = "gdb::hostio", skip(self, args))]
    async fn call(&self, name: &str, args: &str) -> Result<HostIoReply> {
        let frame = if args.is_empty() {
            format!("F{name}")
        } else {
            format!("F{name},{args}")
        };
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.order_lock.lock().await;
            self.pending.lock().await.push_back(tx);
            self.transport.send_packet(frame.as_bytes()).await?;
        }
        rx.await.map_err(|_| Error::Cancelled)
    }

    fn check_retcode(reply: &HostIoReply) -> Result<()> {
        if reply.retcode < 0 {
            return Err(Error::HostIoFailure {
                errno: reply.errno.unwrap_or(errno::EUNKNOWN),
            });
        }
        Ok(())
    }

    /// `Fopen,<filename-ptr>/<len>,<flags-hex>,<mode-hex>`.
    pub async fn open(&self, path: &str, flags: i32, mode: i32) -> Result<i32> {
        let bytes = path.as_bytes();
        let ptr = {
            let mut scratch = self.scratch.lock().await;
            scratch.alloc(bytes, true)
        };
        let args = format!("{:x}/{:x},{:x},{:x}", ptr, bytes.len() + 1, flags, mode);
        let reply = self.call("open", &args).await?;
        Self::check_retcode(&reply)?;
        Ok(reply.retcode as i32)
    }

    /// `Fread,<fd-hex>,<buf-ptr-hex>,<count-hex>`.
    pub async fn read(&self, fd: i32, count: usize) -> Result<Vec<u8>> {
        let ptr = {
            let mut scratch = self.scratch.lock().await;
            scratch.alloc(&vec![0u8; count], false)
        };
        let args = format!("{:x},{:x},{:x}", fd, ptr, count);
        let reply = self.call("read", &args).await?;
        Self::check_retcode(&reply)?;
        let n = reply.retcode as usize;
        let scratch = self.scratch.lock().await;
        Ok(scratch.read(ptr, n).unwrap_or(&[]).to_vec())
    }

    /// `read` preceded by an `lseek` to `offset` from the start of the file.
    pub async fn pread(&self, fd: i32, count: usize, offset: i64) -> Result<Vec<u8>> {
        self.lseek(fd, offset, SEEK_SET).await?;
        self.read(fd, count).await
    }

    /// `Fwrite,<fd-hex>,<buf-ptr-hex>,<count-hex>`.
    pub async fn write(&self, fd: i32, data: &[u8]) -> Result<usize> {
        let ptr = {
            let mut scratch = self.scratch.lock().await;
            scratch.alloc(data, false)
        };
        let args = format!("{:x},{:x},{:x}", fd, ptr, data.len());
        let reply = self.call("write", &args).await?;
        Self::check_retcode(&reply)?;
        Ok(reply.retcode as usize)
    }

    /// `write` preceded by an `lseek` to `offset` from the start of the file.
    pub async fn pwrite(&self, fd: i32, data: &[u8], offset: i64) -> Result<usize> {
        self.lseek(fd, offset, SEEK_SET).await?;
        self.write(fd, data).await
    }

    /// `Flseek,<fd-hex>,<offset-hex>,<whence-hex>`.
    pub async fn lseek(&self, fd: i32, offset: i64, whence: i32) -> Result<i64> {
        let args = format!("{:x},{:x},{:x}", fd, offset, whence);
        let reply = self.call("lseek", &args).await?;
        Self::check_retcode(&reply)?;
        Ok(reply.retcode)
    }

    /// `Fclose,<fd-hex>`.
    pub async fn close(&self, fd: i32) -> Result<()> {
        let args = format!("{:x}", fd);
        let reply = self.call("close", &args).await?;
        Self::check_retcode(&reply)
    }

    /// `Funlink,<path>` — the path is sent hex-encoded in place, unlike
    /// `open`/`system` which pass a scratch-memory pointer.
    pub async fn unlink(&self, path: &str) -> Result<()> {
        let hex: String = path.bytes().map(|b| format!("{b:02x}")).collect();
        let reply = self.call("unlink", &hex).await?;
        Self::check_retcode(&reply)
    }

    /// `Fsystem,<cmd-ptr>/<len>`.
    pub async fn system(&self, command: &str) -> Result<i32> {
        let bytes = command.as_bytes();
        let ptr = {
            let mut scratch = self.scratch.lock().await;
            scratch.alloc(bytes, true)
        };
        let args = format!("{:x}/{:x}", ptr, bytes.len() + 1);
        let reply = self.call("system", &args).await?;
        Self::check_retcode(&reply)?;
        Ok(reply.retcode as i32)
    }

    /// Drops every outstanding reply waiter, causing each in-flight
    /// primitive's `rx.await` to fail with [`Error::Cancelled`]. Called when
    /// the owning connection is stopped so no Host I/O call is left hanging.
    pub async fn cancel_all(&self) {
        let mut pending = self.pending.lock().await;
        for waiter in pending.drain(..) {
            drop(waiter);
        }
    }

    /// Routes an incoming `F` packet body to the oldest outstanding waiter.
    /// Returns whether the reply carried the `C` (ctrl-c) flag, which the
    /// caller should forward to the Debugger Interface as a break event.
    pub async fn handle_reply(&self, body: &[u8]) -> Result<bool> {
        let reply = parse_f_reply(body)?;
        let waiter = self.pending.lock().await.pop_front();
        match waiter {
            Some(tx) => {
                let ctrl_c = reply.ctrl_c;
                if tx.send(reply).is_err() {
                    warn!("host I/O waiter dropped before its reply arrived");
                }
                Ok(ctrl_c)
            }
            None => Err(Error::UnexpectedHostIoReply),
        }
    }
}

#[async_trait]
impl<S> HostIoHandle for HostIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn open(&self, path: &str, flags: i32, mode: i32) -> Result<i32> {
        HostIo::open(self, path, flags, mode).await
    }

    async fn read(&self, fd: i32, count: usize) -> Result<Vec<u8>> {
        HostIo::read(self, fd, count).await
    }

    async fn pread(&self, fd: i32, count: usize, offset: i64) -> Result<Vec<u8>> {
        HostIo::pread(self, fd, count, offset).await
    }

    async fn write(&self, fd: i32, data: &[u8]) -> Result<usize> {
        HostIo::write(self, fd, data).await
    }

    async fn pwrite(&self, fd: i32, data: &[u8], offset: i64) -> Result<usize> {
        HostIo::pwrite(self, fd, data, offset).await
    }

    async fn lseek(&self, fd: i32, offset: i64, whence: i32) -> Result<i64> {
        HostIo::lseek(self, fd, offset, whence).await
    }

    async fn close(&self, fd: i32) -> Result<()> {
        HostIo::close(self, fd).await
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        HostIo::unlink(self, path).await
    }

    async fn system(&self, command: &str) -> Result<i32> {
        HostIo::system(self, command).await
    }
}

fn parse_f_reply(body: &[u8]) -> Result<HostIoReply> {
    let text =
        std::str::from_utf8(body).map_err(|_| Error::Malformed("non-utf8 F reply".into()))?;
    let rest = text
        .strip_prefix('F')
        .ok_or_else(|| Error::Malformed("F reply missing leading F".into()))?;

    let (rest, attachment) = match rest.split_once(';') {
        Some((head, tail)) => (head, Some(tail.as_bytes().to_vec())),
        None => (rest, None),
    };

    let mut fields = rest.split(',');
    let retcode_field = fields
        .next()
        .ok_or_else(|| Error::Malformed("empty F reply".into()))?;
    let retcode = parse_signed_hex(retcode_field)?;

    let mut parsed_errno = None;
    let mut ctrl_c = false;
    for field in fields {
        if field == "C" {
            ctrl_c = true;
        } else {
            parsed_errno = Some(
                field
                    .parse::<i32>()
                    .map_err(|_| Error::Malformed(format!("bad errno field {field:?}")))?,
            );
        }
    }

    Ok(HostIoReply {
        retcode,
        errno: parsed_errno,
        ctrl_c,
        attachment,
    })
}

fn parse_signed_hex(s: &str) -> Result<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, s),
    };
    let value = i64::from_str_radix(digits, 16)
        .map_err(|_| Error::Malformed(format!("bad hex retcode {s:?}")))?;
    Ok(if negative { -value } else { value })
}
