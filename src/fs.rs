//! Stand-in for the on-disk/in-memory file system and open-file table,
//! which §1 lists as an external collaborator (`namei`, `idup`, `iput`,
//! `fileclose`, `filedup`, `begin_op`, `end_op`, `fsinit`). The core only
//! needs reference-counted handles it can duplicate on `fork` and drop on
//! `exit`/`freeproc`; it never reads or writes file contents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A reference-counted open file, standing in for xv6's `struct file` /
/// `RcFile`. Cloning it and dropping the clones is what `filedup`/
/// `fileclose` do in the real kernel; here that's just `Arc`'s refcount.
#[derive(Debug)]
pub struct FileHandle {
    path: String,
}

impl FileHandle {
    pub fn open(path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { path: path.into() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// How many open-file-table slots (across all processes) refer to this
    /// file. Used by tests to check P7 ("same file descriptor bindings...
    /// refcount incremented").
    pub fn refcount(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }
}

/// `filedup`: increments the file's reference count and returns a new
/// handle to the same underlying file.
pub fn filedup(f: &Arc<FileHandle>) -> Arc<FileHandle> {
    Arc::clone(f)
}

/// `fileclose`: drops this process's reference. The file is only actually
/// closed once the last `Arc` is dropped.
pub fn fileclose(f: Arc<FileHandle>) {
    drop(f);
}

/// A reference-counted inode, standing in for `RcInode`.
#[derive(Debug)]
pub struct Inode {
    path: String,
}

impl Inode {
    fn new(path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { path: path.into() })
    }
}

/// `idup`: increments the inode's reference count.
pub fn idup(ip: &Arc<Inode>) -> Arc<Inode> {
    Arc::clone(ip)
}

/// `iput`: drops this process's reference.
pub fn iput(ip: Arc<Inode>) {
    drop(ip);
}

/// `namei`: resolves a path to an inode. The host stand-in never fails and
/// never touches a disk.
pub fn namei(path: &str) -> Arc<Inode> {
    Inode::new(path)
}

static FS_INITIALIZED: AtomicUsize = AtomicUsize::new(0);

/// `fsinit(dev)`: one-shot file-system initialization, run once from the
/// context of the first scheduled process (`forkret`) because the real
/// version calls `sleep`. Idempotent: later callers observe it already ran.
pub fn fsinit(_dev: u32) {
    FS_INITIALIZED.fetch_add(1, Ordering::SeqCst);
}

pub fn fsinit_count() -> usize {
    FS_INITIALIZED.load(Ordering::SeqCst)
}

/// `begin_op`/`end_op`: brackets a file-system transaction. The host
/// stand-in has no log to flush, but keeping the RAII shape means callers
/// that rely on `Drop`-at-scope-exit (e.g. closing `cwd` during `exit`)
/// read the same as the real kernel.
pub struct Transaction;

pub fn begin_op() -> Transaction {
    Transaction
}

impl Drop for Transaction {
    fn drop(&mut self) {}
}
