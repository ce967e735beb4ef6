//! Cross-process summary region.
//!
//! A fixed `#[repr(C)]` block in POSIX shared memory: a process-shared
//! `pthread_mutex_t` followed by the published summary fields. The server
//! is the only writer; any number of unrelated processes may map the same
//! name and read it, honouring the lock to avoid torn reads.
//!
//! This lock is deliberately a different type from the in-process
//! `parking_lot::Mutex` guarding the sample window: it lives inside the
//! mapping itself so every process that maps the region shares it.

use std::cell::UnsafeCell;
use std::ffi::{CStr, CString};
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::metrics::StatsSnapshot;

// ─── Layout ──────────────────────────────────────────────────────

/// Summary fields as they sit in shared memory, after the lock.
///
/// The first five fields match what external readers expect;
/// `last_received` is appended so the request loop never writes a field
/// the publisher owns.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SummaryFields {
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub count: i32,
    /// Unix seconds of the last publish tick
    pub last_updated: i64,
    /// Unix seconds of the last request handled
    pub last_received: i64,
}

#[repr(C)]
struct RegionLayout {
    lock: UnsafeCell<libc::pthread_mutex_t>,
    fields: UnsafeCell<SummaryFields>,
}

/// Bytes every mapping of the region must cover.
pub const REGION_SIZE: usize = mem::size_of::<RegionLayout>();

// ─── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("invalid region name {0:?}")]
    InvalidName(String),

    #[error("region is {actual} bytes, expected at least {expected}")]
    TooSmall { actual: usize, expected: usize },

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

fn last_os_error(op: &'static str) -> RegionError {
    RegionError::Os {
        op,
        source: io::Error::last_os_error(),
    }
}

/// pthread calls return the error code instead of setting errno.
fn pthread_result(op: &'static str, rc: libc::c_int) -> Result<(), RegionError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(RegionError::Os {
            op,
            source: io::Error::from_raw_os_error(rc),
        })
    }
}

// ─── Public types ────────────────────────────────────────────────

/// A mapped summary region. Dropping it unmaps but never unlinks.
pub struct SharedRegion {
    layout: NonNull<RegionLayout>,
}

// SAFETY: the fields are only touched while holding the process-shared
// mutex, which also serialises threads within this process.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

/// Plain copy of the region taken under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegionSummary {
    pub count: i32,
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub last_updated: DateTime<Utc>,
    pub last_received: DateTime<Utc>,
}

/// Exclusive access to the summary fields. Unlocks on drop.
/// Not `Send`: a pthread mutex must be released by the thread that took it.
pub struct RegionGuard<'a> {
    region: &'a SharedRegion,
    _not_send: PhantomData<*const ()>,
}

// ─── SharedRegion impl ───────────────────────────────────────────

impl SharedRegion {
    /// Create (or take over) the named region and initialise its lock
    /// and fields. Used once by the server at startup.
    pub fn create(name: &str) -> Result<Self, RegionError> {
        let c_name = c_name(name)?;

        // SAFETY: plain libc calls on a valid C string; the fd is closed on
        // every path after mapping.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o666 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(last_os_error("shm_open"));
        }
        // Any failure from here on removes the name again.
        let name_guard = UnlinkOnError::new(&c_name);

        if unsafe { libc::ftruncate(fd, REGION_SIZE as libc::off_t) } == -1 {
            let err = last_os_error("ftruncate");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let region = map_fd(fd);
        unsafe { libc::close(fd) };
        let region = region?;

        region.initialise()?;
        name_guard.disarm();
        Ok(region)
    }

    /// Map an existing region without touching its contents.
    /// This is how external readers attach.
    pub fn open(name: &str) -> Result<Self, RegionError> {
        let c_name = c_name(name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(last_os_error("shm_open"));
        }

        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            let err = last_os_error("fstat");
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let actual = stat.st_size as usize;
        if actual < REGION_SIZE {
            unsafe { libc::close(fd) };
            return Err(RegionError::TooSmall {
                actual,
                expected: REGION_SIZE,
            });
        }

        let region = map_fd(fd);
        unsafe { libc::close(fd) };
        region
    }

    /// An unnamed region with the same layout, shared only with children
    /// forked after creation. Handy for tests.
    pub fn anonymous() -> Result<Self, RegionError> {
        // SAFETY: anonymous shared mapping, zero-filled by the kernel.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                REGION_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(last_os_error("mmap"));
        }

        let region = Self::from_addr(addr);
        region.initialise()?;
        Ok(region)
    }

    /// Remove the name. Existing mappings stay valid until dropped.
    /// Only called on deliberate server teardown.
    pub fn unlink(name: &str) -> Result<(), RegionError> {
        let c_name = c_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
            return Err(last_os_error("shm_unlink"));
        }
        Ok(())
    }

    pub fn lock(&self) -> Result<RegionGuard<'_>, RegionError> {
        // SAFETY: the mutex was initialised by `initialise` in this or
        // another process before the region was handed out.
        let rc = unsafe { libc::pthread_mutex_lock(self.layout().lock.get()) };
        pthread_result("pthread_mutex_lock", rc)?;
        Ok(RegionGuard {
            region: self,
            _not_send: PhantomData,
        })
    }

    /// Write a full snapshot. Leaves `last_received` alone.
    pub fn publish(&self, snapshot: &StatsSnapshot) -> Result<(), RegionError> {
        let mut fields = self.lock()?;
        fields.average = snapshot.average;
        fields.minimum = snapshot.minimum;
        fields.maximum = snapshot.maximum;
        fields.count = i32::try_from(snapshot.count).unwrap_or(i32::MAX);
        fields.last_updated = snapshot.timestamp.timestamp();
        Ok(())
    }

    /// Record that a request arrived at `at`. Touches nothing else.
    pub fn touch_received(&self, at: DateTime<Utc>) -> Result<(), RegionError> {
        self.lock()?.last_received = at.timestamp();
        Ok(())
    }

    pub fn read(&self) -> Result<RegionSummary, RegionError> {
        let fields = *self.lock()?;
        Ok(RegionSummary {
            count: fields.count,
            average: fields.average,
            minimum: fields.minimum,
            maximum: fields.maximum,
            last_updated: from_unix(fields.last_updated),
            last_received: from_unix(fields.last_received),
        })
    }

    // ── Internals ───────────────────────────────────────────────

    fn from_addr(addr: *mut libc::c_void) -> Self {
        Self {
            layout: NonNull::new(addr.cast::<RegionLayout>())
                .unwrap_or_else(NonNull::dangling),
        }
    }

    fn layout(&self) -> &RegionLayout {
        // SAFETY: the mapping is REGION_SIZE bytes and lives until drop.
        unsafe { self.layout.as_ref() }
    }

    /// Make the lock process-shared and reset the summary to zero.
    fn initialise(&self) -> Result<(), RegionError> {
        let now = Utc::now().timestamp();

        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            pthread_result("pthread_mutexattr_init", libc::pthread_mutexattr_init(&mut attr))?;

            let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if rc == 0 {
                let rc = libc::pthread_mutex_init(self.layout().lock.get(), &attr);
                libc::pthread_mutexattr_destroy(&mut attr);
                pthread_result("pthread_mutex_init", rc)?;
            } else {
                libc::pthread_mutexattr_destroy(&mut attr);
                pthread_result("pthread_mutexattr_setpshared", rc)?;
            }

            // Nobody else can hold the lock yet.
            ptr::write(
                self.layout().fields.get(),
                SummaryFields {
                    average: 0.0,
                    minimum: 0.0,
                    maximum: 0.0,
                    count: 0,
                    last_updated: now,
                    last_received: now,
                },
            );
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.layout.as_ptr().cast(), REGION_SIZE);
        }
    }
}

// ─── RegionGuard impl ────────────────────────────────────────────

impl Deref for RegionGuard<'_> {
    type Target = SummaryFields;

    fn deref(&self) -> &SummaryFields {
        // SAFETY: the guard holds the region lock.
        unsafe { &*self.region.layout().fields.get() }
    }
}

impl DerefMut for RegionGuard<'_> {
    fn deref_mut(&mut self) -> &mut SummaryFields {
        // SAFETY: the guard holds the region lock exclusively.
        unsafe { &mut *self.region.layout().fields.get() }
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.region.layout().lock.get());
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

/// Unlinks a freshly created name on drop unless `disarm`ed.
struct UnlinkOnError<'a> {
    name: &'a CStr,
    armed: bool,
}

impl<'a> UnlinkOnError<'a> {
    fn new(name: &'a CStr) -> Self {
        Self { name, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for UnlinkOnError<'_> {
    fn drop(&mut self) {
        if self.armed {
            unsafe { libc::shm_unlink(self.name.as_ptr()) };
        }
    }
}

fn c_name(name: &str) -> Result<CString, RegionError> {
    CString::new(name).map_err(|_| RegionError::InvalidName(name.to_owned()))
}

fn map_fd(fd: libc::c_int) -> Result<SharedRegion, RegionError> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            REGION_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(last_os_error("mmap"));
    }
    Ok(SharedRegion::from_addr(addr))
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
