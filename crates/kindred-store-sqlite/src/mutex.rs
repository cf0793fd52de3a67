//! Cross-process reader/writer coordination over the database file.
//!
//! A named three-slot SysV semaphore array, keyed off the database path:
//!
//! | Slot | Initial | Meaning |
//! |------|---------|---------|
//! | 0    | 1       | Ownership token guarding the connection count. |
//! | 1    | 0       | Connection count, incremented per attached process. |
//! | 2    | 1       | Write lock, decremented exclusively by writers. |
//!
//! Every operation carries `SEM_UNDO`, so the kernel restores the counts if
//! a process dies while holding a slot. The first process to attach (the
//! one that observes a zero connection count) is the *initial owner* and is
//! responsible for the schema upgrade.

use std::{io, path::Path};

use crate::{Error, Result};

const SLOT_OWNERSHIP: u16 = 0;
const SLOT_CONNECTIONS: u16 = 1;
const SLOT_WRITE: u16 = 2;

const INITIAL_VALUES: [i32; 3] = [1, 0, 1];

/// Derive a stable, non-zero SysV key from the database path (FNV-1a over
/// the path bytes; `ftok` is avoided because it collides on inode reuse).
fn key_for_path(path: &Path) -> libc::key_t {
  let mut hash: u32 = 0x811c_9dc5;
  for byte in path.as_os_str().as_encoded_bytes() {
    hash ^= u32::from(*byte);
    hash = hash.wrapping_mul(0x0100_0193);
  }
  let key = (hash & 0x7fff_ffff) as libc::key_t;
  if key == 0 { 1 } else { key }
}

pub struct ProcessMutex {
  sem_id:          libc::c_int,
  initial_process: bool,
}

impl ProcessMutex {
  /// Attach to (or create) the semaphore array for `path` and run the
  /// ownership protocol.
  pub fn new(path: &Path) -> Result<Self> {
    let key = key_for_path(path);
    let sem_id = attach(key)?;

    let mut mutex = Self { sem_id, initial_process: false };

    // Take the ownership token while observing the connection count; only
    // the process that sees zero connections is the initial owner.
    mutex.decrement(SLOT_OWNERSHIP)?;
    mutex.initial_process = mutex.value(SLOT_CONNECTIONS)? == 0;
    let attach_result = mutex.increment(SLOT_CONNECTIONS);
    mutex.increment(SLOT_OWNERSHIP)?;
    attach_result?;

    Ok(mutex)
  }

  /// Acquire the exclusive write lock, blocking until available. Must be
  /// held for the entire begin-to-commit window.
  pub fn lock(&self) -> Result<()> { self.decrement(SLOT_WRITE) }

  /// Release the write lock.
  pub fn unlock(&self) -> Result<()> { self.increment(SLOT_WRITE) }

  /// True when some process currently holds the write lock.
  pub fn is_locked(&self) -> Result<bool> {
    Ok(self.value(SLOT_WRITE)? == 0)
  }

  /// True when this process attached first and owns schema upgrades.
  pub fn is_initial_process(&self) -> bool { self.initial_process }

  fn op(&self, slot: u16, delta: i16) -> Result<()> {
    let mut buf = libc::sembuf {
      sem_num: slot,
      sem_op:  delta,
      sem_flg: libc::SEM_UNDO as libc::c_short,
    };
    loop {
      let rc = unsafe { libc::semop(self.sem_id, &mut buf, 1) };
      if rc == 0 {
        return Ok(());
      }
      let err = io::Error::last_os_error();
      if err.raw_os_error() == Some(libc::EINTR) {
        continue;
      }
      return Err(Error::Semaphore(format!("semop on slot {slot}: {err}")));
    }
  }

  fn decrement(&self, slot: u16) -> Result<()> { self.op(slot, -1) }

  fn increment(&self, slot: u16) -> Result<()> { self.op(slot, 1) }

  fn value(&self, slot: u16) -> Result<i32> {
    let rc =
      unsafe { libc::semctl(self.sem_id, slot as libc::c_int, libc::GETVAL) };
    if rc < 0 {
      return Err(Error::Semaphore(format!(
        "semctl GETVAL on slot {slot}: {}",
        io::Error::last_os_error()
      )));
    }
    Ok(rc)
  }
}

impl Drop for ProcessMutex {
  fn drop(&mut self) {
    // Detach by undoing our connection-count increment; the array itself is
    // left for other attached processes. SEM_UNDO covers abnormal exit.
    let _ = self.op(SLOT_CONNECTIONS, -1);
  }
}

/// Create the array with the initial slot values, or attach to an existing
/// one, waiting out the creation race (`sem_otime` stays zero until the
/// creator's first `semop`).
fn attach(key: libc::key_t) -> Result<libc::c_int> {
  let created = unsafe {
    libc::semget(key, 3, libc::IPC_CREAT | libc::IPC_EXCL | 0o666)
  };
  if created >= 0 {
    for (slot, value) in INITIAL_VALUES.iter().enumerate() {
      let rc = unsafe {
        libc::semctl(created, slot as libc::c_int, libc::SETVAL, *value)
      };
      if rc < 0 {
        return Err(Error::Semaphore(format!(
          "semctl SETVAL: {}",
          io::Error::last_os_error()
        )));
      }
    }
    // A dummy no-op operation stamps sem_otime so attachers can proceed.
    let mut buf = libc::sembuf { sem_num: 0, sem_op: 0, sem_flg: 0 };
    unsafe { libc::semop(created, &mut buf, 1) };
    return Ok(created);
  }

  let err = io::Error::last_os_error();
  if err.raw_os_error() != Some(libc::EEXIST) {
    return Err(Error::Semaphore(format!("semget: {err}")));
  }

  let sem_id = unsafe { libc::semget(key, 3, 0o666) };
  if sem_id < 0 {
    return Err(Error::Semaphore(format!(
      "semget attach: {}",
      io::Error::last_os_error()
    )));
  }

  // Wait until the creator has initialised the slot values.
  for _ in 0..100 {
    let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
    let rc = unsafe {
      libc::semctl(sem_id, 0, libc::IPC_STAT, &raw mut ds)
    };
    if rc == 0 && ds.sem_otime != 0 {
      return Ok(sem_id);
    }
    std::thread::sleep(std::time::Duration::from_millis(10));
  }
  Err(Error::Semaphore("semaphore array never initialised".into()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn keys_are_stable_and_nonzero() {
    let a = key_for_path(Path::new("/tmp/contacts.db"));
    let b = key_for_path(Path::new("/tmp/contacts.db"));
    let c = key_for_path(Path::new("/tmp/other.db"));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a > 0);
  }

  #[test]
  fn lock_cycle() {
    let dir = std::env::temp_dir().join(format!(
      "kindred-mutex-test-{}",
      std::process::id()
    ));
    let mutex = ProcessMutex::new(&dir).unwrap();
    assert!(mutex.is_initial_process());
    assert!(!mutex.is_locked().unwrap());

    mutex.lock().unwrap();
    assert!(mutex.is_locked().unwrap());
    mutex.unlock().unwrap();
    assert!(!mutex.is_locked().unwrap());
  }
}
