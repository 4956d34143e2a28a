//! Lock helpers that ignore poisoning.
//!
//! A panicking [`populate`](crate::ResourceFactory::populate) must not render its entry, or the
//! whole cache, unusable. All invariants protected by these locks are restored by drop guards,
//! so it is fine to keep using the data after a panic.
use std::sync::{
    Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    TryLockError,
};

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Read-locks `shared` and write-locks `exclusive`, without ever blocking on one of them while
/// holding the other.
///
/// Other threads may therefore take the two locks in any order without deadlocking against us.
pub fn read_and_write<'a, S, E>(
    shared: &'a RwLock<S>,
    exclusive: &'a RwLock<E>,
) -> (RwLockReadGuard<'a, S>, RwLockWriteGuard<'a, E>) {
    loop {
        let read_guard = read(shared);
        match exclusive.try_write() {
            Ok(guard) => return (read_guard, guard),
            Err(TryLockError::Poisoned(poisoned)) => return (read_guard, poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => drop(read_guard),
        }

        let write_guard = write(exclusive);
        match shared.try_read() {
            Ok(guard) => return (guard, write_guard),
            Err(TryLockError::Poisoned(poisoned)) => return (poisoned.into_inner(), write_guard),
            Err(TryLockError::WouldBlock) => drop(write_guard),
        }

        std::thread::yield_now();
    }
}
