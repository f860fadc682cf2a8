pub mod error;
pub mod header;
pub mod waker;

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
